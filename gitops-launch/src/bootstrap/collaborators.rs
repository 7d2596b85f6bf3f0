//! Interfaces of the external systems the launch core drives.
//!
//! Mutating operations carry no dry-run flag: the orchestrator decides
//! whether to call them at all. Read-only and status operations take
//! `dry_run` so adapters can short-circuit without touching the cluster.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScmProvider {
    #[default]
    Gitlab,
    Github,
}

impl ScmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            ScmProvider::Gitlab => "gitlab",
            ScmProvider::Github => "github",
        }
    }

    pub fn token_env(self) -> &'static str {
        match self {
            ScmProvider::Gitlab => "GITLAB_TOKEN",
            ScmProvider::Github => "GITHUB_TOKEN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "gitlab" => Some(ScmProvider::Gitlab),
            "github" => Some(ScmProvider::Github),
            _ => None,
        }
    }
}

impl fmt::Display for ScmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials accepted by the SCM provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmAuth {
    pub token: String,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmInitParams {
    pub provider: ScmProvider,
    pub token: String,
    pub owner: String,
    pub repositories: Vec<String>,
    pub teams: Vec<String>,
}

/// A local repository and the remote it is pushed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub name: String,
    pub remote_name: String,
    pub remote_url: String,
}

/// Local end of a live tunnel. `tunnel_id` identifies which acquisition
/// produced it, so a stale endpoint can be told apart from a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardEndpoint {
    pub tunnel_id: u64,
    pub local_port: u16,
}

impl ForwardEndpoint {
    pub fn http_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// Health of a deployed application as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppHealth {
    pub sync_status: String,
    pub health_status: String,
}

impl AppHealth {
    pub fn synced() -> Self {
        Self {
            sync_status: "Synced".to_string(),
            health_status: "Healthy".to_string(),
        }
    }

    pub fn out_of_sync() -> Self {
        Self {
            sync_status: "OutOfSync".to_string(),
            health_status: "Progressing".to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.sync_status == "Synced"
    }
}

#[async_trait]
pub trait InfraEngine: Send + Sync {
    async fn apply_base(&self, workdir: &Path) -> Result<()>;

    /// Apply the SCM-side infrastructure (repositories, teams, hooks).
    async fn apply_scm(&self, workdir: &Path) -> Result<()>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Block until every pod matching `label_selector` in `namespace` is ready.
    async fn wait_for_workload(&self, dry_run: bool, namespace: &str, label_selector: &str)
    -> Result<()>;

    /// Block until every pod matching `label_selector` has started running,
    /// ready or not. Vault only reports ready once it is unsealed.
    async fn wait_for_running(&self, dry_run: bool, namespace: &str, label_selector: &str)
    -> Result<()>;

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// A running forward process. `terminate` is called at most once per
/// process by the tunnel manager.
pub trait ForwardProcess: Send + Sync {
    fn terminate(&mut self);
}

#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn open_forward(
        &self,
        dry_run: bool,
        namespace: &str,
        service: &str,
        ports: PortMapping,
    ) -> Result<Box<dyn ForwardProcess>>;
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, release: &str) -> Result<()>;
}

#[async_trait]
pub trait DeploymentController: Send + Sync {
    async fn get_auth_token(&self, dry_run: bool, endpoint: &ForwardEndpoint) -> Result<String>;

    /// Trigger a sync of `app` and report its health afterwards.
    async fn trigger_sync(&self, endpoint: &ForwardEndpoint, app: &str, token: &str)
    -> Result<AppHealth>;

    async fn delete_by_label(&self, namespace: &str, selector: &str) -> Result<()>;

    async fn patch_secret(&self, namespace: &str, name: &str, key: &str, value: &str)
    -> Result<()>;

    /// Trust the bootstrap repository so the controller can pull from it.
    async fn register_repository(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        repo_url: &str,
    ) -> Result<()>;

    /// Create `app` from `path` in `repo_url`, or update it if it exists.
    async fn create_application(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        app: &str,
        repo_url: &str,
        path: &str,
    ) -> Result<()>;

    /// Point `app` at a different source repository.
    async fn repoint_application(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        app: &str,
        repo_url: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait ScmClient: Send + Sync {
    async fn validate_credentials(&self, provider: ScmProvider, owner: &str) -> Result<ScmAuth>;

    async fn initialize_provider(&self, params: &ScmInitParams) -> Result<()>;

    async fn provision_tokens(&self, provider: ScmProvider, endpoint: &ForwardEndpoint)
    -> Result<()>;

    async fn push_repository(&self, repo: &RepoRef) -> Result<()>;

    async fn register_keys(&self, endpoint: &ForwardEndpoint) -> Result<()>;

    /// Poll `host` up to `attempts_per_call` times; true once it answers.
    async fn await_host_resolvable(&self, host: &str, attempts_per_call: u32) -> bool;
}

/// Every call goes through a live tunnel to the vault service.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// `bootstrap_phase` selects the first pass (engines, policies) over the
    /// backend-only second pass.
    async fn configure(&self, endpoint: &ForwardEndpoint, bootstrap_phase: bool) -> Result<()>;

    async fn add_sso_integrations(&self, endpoint: &ForwardEndpoint) -> Result<()>;

    async fn unseal(&self, endpoint: &ForwardEndpoint) -> Result<()>;

    /// Client secret of the SSO integration registered for `client`.
    async fn sso_client_secret(&self, endpoint: &ForwardEndpoint, client: &str) -> Result<String>;
}

pub trait ProgressReporter: Send + Sync {
    fn add_tracker(&self, id: &str, label: &str, total_weight: u64);

    fn increment(&self, id: &str, delta: u64);

    /// Operator-facing message; silent reporters drop it.
    fn message(&self, text: &str);
}

pub trait Chooser: Send + Sync {
    fn choose_one(&self, prompt: &str, options: &[String]) -> Result<String>;
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub infra: Arc<dyn InfraEngine>,
    pub cluster: Arc<dyn ClusterClient>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub installer: Arc<dyn PackageInstaller>,
    pub controller: Arc<dyn DeploymentController>,
    pub scm: Arc<dyn ScmClient>,
    pub vault: Arc<dyn VaultClient>,
    pub progress: Arc<dyn ProgressReporter>,
    pub chooser: Arc<dyn Chooser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scm_provider_parse() {
        assert_eq!(ScmProvider::parse(" GitLab "), Some(ScmProvider::Gitlab));
        assert_eq!(ScmProvider::parse("github"), Some(ScmProvider::Github));
        assert_eq!(ScmProvider::parse("bitbucket"), None);
        assert_eq!(ScmProvider::Github.token_env(), "GITHUB_TOKEN");
    }

    #[test]
    fn test_app_health_readiness() {
        assert!(AppHealth::synced().is_ready());
        assert!(!AppHealth::out_of_sync().is_ready());
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = ForwardEndpoint {
            tunnel_id: 3,
            local_port: 8080,
        };
        assert_eq!(endpoint.http_url(), "http://localhost:8080");
        assert_eq!(PortMapping { local: 8080, remote: 80 }.to_string(), "8080:80");
    }
}
