//! Launch configuration
//!
//! Loaded with `confy` from `~/.config/gitops-launch/config.toml` unless a
//! path is given. Every field has a default, so a fresh install runs with
//! an empty (or absent) file.

use crate::bootstrap::collaborators::{PortMapping, ScmProvider};
use crate::bootstrap::poller::RetryPolicy;
use crate::error::{ConfigLoadSnafu, ConfigStoreSnafu, Error, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "gitops-launch";
pub const CONFIG_ENV: &str = "GITOPS_LAUNCH_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub cluster_name: String,
    pub domain: String,
    pub workspace_dir: PathBuf,
    pub kubeconfig: PathBuf,
    pub state_file: PathBuf,
    pub binaries: BinaryPaths,
    pub scm: ScmSettings,
    pub cluster_ready: WorkloadSettings,
    pub internal_repo: ServiceSettings,
    pub controller: ControllerSettings,
    pub vault: ServiceSettings,
    pub scm_platform: ServiceSettings,
    pub releases: Vec<ReleaseSpec>,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryPaths {
    pub kubectl: String,
    pub helm: String,
    pub terraform: String,
    pub git: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScmSettings {
    /// Left unset, the operator is asked at launch time.
    pub provider: Option<ScmProvider>,
    /// Defaults to `gitlab.<domain>` for the in-cluster GitLab and to
    /// `github.com` for GitHub.
    pub host: Option<String>,
    /// REST API base; defaults to the provider's public API.
    pub api_url: Option<String>,
    pub owner: String,
    pub repositories: Vec<String>,
    pub teams: Vec<String>,
    pub ssh_public_key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSettings {
    pub namespace: String,
    pub selector: String,
}

/// An in-cluster service the launch talks to through a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSettings {
    pub release: String,
    pub namespace: String,
    pub service: String,
    pub selector: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ServiceSettings {
    pub fn ports(&self) -> PortMapping {
        PortMapping {
            local: self.local_port,
            remote: self.remote_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    #[serde(flatten)]
    pub service: ServiceSettings,
    pub registry_app: String,
    /// Directory of the GitOps repository the registry app is built from.
    pub registry_path: String,
    pub sso_secret_name: String,
    pub sso_secret_key: String,
    pub sso_client: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseSpec {
    pub name: String,
    pub chart: String,
    pub repo_url: String,
    pub namespace: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub values: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub workload: RetryPolicy,
    pub repo_push: RetryPolicy,
    pub sync: RetryPolicy,
    pub forward_ready: RetryPolicy,
    pub host_attempts_per_call: u32,
    pub host_outer_iterations: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cluster_name: "launch".to_string(),
            domain: "launch.local".to_string(),
            workspace_dir: PathBuf::from("~/.gitops-launch"),
            kubeconfig: PathBuf::from("~/.gitops-launch/kubeconfig"),
            state_file: PathBuf::from("~/.gitops-launch/state.toml"),
            binaries: BinaryPaths::default(),
            scm: ScmSettings::default(),
            cluster_ready: WorkloadSettings {
                namespace: "kube-system".to_string(),
                selector: "k8s-app=kube-dns".to_string(),
            },
            internal_repo: ServiceSettings {
                release: "soft-serve".to_string(),
                namespace: "soft-serve".to_string(),
                service: "soft-serve".to_string(),
                selector: "app=soft-serve".to_string(),
                local_port: 8022,
                remote_port: 22,
            },
            controller: ControllerSettings::default(),
            vault: ServiceSettings {
                release: "vault".to_string(),
                namespace: "vault".to_string(),
                service: "vault".to_string(),
                selector: "app.kubernetes.io/name=vault".to_string(),
                local_port: 8200,
                remote_port: 8200,
            },
            scm_platform: ServiceSettings {
                release: "gitlab".to_string(),
                namespace: "gitlab".to_string(),
                service: "gitlab-webservice-default".to_string(),
                selector: "app=webservice".to_string(),
                local_port: 8888,
                remote_port: 8080,
            },
            releases: default_releases(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            helm: "helm".to_string(),
            terraform: "terraform".to_string(),
            git: "git".to_string(),
        }
    }
}

impl Default for ScmSettings {
    fn default() -> Self {
        Self {
            provider: None,
            host: None,
            api_url: None,
            owner: String::new(),
            repositories: vec!["gitops".to_string(), "metaphor".to_string()],
            teams: vec!["admins".to_string(), "developers".to_string()],
            ssh_public_key: PathBuf::from("~/.gitops-launch/ssh/id_ed25519.pub"),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            service: ServiceSettings {
                release: "argocd".to_string(),
                namespace: "argocd".to_string(),
                service: "argocd-server".to_string(),
                selector: "app.kubernetes.io/name=argocd-server".to_string(),
                local_port: 8080,
                remote_port: 80,
            },
            registry_app: "registry".to_string(),
            registry_path: "registry".to_string(),
            sso_secret_name: "argocd-secret".to_string(),
            sso_secret_key: "oidc.gitlab.clientSecret".to_string(),
            sso_client: "argocd".to_string(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            workload: RetryPolicy::constant(120, Duration::from_secs(5)),
            repo_push: RetryPolicy::constant(10, Duration::from_secs(20)),
            sync: RetryPolicy::constant(120, Duration::from_secs(5)),
            forward_ready: RetryPolicy::constant(30, Duration::from_millis(500)),
            host_attempts_per_call: 20,
            host_outer_iterations: 15,
        }
    }
}

fn default_releases() -> Vec<ReleaseSpec> {
    let release = |name: &str, chart: &str, repo_url: &str| ReleaseSpec {
        name: name.to_string(),
        chart: chart.to_string(),
        repo_url: repo_url.to_string(),
        namespace: name.to_string(),
        version: None,
        values: None,
    };
    vec![
        release(
            "soft-serve",
            "soft-serve",
            "https://charmbracelet.github.io/soft-serve",
        ),
        release("argocd", "argo-cd", "https://argoproj.github.io/argo-helm"),
        release("vault", "vault", "https://helm.releases.hashicorp.com"),
        release("gitlab", "gitlab", "https://charts.gitlab.io"),
    ]
}

/// Expand a leading `~` and environment variables.
pub fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(raw.as_ref()) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref()),
    }
}

impl LaunchConfig {
    /// Load from `path`, `$GITOPS_LAUNCH_CONFIG`, or the confy default
    /// location, in that order. A missing file is created with defaults.
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(path) => expand(path),
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) if !path.is_empty() => expand(Path::new(&path)),
                _ => confy::get_configuration_file_path(APP_NAME, "config").context(
                    ConfigLoadSnafu {
                        path: PathBuf::from("~/.config/gitops-launch/config.toml"),
                    },
                )?,
            },
        };
        let config: LaunchConfig = confy::load_path(&path).context(ConfigLoadSnafu { path: &path })?;
        config.validate()?;
        Ok((config, path))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        confy::store_path(path, self).context(ConfigStoreSnafu { path })
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.host_attempts_per_call == 0 || self.retry.host_outer_iterations == 0 {
            return Err(Error::InvalidRetryPolicy {
                reason: "host readiness attempts and iterations must be at least 1".to_string(),
            });
        }
        for service in [
            &self.internal_repo,
            &self.controller.service,
            &self.vault,
            &self.scm_platform,
        ] {
            self.release(&service.release)?;
        }
        Ok(())
    }

    pub fn release(&self, name: &str) -> Result<&ReleaseSpec> {
        self.releases
            .iter()
            .find(|release| release.name == name)
            .ok_or_else(|| Error::UnknownRelease {
                name: name.to_string(),
            })
    }

    pub fn workspace(&self) -> PathBuf {
        expand(&self.workspace_dir)
    }

    pub fn kubeconfig_path(&self) -> PathBuf {
        expand(&self.kubeconfig)
    }

    pub fn state_path(&self) -> PathBuf {
        expand(&self.state_file)
    }

    pub fn gitops_dir(&self) -> PathBuf {
        self.workspace().join("gitops")
    }

    pub fn base_workdir(&self) -> PathBuf {
        self.gitops_dir().join("terraform").join("base")
    }

    pub fn scm_workdir(&self, provider: ScmProvider) -> PathBuf {
        self.gitops_dir().join("terraform").join(provider.as_str())
    }

    pub fn vault_workdir(&self) -> PathBuf {
        self.gitops_dir().join("terraform").join("vault")
    }

    pub fn scm_host(&self, provider: ScmProvider) -> String {
        self.scm.host.clone().unwrap_or_else(|| match provider {
            ScmProvider::Gitlab => format!("gitlab.{}", self.domain),
            ScmProvider::Github => "github.com".to_string(),
        })
    }

    pub fn scm_api_url(&self, provider: ScmProvider) -> String {
        self.scm.api_url.clone().unwrap_or_else(|| match provider {
            ScmProvider::Gitlab => "https://gitlab.com/api/v4".to_string(),
            ScmProvider::Github => "https://api.github.com".to_string(),
        })
    }

    pub fn controller_host(&self) -> String {
        format!("argocd.{}", self.domain)
    }

    /// Remote URL of the GitOps repository on the SCM origin.
    pub fn gitops_origin_url(&self, provider: ScmProvider) -> String {
        format!("https://{}/{}/gitops.git", self.scm_host(provider), self.scm.owner)
    }

    /// In-cluster URL the controller uses to reach the bootstrap repository.
    pub fn internal_repo_cluster_url(&self) -> String {
        format!(
            "ssh://{}.{}.svc.cluster.local:{}/gitops",
            self.internal_repo.service, self.internal_repo.namespace, self.internal_repo.remote_port
        )
    }
}
