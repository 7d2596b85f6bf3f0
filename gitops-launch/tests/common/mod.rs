//! Recording collaborators for orchestrator tests.
//!
//! One `Mock` stands in for every collaborator and logs each call as an
//! `Event`, including the tunnel id that controller calls were made
//! through. Responses are scripted through the public fields.

#![allow(dead_code)]

use async_trait::async_trait;
use gitops_launch::bootstrap::collaborators::{
    AppHealth, Chooser, ClusterClient, Collaborators, DeploymentController, ForwardEndpoint,
    ForwardProcess, InfraEngine, PackageInstaller, PortForwarder, PortMapping, ProgressReporter,
    RepoRef, ScmAuth, ScmClient, ScmInitParams, ScmProvider, VaultClient,
};
use gitops_launch::bootstrap::poller::RetryPolicy;
use gitops_launch::config::LaunchConfig;
use gitops_launch::error::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ApplyBase,
    ApplyScm,
    WaitForWorkload { namespace: String },
    WaitForRunning { namespace: String },
    CreateSecret { name: String },
    OpenForward { service: String, dry_run: bool },
    Terminate { service: String },
    Install { release: String },
    GetAuthToken { tunnel: u64 },
    TriggerSync { tunnel: u64 },
    DeleteByLabel { namespace: String },
    PatchSecret { name: String },
    RegisterRepository { tunnel: u64 },
    CreateApplication { tunnel: u64, app: String },
    RepointApplication { tunnel: u64 },
    ValidateCredentials { provider: ScmProvider },
    InitializeProvider,
    ProvisionTokens { provider: ScmProvider },
    PushRepository { remote: String },
    RegisterKeys,
    AwaitHost,
    VaultConfigure { bootstrap: bool },
    VaultSso,
    VaultUnseal,
    VaultSecret,
    Choose,
}

impl Event {
    /// Calls a dry run must never make.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Event::ApplyBase
                | Event::ApplyScm
                | Event::CreateSecret { .. }
                | Event::Install { .. }
                | Event::DeleteByLabel { .. }
                | Event::PatchSecret { .. }
                | Event::RegisterRepository { .. }
                | Event::CreateApplication { .. }
                | Event::RepointApplication { .. }
                | Event::InitializeProvider
                | Event::ProvisionTokens { .. }
                | Event::PushRepository { .. }
                | Event::RegisterKeys
                | Event::VaultConfigure { .. }
                | Event::VaultSso
                | Event::VaultUnseal
        )
    }
}

type EventLog = Arc<Mutex<Vec<Event>>>;

fn failure(command: &str) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        code: 1,
        stderr: "scripted failure".to_string(),
    }
}

#[derive(Default)]
pub struct Mock {
    events: EventLog,
    /// Answers for `await_host_resolvable`; empty means "resolves".
    pub host_answers: Mutex<VecDeque<bool>>,
    /// Health reported by `trigger_sync`; empty means synced.
    pub sync_health: Mutex<VecDeque<AppHealth>>,
    /// Number of pushes that fail before pushes start succeeding.
    pub push_failures: AtomicU32,
    /// Release whose install fails.
    pub fail_install: Mutex<Option<String>>,
    pub fail_unseal: AtomicBool,
    pub reject_credentials: AtomicBool,
    /// Answer given by the chooser; `None` means no choice.
    pub choice: Mutex<Option<String>>,
    trackers: Mutex<Vec<(String, u64)>>,
    increments: Mutex<BTreeMap<String, u64>>,
    messages: Mutex<Vec<String>>,
}

impl Mock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            infra: self.clone(),
            cluster: self.clone(),
            forwarder: self.clone(),
            installer: self.clone(),
            controller: self.clone(),
            scm: self.clone(),
            vault: self.clone(),
            progress: self.clone(),
            chooser: self.clone(),
        }
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }

    pub fn mutating(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_mutating).collect()
    }

    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(|e| predicate(e))
    }

    pub fn trackers(&self) -> Vec<(String, u64)> {
        self.trackers.lock().unwrap().clone()
    }

    pub fn increments(&self) -> BTreeMap<String, u64> {
        self.increments.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn clear_failures(&self) {
        *self.fail_install.lock().unwrap() = None;
        self.fail_unseal.store(false, Ordering::SeqCst);
        self.push_failures.store(0, Ordering::SeqCst);
    }
}

/// Config with millisecond retries and a configured provider.
pub fn test_config() -> LaunchConfig {
    let mut config = LaunchConfig::default();
    config.scm.provider = Some(ScmProvider::Gitlab);
    config.scm.owner = "platform".to_string();
    config.retry.workload = RetryPolicy::constant(2, Duration::from_millis(1));
    config.retry.repo_push = RetryPolicy::constant(3, Duration::from_millis(1));
    config.retry.sync = RetryPolicy::constant(3, Duration::from_millis(1));
    config.retry.forward_ready = RetryPolicy::constant(2, Duration::from_millis(1));
    config.retry.host_attempts_per_call = 2;
    config.retry.host_outer_iterations = 3;
    config
}

struct MockProcess {
    service: String,
    events: EventLog,
}

impl ForwardProcess for MockProcess {
    fn terminate(&mut self) {
        self.events.lock().unwrap().push(Event::Terminate {
            service: self.service.clone(),
        });
    }
}

#[async_trait]
impl InfraEngine for Mock {
    async fn apply_base(&self, _workdir: &Path) -> Result<()> {
        self.record(Event::ApplyBase);
        Ok(())
    }

    async fn apply_scm(&self, _workdir: &Path) -> Result<()> {
        self.record(Event::ApplyScm);
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for Mock {
    async fn wait_for_workload(
        &self,
        _dry_run: bool,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<()> {
        self.record(Event::WaitForWorkload {
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn wait_for_running(
        &self,
        _dry_run: bool,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<()> {
        self.record(Event::WaitForRunning {
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn create_secret(
        &self,
        _namespace: &str,
        name: &str,
        _data: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record(Event::CreateSecret {
            name: name.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for Mock {
    async fn open_forward(
        &self,
        dry_run: bool,
        _namespace: &str,
        service: &str,
        _ports: PortMapping,
    ) -> Result<Box<dyn ForwardProcess>> {
        self.record(Event::OpenForward {
            service: service.to_string(),
            dry_run,
        });
        Ok(Box::new(MockProcess {
            service: service.to_string(),
            events: Arc::clone(&self.events),
        }))
    }
}

#[async_trait]
impl PackageInstaller for Mock {
    async fn install(&self, release: &str) -> Result<()> {
        self.record(Event::Install {
            release: release.to_string(),
        });
        if self.fail_install.lock().unwrap().as_deref() == Some(release) {
            return Err(failure(&format!("helm upgrade --install {release}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentController for Mock {
    async fn get_auth_token(&self, _dry_run: bool, endpoint: &ForwardEndpoint) -> Result<String> {
        self.record(Event::GetAuthToken {
            tunnel: endpoint.tunnel_id,
        });
        Ok(format!("token-{}", endpoint.tunnel_id))
    }

    async fn trigger_sync(
        &self,
        endpoint: &ForwardEndpoint,
        _app: &str,
        _token: &str,
    ) -> Result<AppHealth> {
        self.record(Event::TriggerSync {
            tunnel: endpoint.tunnel_id,
        });
        Ok(self
            .sync_health
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(AppHealth::synced))
    }

    async fn delete_by_label(&self, namespace: &str, _selector: &str) -> Result<()> {
        self.record(Event::DeleteByLabel {
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    async fn patch_secret(&self, _namespace: &str, name: &str, _key: &str, _value: &str) -> Result<()> {
        self.record(Event::PatchSecret {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn register_repository(
        &self,
        endpoint: &ForwardEndpoint,
        _token: &str,
        _repo_url: &str,
    ) -> Result<()> {
        self.record(Event::RegisterRepository {
            tunnel: endpoint.tunnel_id,
        });
        Ok(())
    }

    async fn create_application(
        &self,
        endpoint: &ForwardEndpoint,
        _token: &str,
        app: &str,
        _repo_url: &str,
        _path: &str,
    ) -> Result<()> {
        self.record(Event::CreateApplication {
            tunnel: endpoint.tunnel_id,
            app: app.to_string(),
        });
        Ok(())
    }

    async fn repoint_application(
        &self,
        endpoint: &ForwardEndpoint,
        _token: &str,
        _app: &str,
        _repo_url: &str,
    ) -> Result<()> {
        self.record(Event::RepointApplication {
            tunnel: endpoint.tunnel_id,
        });
        Ok(())
    }
}

#[async_trait]
impl ScmClient for Mock {
    async fn validate_credentials(&self, provider: ScmProvider, owner: &str) -> Result<ScmAuth> {
        self.record(Event::ValidateCredentials { provider });
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(Error::CredentialsRejected {
                provider: provider.to_string(),
                reason: "status 401".to_string(),
            });
        }
        Ok(ScmAuth {
            token: "scm-token".to_string(),
            owner: owner.to_string(),
        })
    }

    async fn initialize_provider(&self, _params: &ScmInitParams) -> Result<()> {
        self.record(Event::InitializeProvider);
        Ok(())
    }

    async fn provision_tokens(
        &self,
        provider: ScmProvider,
        _endpoint: &ForwardEndpoint,
    ) -> Result<()> {
        self.record(Event::ProvisionTokens { provider });
        Ok(())
    }

    async fn push_repository(&self, repo: &RepoRef) -> Result<()> {
        self.record(Event::PushRepository {
            remote: repo.remote_name.clone(),
        });
        let failing = self
            .push_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(failure("git push"));
        }
        Ok(())
    }

    async fn register_keys(&self, _endpoint: &ForwardEndpoint) -> Result<()> {
        self.record(Event::RegisterKeys);
        Ok(())
    }

    async fn await_host_resolvable(&self, _host: &str, _attempts_per_call: u32) -> bool {
        self.record(Event::AwaitHost);
        self.host_answers.lock().unwrap().pop_front().unwrap_or(true)
    }
}

#[async_trait]
impl VaultClient for Mock {
    async fn configure(&self, _endpoint: &ForwardEndpoint, bootstrap_phase: bool) -> Result<()> {
        self.record(Event::VaultConfigure {
            bootstrap: bootstrap_phase,
        });
        Ok(())
    }

    async fn add_sso_integrations(&self, _endpoint: &ForwardEndpoint) -> Result<()> {
        self.record(Event::VaultSso);
        Ok(())
    }

    async fn unseal(&self, _endpoint: &ForwardEndpoint) -> Result<()> {
        self.record(Event::VaultUnseal);
        if self.fail_unseal.load(Ordering::SeqCst) {
            return Err(Error::HttpStatus {
                action: "unseal vault".to_string(),
                status: 503,
            });
        }
        Ok(())
    }

    async fn sso_client_secret(&self, _endpoint: &ForwardEndpoint, client: &str) -> Result<String> {
        self.record(Event::VaultSecret);
        Ok(format!("{client}-secret"))
    }
}

impl ProgressReporter for Mock {
    fn add_tracker(&self, id: &str, _label: &str, total_weight: u64) {
        self.trackers
            .lock()
            .unwrap()
            .push((id.to_string(), total_weight));
    }

    fn increment(&self, id: &str, delta: u64) {
        *self
            .increments
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += delta;
    }

    fn message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}

impl Chooser for Mock {
    fn choose_one(&self, prompt: &str, _options: &[String]) -> Result<String> {
        self.record(Event::Choose);
        self.choice.lock().unwrap().clone().ok_or_else(|| Error::NoChoice {
            prompt: prompt.to_string(),
        })
    }
}
