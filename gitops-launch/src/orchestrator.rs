//! Launch orchestrator - runs a phase plan against checkpointed state
//!
//! Phases run strictly in plan order. A phase whose checkpoint is already
//! set is skipped (its `on_skip` companion still runs), a phase whose
//! dependencies are not all set aborts the run, and a phase that completes
//! has its checkpoint recorded and flushed before the next one starts. The
//! first error aborts the run unchanged; re-running resumes from the first
//! incomplete checkpoint.

use crate::bootstrap::collaborators::{Collaborators, ScmAuth, ScmProvider};
use crate::bootstrap::phases::bootstrap_plan;
use crate::bootstrap::plan::Plan;
use crate::bootstrap::state::{RunFlags, StateStore, keys};
use crate::bootstrap::tunnel::{TunnelHandle, TunnelManager};
use crate::config::{LaunchConfig, ServiceSettings};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SCM_PROMPT: &str = "Which SCM provider should host the GitOps repositories?";

/// What happened to each phase of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// The cluster was already fully installed; nothing ran.
    pub already_complete: bool,
    pub executed: Vec<&'static str>,
    /// Skipped because their checkpoint was already set.
    pub skipped: Vec<&'static str>,
    /// Excluded by `--skip-scm` / `--skip-vault`.
    pub not_applicable: Vec<&'static str>,
}

/// Everything a step can reach while it runs.
pub struct RunContext {
    flags: RunFlags,
    config: Arc<LaunchConfig>,
    collaborators: Collaborators,
    tunnels: TunnelManager,
    scm: ScmProvider,
    scm_auth: Option<ScmAuth>,
    phase: &'static str,
}

impl RunContext {
    pub fn new(
        flags: RunFlags,
        config: Arc<LaunchConfig>,
        collaborators: Collaborators,
        scm: ScmProvider,
        scm_auth: Option<ScmAuth>,
    ) -> Self {
        let tunnels = TunnelManager::new(Arc::clone(&collaborators.forwarder), flags.dry_run);
        Self {
            flags,
            config,
            collaborators,
            tunnels,
            scm,
            scm_auth,
            phase: "",
        }
    }

    pub fn flags(&self) -> RunFlags {
        self.flags
    }

    pub fn dry_run(&self) -> bool {
        self.flags.dry_run
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn scm(&self) -> ScmProvider {
        self.scm
    }

    pub fn scm_auth(&self) -> Option<&ScmAuth> {
        self.scm_auth.as_ref()
    }

    /// Id of the phase currently running.
    pub fn phase(&self) -> &'static str {
        self.phase
    }

    /// Operator-facing message, also logged.
    pub fn inform(&self, text: &str) {
        info!(phase = self.phase, "{text}");
        self.collaborators.progress.message(text);
    }

    /// True (and logged) when `action` must not run because this is a dry run.
    pub fn skip_in_dry_run(&self, action: &str) -> bool {
        if self.flags.dry_run {
            info!(phase = self.phase, "[dry-run] skipping: {action}");
        }
        self.flags.dry_run
    }

    /// Open a tunnel to `service`, owned by the current phase.
    pub async fn open_tunnel(&self, service: &ServiceSettings) -> Result<TunnelHandle> {
        self.tunnels
            .acquire(
                &service.namespace,
                &service.service,
                service.ports(),
                self.phase,
            )
            .await
    }

    /// Delete the pods behind `service` and wait for their replacements.
    /// Refused while a tunnel to the service is still live.
    pub async fn restart_workload(&self, service: &ServiceSettings) -> Result<()> {
        if self.tunnels.is_live(&service.namespace, &service.service) {
            return Err(Error::TunnelBusy {
                namespace: service.namespace.clone(),
                service: service.service.clone(),
            });
        }
        if !self.skip_in_dry_run(&format!("restart {}/{}", service.namespace, service.service)) {
            self.collaborators
                .controller
                .delete_by_label(&service.namespace, &service.selector)
                .await?;
        }
        self.collaborators
            .cluster
            .wait_for_workload(self.flags.dry_run, &service.namespace, &service.selector)
            .await
    }
}

/// Drives a plan against a state store.
pub struct Orchestrator<S: StateStore> {
    state: S,
    collaborators: Collaborators,
    config: Arc<LaunchConfig>,
    flags: RunFlags,
    scm: Option<ScmProvider>,
    scm_auth: Option<ScmAuth>,
    config_path: Option<PathBuf>,
}

impl<S: StateStore> Orchestrator<S> {
    pub fn new(
        state: S,
        collaborators: Collaborators,
        config: Arc<LaunchConfig>,
        flags: RunFlags,
    ) -> Self {
        let scm = config.scm.provider;
        Self {
            state,
            collaborators,
            config,
            flags,
            scm,
            scm_auth: None,
            config_path: None,
        }
    }

    /// Where an interactively chosen SCM provider is saved, so a resumed
    /// run keeps using it.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn flags(&self) -> RunFlags {
        self.flags
    }

    pub fn scm_provider(&self) -> Option<ScmProvider> {
        self.scm
    }

    pub fn already_complete(&self) -> bool {
        self.state.get_bool(keys::CLUSTER_INSTALL_COMPLETE)
    }

    /// Pre-flight, then the canonical plan for the resolved SCM provider.
    pub async fn launch(&mut self) -> Result<RunSummary> {
        if self.already_complete() {
            info!("cluster install already completed");
            return Ok(RunSummary {
                already_complete: true,
                ..RunSummary::default()
            });
        }
        let provider = self.preflight().await?;
        let plan = bootstrap_plan(&self.config, provider);
        self.run(&plan).await
    }

    /// Resolve the SCM provider and validate its credentials. Read-only;
    /// everything that fails here is a configuration error.
    pub async fn preflight(&mut self) -> Result<ScmProvider> {
        let provider = self.resolve_scm_provider()?;
        if self.flags.skip_scm {
            debug!(%provider, "SCM credential check skipped");
            return Ok(provider);
        }
        let auth = self
            .collaborators
            .scm
            .validate_credentials(provider, &self.config.scm.owner)
            .await?;
        info!(%provider, owner = %auth.owner, "SCM credentials accepted");
        self.scm_auth = Some(auth);
        Ok(provider)
    }

    fn resolve_scm_provider(&mut self) -> Result<ScmProvider> {
        if let Some(provider) = self.scm {
            return Ok(provider);
        }
        if self.flags.skip_scm {
            let provider = ScmProvider::default();
            self.scm = Some(provider);
            return Ok(provider);
        }
        if self.flags.silent {
            return Err(Error::InvalidFlags {
                reason: "--silent needs scm.provider set in the configuration".to_string(),
            });
        }

        let options = [ScmProvider::Gitlab, ScmProvider::Github]
            .map(|p| p.as_str().to_string())
            .to_vec();
        let choice = self.collaborators.chooser.choose_one(SCM_PROMPT, &options)?;
        let provider = ScmProvider::parse(&choice).ok_or_else(|| Error::NoChoice {
            prompt: SCM_PROMPT.to_string(),
        })?;
        self.save_provider(provider)?;
        self.scm = Some(provider);
        Ok(provider)
    }

    fn save_provider(&mut self, provider: ScmProvider) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        if self.flags.dry_run {
            info!(%provider, "[dry-run] not saving SCM provider choice");
            return Ok(());
        }
        let mut config = LaunchConfig::clone(&self.config);
        config.scm.provider = Some(provider);
        config.store(path)?;
        info!(%provider, config = %path.display(), "SCM provider saved");
        self.config = Arc::new(config);
        Ok(())
    }

    /// Run `plan` from the first incomplete phase.
    pub async fn run(&mut self, plan: &Plan) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        if self.already_complete() {
            info!("cluster install already completed");
            summary.already_complete = true;
            return Ok(summary);
        }

        let progress = Arc::clone(&self.collaborators.progress);
        let totals = plan.tracker_totals(&self.flags);
        let mut ctx = RunContext::new(
            self.flags,
            Arc::clone(&self.config),
            self.collaborators.clone(),
            self.scm.unwrap_or_default(),
            self.scm_auth.clone(),
        );
        let mut trackers: HashSet<&'static str> = HashSet::new();

        for phase in plan.phases() {
            if !phase.condition.applies(&self.flags) {
                debug!(phase = phase.id, "not applicable to this run");
                summary.not_applicable.push(phase.id);
                continue;
            }

            if trackers.insert(phase.tracker.id) {
                let total = totals
                    .iter()
                    .find(|(tracker, _)| tracker.id == phase.tracker.id)
                    .map_or(phase.weight, |(_, total)| *total);
                progress.add_tracker(phase.tracker.id, phase.tracker.label, total);
            }
            ctx.phase = phase.id;

            let done = phase
                .checkpoint
                .as_deref()
                .is_some_and(|key| self.state.get_bool(key));
            if done {
                info!(phase = phase.id, "already complete, skipping");
                phase.step.on_skip(&mut ctx).await?;
                summary.skipped.push(phase.id);
            } else {
                if let Some(key) = phase.depends_on.iter().find(|key| !self.state.get_bool(key)) {
                    error!(phase = phase.id, key = %key, "dependency not complete");
                    return Err(Error::DependencyUnmet {
                        phase: phase.id.to_string(),
                        key: key.clone(),
                    });
                }

                info!(phase = phase.id, dry_run = self.flags.dry_run, "{}", phase.label);
                if let Err(err) = phase.step.execute(&mut ctx).await {
                    error!(phase = phase.id, error = %err, "phase failed");
                    return Err(err);
                }

                if let Some(key) = &phase.checkpoint {
                    self.state.set_bool(key, true);
                    self.state.flush()?;
                    debug!(phase = phase.id, key = %key, "checkpoint recorded");
                }
                summary.executed.push(phase.id);
            }
            progress.increment(phase.tracker.id, phase.weight);
        }

        let leaked = ctx.tunnels().live_count();
        if leaked > 0 {
            warn!(leaked, "tunnels still live at end of run");
        }
        Ok(summary)
    }
}
