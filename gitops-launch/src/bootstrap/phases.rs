//! Concrete launch steps and the canonical bootstrap plan

use crate::bootstrap::collaborators::{
    DeploymentController, RepoRef, ScmClient, ScmInitParams, ScmProvider,
};
use crate::bootstrap::plan::{Condition, Phase, Plan, Step, Tracker};
use crate::bootstrap::poller::{RetryPolicy, try_poll};
use crate::bootstrap::state::keys;
use crate::bootstrap::sync::sync_until_ready;
use crate::config::{ControllerSettings, LaunchConfig, ServiceSettings};
use crate::error::{Error, Result};
use crate::orchestrator::RunContext;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const STEP_PARAMETERS: Tracker = Tracker {
    id: "step-0",
    label: "Process Parameters",
};
pub const STEP_REPO: Tracker = Tracker {
    id: "step-repo",
    label: "Prepare Temporary Repo",
};
pub const STEP_CONTROLLER: Tracker = Tracker {
    id: "step-controller",
    label: "Deploy CI/CD",
};
pub const STEP_SCM: Tracker = Tracker {
    id: "step-scm",
    label: "Setup SCM",
};
pub const STEP_VAULT: Tracker = Tracker {
    id: "step-vault",
    label: "Configure Vault",
};
pub const STEP_FINALIZE: Tracker = Tracker {
    id: "step-finalize",
    label: "Finalize SCM Updates",
};
pub const STEP_VAULT_BACKEND: Tracker = Tracker {
    id: "step-vault-backend",
    label: "Configure Vault Backend",
};

pub const VAULT_CONFIGURED_SECRET: &str = "vault-configured";

/// The full launch, in order.
pub fn bootstrap_plan(config: &LaunchConfig, scm: ScmProvider) -> Plan {
    let provider = scm.as_str();
    let origin_url = config.gitops_origin_url(scm);
    let controller = &config.controller.service;

    Plan::new()
        .phase(
            Phase::new(
                "scm-credentials",
                "Initializing SCM provider",
                STEP_PARAMETERS,
                InitializeScm {
                    repositories: config.scm.repositories.clone(),
                    teams: config.scm.teams.clone(),
                },
            )
            .checkpoint(keys::credentials(provider))
            .when(Condition::UnlessSkipScm),
        )
        .phase(
            Phase::new(
                "cluster-launch",
                "Applying base infrastructure",
                STEP_PARAMETERS,
                ApplyBaseInfra {
                    workdir: config.base_workdir(),
                },
            )
            .checkpoint(keys::LAUNCH_DEPLOYED),
        )
        .phase(Phase::new(
            "cluster-ready",
            "Waiting for the cluster",
            STEP_REPO,
            AwaitWorkload {
                namespace: config.cluster_ready.namespace.clone(),
                selector: config.cluster_ready.selector.clone(),
                running_only: false,
            },
        ))
        .phase(Phase::new(
            "internal-repo-install",
            "Installing the bootstrap repository",
            STEP_REPO,
            InstallRelease::of(&config.internal_repo),
        ))
        .phase(Phase::new(
            "internal-repo-ready",
            "Waiting for the bootstrap repository",
            STEP_REPO,
            AwaitWorkload::of(&config.internal_repo),
        ))
        .phase(Phase::new(
            "internal-repo-push",
            "Pushing bootstrap content",
            STEP_REPO,
            PushInternalRepo {
                service: config.internal_repo.clone(),
                repo: RepoRef {
                    name: "gitops".to_string(),
                    remote_name: "internal".to_string(),
                    remote_url: format!(
                        "ssh://git@localhost:{}/gitops",
                        config.internal_repo.local_port
                    ),
                },
                policy: config.retry.repo_push,
            },
        ))
        .phase(Phase::new(
            "controller-install",
            "Installing the deployment controller",
            STEP_CONTROLLER,
            InstallRelease::of(controller),
        ))
        .phase(Phase::new(
            "controller-ready",
            "Waiting for the deployment controller",
            STEP_CONTROLLER,
            AwaitWorkload::of(controller),
        ))
        .phase(
            Phase::new(
                "controller-trust",
                "Registering the bootstrap repository",
                STEP_CONTROLLER,
                TrustRepository {
                    controller: controller.clone(),
                    repo_url: config.internal_repo_cluster_url(),
                    app: config.controller.registry_app.clone(),
                    path: config.controller.registry_path.clone(),
                },
            )
            .weight(2),
        )
        .phase(Phase::new(
            "vault-ready",
            "Waiting for vault to start",
            STEP_SCM,
            AwaitWorkload::running(&config.vault),
        ))
        .phase(Phase::new(
            "vault-unseal",
            "Unsealing vault",
            STEP_SCM,
            UnsealVault {
                vault: config.vault.clone(),
            },
        ))
        .phase(Phase::new(
            "scm-install",
            "Installing the SCM platform",
            STEP_SCM,
            InstallRelease::of(&config.scm_platform),
        ))
        .phase(Phase::new(
            "scm-ready",
            "Waiting for the SCM platform",
            STEP_SCM,
            AwaitWorkload::of(&config.scm_platform),
        ))
        .phase(
            Phase::new(
                "scm-provision",
                "Provisioning SCM tokens and keys",
                STEP_SCM,
                ProvisionScm {
                    platform: config.scm_platform.clone(),
                    workdir: config.scm_workdir(scm),
                },
            )
            .weight(2)
            .when(Condition::UnlessSkipScm),
        )
        .phase(
            Phase::new(
                "vault-configure",
                "Configuring vault",
                STEP_VAULT,
                ConfigureVault {
                    vault: config.vault.clone(),
                    bootstrap_phase: true,
                },
            )
            .weight(2)
            .when(Condition::UnlessSkipVault),
        )
        .phase(
            Phase::new(
                "scm-oidc",
                "Registering single sign-on",
                STEP_FINALIZE,
                RegisterSso {
                    vault: config.vault.clone(),
                },
            )
            .checkpoint(keys::oidc_created(provider)),
        )
        .phase(
            Phase::new(
                "gitops-push",
                "Pushing the GitOps repository",
                STEP_FINALIZE,
                PushGitops {
                    repo: RepoRef {
                        name: "gitops".to_string(),
                        remote_name: provider.to_string(),
                        remote_url: origin_url.clone(),
                    },
                    host: config.scm_host(scm),
                    attempts_per_call: config.retry.host_attempts_per_call,
                },
            )
            .checkpoint(keys::gitops_pushed(provider)),
        )
        .phase(
            Phase::new(
                "controller-oidc-patch",
                "Enabling single sign-on on the deployment controller",
                STEP_FINALIZE,
                PatchControllerSso {
                    controller: config.controller.clone(),
                    vault: config.vault.clone(),
                },
            )
            .checkpoint(keys::CONTROLLER_OIDC_PATCHED)
            .depends_on(keys::oidc_created(provider)),
        )
        .phase(
            Phase::new(
                "registry-repoint",
                "Re-pointing the registry",
                STEP_FINALIZE,
                RepointRegistry {
                    controller: controller.clone(),
                    app: config.controller.registry_app.clone(),
                    repo_url: origin_url,
                    policy: config.retry.sync,
                },
            )
            .checkpoint(keys::registered(provider))
            .depends_on(keys::gitops_pushed(provider))
            .depends_on(keys::CONTROLLER_OIDC_PATCHED),
        )
        .phase(Phase::new(
            "controller-host-ready",
            "Waiting for the controller host",
            STEP_FINALIZE,
            AwaitControllerHost {
                host: config.controller_host(),
                controller: controller.clone(),
                outer_iterations: config.retry.host_outer_iterations,
                attempts_per_call: config.retry.host_attempts_per_call,
            },
        ))
        .phase(
            Phase::new(
                "vault-backend",
                "Configuring vault backend",
                STEP_VAULT_BACKEND,
                ConfigureVault {
                    vault: config.vault.clone(),
                    bootstrap_phase: false,
                },
            )
            .when(Condition::UnlessSkipVault),
        )
        .phase(
            Phase::new(
                "install-complete",
                "Finishing up",
                STEP_FINALIZE,
                MarkComplete,
            )
            .checkpoint(keys::CLUSTER_INSTALL_COMPLETE)
            .depends_on(keys::LAUNCH_DEPLOYED),
        )
}

struct InitializeScm {
    repositories: Vec<String>,
    teams: Vec<String>,
}

#[async_trait]
impl Step for InitializeScm {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let auth = ctx.scm_auth().cloned().ok_or_else(|| Error::InvalidFlags {
            reason: "SCM credentials were not validated before the run".to_string(),
        })?;
        let params = ScmInitParams {
            provider: ctx.scm(),
            token: auth.token,
            owner: auth.owner,
            repositories: self.repositories.clone(),
            teams: self.teams.clone(),
        };
        if ctx.skip_in_dry_run("initialize SCM provider") {
            return Ok(());
        }
        ctx.collaborators().scm.initialize_provider(&params).await
    }
}

struct ApplyBaseInfra {
    workdir: PathBuf,
}

#[async_trait]
impl Step for ApplyBaseInfra {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.skip_in_dry_run("apply base infrastructure") {
            return Ok(());
        }
        ctx.inform("Applying base infrastructure, this takes a few minutes");
        ctx.collaborators().infra.apply_base(&self.workdir).await
    }
}

struct AwaitWorkload {
    namespace: String,
    selector: String,
    /// Started is enough; readiness comes later (vault unseals after this).
    running_only: bool,
}

impl AwaitWorkload {
    fn of(service: &ServiceSettings) -> Self {
        Self {
            namespace: service.namespace.clone(),
            selector: service.selector.clone(),
            running_only: false,
        }
    }

    fn running(service: &ServiceSettings) -> Self {
        Self {
            running_only: true,
            ..Self::of(service)
        }
    }
}

#[async_trait]
impl Step for AwaitWorkload {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let cluster = &ctx.collaborators().cluster;
        if self.running_only {
            cluster
                .wait_for_running(ctx.dry_run(), &self.namespace, &self.selector)
                .await
        } else {
            cluster
                .wait_for_workload(ctx.dry_run(), &self.namespace, &self.selector)
                .await
        }
    }
}

struct InstallRelease {
    release: String,
}

impl InstallRelease {
    fn of(service: &ServiceSettings) -> Self {
        Self {
            release: service.release.clone(),
        }
    }
}

#[async_trait]
impl Step for InstallRelease {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.skip_in_dry_run(&format!("install release {}", self.release)) {
            return Ok(());
        }
        ctx.collaborators().installer.install(&self.release).await
    }
}

/// Each attempt opens its own tunnel and drops it before the retry sleep.
struct PushInternalRepo {
    service: ServiceSettings,
    repo: RepoRef,
    policy: RetryPolicy,
}

#[async_trait]
impl Step for PushInternalRepo {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let ctx: &RunContext = ctx;
        let outcome = try_poll(&self.policy, move |attempt| async move {
            let _tunnel = ctx.open_tunnel(&self.service).await?;
            if ctx.skip_in_dry_run(&format!("push {} to the bootstrap repository", self.repo.name)) {
                return Ok(true);
            }
            match ctx.collaborators().scm.push_repository(&self.repo).await {
                Ok(()) => Ok(true),
                Err(err) => {
                    warn!(attempt, repo = %self.repo.name, error = %err, "push failed, retrying");
                    Ok(false)
                }
            }
        })
        .await?;

        if !outcome.success {
            return Err(Error::PushExhausted {
                repo: self.repo.name.clone(),
                attempts: outcome.attempts,
            });
        }
        debug!(attempts = outcome.attempts, "bootstrap content pushed");
        Ok(())
    }
}

/// Trust the bootstrap repository and create the registry application
/// from it; the finalize block later re-points that application.
struct TrustRepository {
    controller: ServiceSettings,
    repo_url: String,
    app: String,
    path: String,
}

#[async_trait]
impl Step for TrustRepository {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.controller).await?;
        let endpoint = tunnel.endpoint();
        let controller = &ctx.collaborators().controller;
        let token = controller.get_auth_token(ctx.dry_run(), &endpoint).await?;
        if ctx.skip_in_dry_run("register bootstrap repository and registry application") {
            return Ok(());
        }
        controller
            .register_repository(&endpoint, &token, &self.repo_url)
            .await?;
        controller
            .create_application(&endpoint, &token, &self.app, &self.repo_url, &self.path)
            .await
    }
}

struct UnsealVault {
    vault: ServiceSettings,
}

#[async_trait]
impl Step for UnsealVault {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.vault).await?;
        if ctx.skip_in_dry_run("unseal vault") {
            return Ok(());
        }
        ctx.collaborators().vault.unseal(&tunnel.endpoint()).await
    }
}

struct ProvisionScm {
    platform: ServiceSettings,
    workdir: PathBuf,
}

#[async_trait]
impl Step for ProvisionScm {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.platform).await?;
        if ctx.skip_in_dry_run("provision SCM tokens, infrastructure and keys") {
            return Ok(());
        }
        let endpoint = tunnel.endpoint();
        let collaborators = ctx.collaborators();
        collaborators.scm.provision_tokens(ctx.scm(), &endpoint).await?;
        collaborators.infra.apply_scm(&self.workdir).await?;
        collaborators.scm.register_keys(&endpoint).await
    }
}

struct ConfigureVault {
    vault: ServiceSettings,
    bootstrap_phase: bool,
}

#[async_trait]
impl Step for ConfigureVault {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.vault).await?;
        if ctx.skip_in_dry_run("configure vault") {
            return Ok(());
        }
        let collaborators = ctx.collaborators();
        collaborators
            .vault
            .configure(&tunnel.endpoint(), self.bootstrap_phase)
            .await?;

        if self.bootstrap_phase {
            let data = BTreeMap::from([("isConfigured".to_string(), "true".to_string())]);
            collaborators
                .cluster
                .create_secret(&self.vault.namespace, VAULT_CONFIGURED_SECRET, &data)
                .await?;
        }
        Ok(())
    }
}

struct RegisterSso {
    vault: ServiceSettings,
}

#[async_trait]
impl Step for RegisterSso {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.vault).await?;
        if ctx.skip_in_dry_run("register SSO integrations") {
            return Ok(());
        }
        ctx.collaborators()
            .vault
            .add_sso_integrations(&tunnel.endpoint())
            .await
    }
}

/// Waits for the SCM host to answer before pushing; a host that never
/// answers is left to fail the push itself.
struct PushGitops {
    repo: RepoRef,
    host: String,
    attempts_per_call: u32,
}

#[async_trait]
impl Step for PushGitops {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.skip_in_dry_run(&format!("push {} to {}", self.repo.name, self.repo.remote_url)) {
            return Ok(());
        }
        let scm = &ctx.collaborators().scm;
        ctx.inform(&format!("Waiting for {} to resolve before pushing", self.host));
        if !scm.await_host_resolvable(&self.host, self.attempts_per_call).await {
            warn!(host = %self.host, "SCM host not answering, pushing anyway");
        }
        scm.push_repository(&self.repo).await
    }
}

/// Patch the SSO client secret into the controller, restart it and
/// re-authenticate through a fresh tunnel.
struct PatchControllerSso {
    controller: ControllerSettings,
    vault: ServiceSettings,
}

#[async_trait]
impl Step for PatchControllerSso {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let service = &self.controller.service;

        if !ctx.skip_in_dry_run("patch controller SSO secret") {
            let secret = {
                let vault_tunnel = ctx.open_tunnel(&self.vault).await?;
                ctx.collaborators()
                    .vault
                    .sso_client_secret(&vault_tunnel.endpoint(), &self.controller.sso_client)
                    .await?
            };
            ctx.collaborators()
                .controller
                .patch_secret(
                    &service.namespace,
                    &self.controller.sso_secret_name,
                    &self.controller.sso_secret_key,
                    &secret,
                )
                .await?;
        }

        ctx.inform("Restarting the deployment controller to pick up single sign-on");
        ctx.restart_workload(service).await?;

        let tunnel = ctx.open_tunnel(service).await?;
        ctx.collaborators()
            .controller
            .get_auth_token(ctx.dry_run(), &tunnel.endpoint())
            .await?;
        debug!(tunnel = tunnel.id(), "re-authenticated after restart");
        Ok(())
    }

    async fn on_skip(&self, ctx: &mut RunContext) -> Result<()> {
        let service = &self.controller.service;
        ctx.collaborators()
            .cluster
            .wait_for_workload(ctx.dry_run(), &service.namespace, &service.selector)
            .await
    }
}

struct RepointRegistry {
    controller: ServiceSettings,
    app: String,
    repo_url: String,
    policy: RetryPolicy,
}

#[async_trait]
impl Step for RepointRegistry {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let tunnel = ctx.open_tunnel(&self.controller).await?;
        let endpoint = tunnel.endpoint();
        let controller = &ctx.collaborators().controller;
        let token = controller.get_auth_token(ctx.dry_run(), &endpoint).await?;

        if !ctx.skip_in_dry_run(&format!("re-point {} to {}", self.app, self.repo_url)) {
            controller
                .repoint_application(&endpoint, &token, &self.app, &self.repo_url)
                .await?;
        }

        let result = sync_until_ready(
            controller.as_ref(),
            &endpoint,
            &self.app,
            &token,
            &self.policy,
            ctx.dry_run(),
        )
        .await;
        if !result.ready {
            warn!(
                app = %self.app,
                attempts = result.attempts,
                last_error = result.last_error.as_deref().unwrap_or("none"),
                "sync did not converge, continuing"
            );
            ctx.inform(&format!("Unable to sync {}, continuing", self.app));
        }
        Ok(())
    }
}

struct AwaitControllerHost {
    host: String,
    controller: ServiceSettings,
    outer_iterations: u32,
    attempts_per_call: u32,
}

#[async_trait]
impl Step for AwaitControllerHost {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.dry_run() {
            info!(host = %self.host, "[dry-run] skipping host readiness wait");
            return Ok(());
        }
        ctx.inform(&format!("Waiting for {} to answer", self.host));
        let collaborators = ctx.collaborators();
        let readiness = await_host_with_restarts(
            collaborators.scm.as_ref(),
            collaborators.controller.as_ref(),
            &self.host,
            &self.controller,
            self.outer_iterations,
            self.attempts_per_call,
        )
        .await?;
        if !readiness.ready {
            ctx.inform(&format!("{} is not answering yet, continuing", self.host));
        }
        Ok(())
    }
}

/// Result of [`await_host_with_restarts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReadiness {
    pub ready: bool,
    pub iterations: u32,
    pub restarts: u32,
}

/// Poll `host` in up to `outer_iterations` rounds of `attempts_per_call`.
/// After every round that fails, except the last, the controller pods are
/// deleted so a fresh pod picks up the ingress. Never failing to resolve is
/// not an error; a failed delete is.
pub async fn await_host_with_restarts(
    scm: &dyn ScmClient,
    controller: &dyn DeploymentController,
    host: &str,
    workload: &ServiceSettings,
    outer_iterations: u32,
    attempts_per_call: u32,
) -> Result<HostReadiness> {
    let mut restarts = 0;
    for iteration in 1..=outer_iterations {
        if scm.await_host_resolvable(host, attempts_per_call).await {
            info!(host, iteration, restarts, "host is ready");
            return Ok(HostReadiness {
                ready: true,
                iterations: iteration,
                restarts,
            });
        }
        if iteration < outer_iterations {
            debug!(host, iteration, "host not ready, restarting controller");
            controller
                .delete_by_label(&workload.namespace, &workload.selector)
                .await?;
            restarts += 1;
        }
    }
    warn!(host, iterations = outer_iterations, "host never became ready");
    Ok(HostReadiness {
        ready: false,
        iterations: outer_iterations,
        restarts,
    })
}

struct MarkComplete;

#[async_trait]
impl Step for MarkComplete {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.inform("Cluster install complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::state::RunFlags;

    #[test]
    fn test_canonical_plan_shape() {
        let config = LaunchConfig::default();
        let plan = bootstrap_plan(&config, ScmProvider::Gitlab);

        let ids: Vec<_> = plan.phases().iter().map(|p| p.id).collect();
        assert_eq!(ids.first(), Some(&"scm-credentials"));
        assert_eq!(ids.last(), Some(&"install-complete"));
        assert_eq!(ids.len(), 22);

        let keys: Vec<_> = plan.checkpoint_keys().collect();
        assert_eq!(
            keys,
            vec![
                "gitlab.credentials",
                "launch.deployed",
                "gitlab.oidc-created",
                "gitlab.gitops-pushed",
                "controller.oidc-patched",
                "gitlab.registered",
                "cluster.install-complete",
            ]
        );
    }

    #[test]
    fn test_checkpoint_keys_follow_provider() {
        let plan = bootstrap_plan(&LaunchConfig::default(), ScmProvider::Github);
        let registry = plan
            .phases()
            .iter()
            .find(|p| p.id == "registry-repoint")
            .unwrap();
        assert_eq!(registry.checkpoint.as_deref(), Some("github.registered"));
        assert_eq!(
            registry.depends_on,
            vec![
                "github.gitops-pushed".to_string(),
                "controller.oidc-patched".to_string()
            ]
        );
    }

    #[test]
    fn test_skip_flags_drop_conditional_phases_from_totals() {
        let plan = bootstrap_plan(&LaunchConfig::default(), ScmProvider::Gitlab);
        let flags = RunFlags {
            skip_scm: true,
            skip_vault: true,
            ..RunFlags::default()
        };
        let totals = plan.tracker_totals(&flags);

        assert!(totals.iter().all(|(t, _)| t.id != STEP_VAULT.id));
        assert!(totals.iter().all(|(t, _)| t.id != STEP_VAULT_BACKEND.id));
        let (_, params) = totals
            .iter()
            .find(|(t, _)| t.id == STEP_PARAMETERS.id)
            .unwrap();
        assert_eq!(*params, 1);
    }
}
