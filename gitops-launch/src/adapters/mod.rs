//! Production implementations of the collaborator interfaces.

pub mod argocd;
pub mod chooser;
pub mod helm;
pub mod http;
pub mod kube_cluster;
pub mod kubectl;
pub mod progress;
pub mod scm;
pub mod shell;
pub mod terraform;
pub mod vault;

use crate::bootstrap::collaborators::{Collaborators, ProgressReporter};
use crate::bootstrap::state::RunFlags;
use crate::config::LaunchConfig;
use crate::error::Result;
use std::sync::Arc;

/// Wire the real tools and APIs from configuration. Nothing here touches
/// the cluster; connections are made on first use.
pub fn production(config: &LaunchConfig, flags: RunFlags) -> Result<Collaborators> {
    let kubeconfig = config.kubeconfig_path();
    let kube = Arc::new(kube_cluster::KubeCluster::new(
        kubeconfig.clone(),
        config.retry.workload,
    ));
    let terraform = terraform::Terraform::new(&config.binaries.terraform, kubeconfig.clone());

    let progress: Arc<dyn ProgressReporter> = if flags.silent {
        Arc::new(progress::SilentProgress)
    } else {
        Arc::new(progress::IndicatifProgress::new())
    };

    Ok(Collaborators {
        infra: Arc::new(terraform.clone()),
        cluster: kube.clone(),
        forwarder: Arc::new(kubectl::KubectlForwarder::new(
            &config.binaries.kubectl,
            kubeconfig.clone(),
            config.retry.forward_ready,
        )),
        installer: Arc::new(helm::Helm::new(
            &config.binaries.helm,
            kubeconfig,
            config.releases.clone(),
        )),
        controller: Arc::new(argocd::ArgoCd::new(
            kube.clone(),
            &config.controller.service.namespace,
        )?),
        scm: Arc::new(scm::ScmRest::new(config)?),
        vault: Arc::new(vault::VaultHttp::new(config, kube, terraform)?),
        progress,
        chooser: Arc::new(chooser::ConsoleChooser::new()),
    })
}
