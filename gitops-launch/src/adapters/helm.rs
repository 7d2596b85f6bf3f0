//! Chart installs with `helm upgrade --install`

use crate::adapters::shell::ShellCommand;
use crate::bootstrap::collaborators::PackageInstaller;
use crate::config::{ReleaseSpec, expand};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

pub struct Helm {
    program: String,
    kubeconfig: PathBuf,
    releases: Vec<ReleaseSpec>,
}

impl Helm {
    pub fn new(program: impl Into<String>, kubeconfig: PathBuf, releases: Vec<ReleaseSpec>) -> Self {
        Self {
            program: program.into(),
            kubeconfig,
            releases,
        }
    }

    fn command(&self, release: &ReleaseSpec) -> ShellCommand {
        let mut command = ShellCommand::new(&self.program)
            .arg("upgrade")
            .arg("--install")
            .arg(&release.name)
            .arg(&release.chart)
            .args(["--repo", release.repo_url.as_str()])
            .args(["--namespace", release.namespace.as_str()])
            .arg("--create-namespace")
            .arg("--kubeconfig")
            .arg(&self.kubeconfig);
        if let Some(version) = &release.version {
            command = command.args(["--version", version.as_str()]);
        }
        if let Some(values) = &release.values {
            command = command.arg("--values").arg(expand(values));
        }
        command
    }
}

#[async_trait]
impl PackageInstaller for Helm {
    async fn install(&self, release: &str) -> Result<()> {
        let spec = self
            .releases
            .iter()
            .find(|r| r.name == release)
            .ok_or_else(|| Error::UnknownRelease {
                name: release.to_string(),
            })?;
        info!(release, chart = %spec.chart, namespace = %spec.namespace, "installing release");
        self.command(spec).run().await?;
        Ok(())
    }
}
