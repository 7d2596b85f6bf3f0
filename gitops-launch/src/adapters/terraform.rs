//! Infrastructure applies with `terraform`

use crate::adapters::shell::ShellCommand;
use crate::bootstrap::collaborators::InfraEngine;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Terraform {
    program: String,
    kubeconfig: PathBuf,
}

impl Terraform {
    pub fn new(program: impl Into<String>, kubeconfig: PathBuf) -> Self {
        Self {
            program: program.into(),
            kubeconfig,
        }
    }

    /// `terraform init` then `terraform apply` in `workdir` with extra
    /// environment on top of the kubeconfig.
    pub async fn apply(&self, workdir: &Path, env: &[(&str, String)]) -> Result<()> {
        info!(workdir = %workdir.display(), "terraform apply");
        self.command(workdir, env)
            .args(["init", "-input=false"])
            .run()
            .await?;
        self.command(workdir, env)
            .args(["apply", "-input=false", "-auto-approve"])
            .run()
            .await?;
        Ok(())
    }

    fn command(&self, workdir: &Path, env: &[(&str, String)]) -> ShellCommand {
        let mut command = ShellCommand::new(&self.program)
            .dir(workdir)
            .env("KUBE_CONFIG_PATH", self.kubeconfig.to_string_lossy())
            .env("TF_IN_AUTOMATION", "1");
        for (key, value) in env {
            command = command.env(*key, value.clone());
        }
        command
    }
}

#[async_trait]
impl InfraEngine for Terraform {
    async fn apply_base(&self, workdir: &Path) -> Result<()> {
        self.apply(workdir, &[]).await
    }

    async fn apply_scm(&self, workdir: &Path) -> Result<()> {
        self.apply(workdir, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_command_carries_kubeconfig_but_hides_it_from_display() {
        let terraform = Terraform::new("terraform", PathBuf::from("/tmp/kubeconfig"));
        let command = terraform
            .command(Path::new("/work"), &[("VAULT_TOKEN", "s3cret".to_string())])
            .args(["apply", "-auto-approve"]);
        assert_eq!(command.display(), "terraform apply -auto-approve");
    }

    #[tokio::test]
    async fn test_failed_init_is_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let terraform = Terraform::new("false", PathBuf::from("/tmp/kubeconfig"));
        let err = terraform.apply_base(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { code: 1, .. }));
    }
}
