//! Command-line surface

pub mod launch;

use crate::error::Error;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Exit status for configuration errors; anything else that aborts a run
/// exits with 1.
pub const EXIT_CONFIGURATION: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "gitops-launch", version, about = "Bootstrap a GitOps-managed Kubernetes cluster")]
pub struct Cli {
    /// Configuration file (default: $GITOPS_LAUNCH_CONFIG or the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Create (or resume creating) the cluster
    #[command(alias = "launch")]
    Create {
        /// Walk the plan without mutating anything
        #[arg(long)]
        dry_run: bool,

        /// Skip the vault configuration phases
        #[arg(long)]
        skip_vault: bool,

        /// Skip the SCM credential check, provider initialization and
        /// token/key provisioning; later phases still push to the SCM host
        #[arg(long)]
        skip_scm: bool,

        /// Never prompt; quieter output
        #[arg(long)]
        silent: bool,
    },

    /// Check required binaries and environment only
    Check {
        /// Do not require an SCM token
        #[arg(long)]
        skip_scm: bool,
    },

    /// Show checkpoint state
    Status,

    /// Clear every checkpoint so the next create starts over
    Reset {
        /// Required; reset is not undoable
        #[arg(long)]
        yes: bool,
    },
}

impl Commands {
    pub fn is_silent(&self) -> bool {
        matches!(self, Commands::Create { silent: true, .. })
    }
}

/// Exit status for a failed command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let configuration = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<Error>())
        .any(Error::is_configuration);
    if configuration { EXIT_CONFIGURATION } else { 1 }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::Create {
            dry_run,
            skip_vault,
            skip_scm,
            silent,
        } => {
            let flags = crate::bootstrap::RunFlags {
                dry_run,
                skip_vault,
                skip_scm,
                silent,
            };
            launch::create(config, flags).await
        }
        Commands::Check { skip_scm } => launch::check(config, skip_scm),
        Commands::Status => launch::status(config),
        Commands::Reset { yes } => launch::reset(config, yes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_create_flags_parse() {
        let cli = Cli::parse_from(["gitops-launch", "create", "--dry-run", "--skip-vault"]);
        match cli.command {
            Commands::Create {
                dry_run,
                skip_vault,
                skip_scm,
                silent,
            } => {
                assert!(dry_run && skip_vault);
                assert!(!skip_scm && !silent);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_skip_scm_help_names_the_skipped_phases() {
        use clap::CommandFactory;

        let cli = Cli::command();
        let create = cli.find_subcommand("create").unwrap();
        let help = create
            .get_arguments()
            .find(|arg| arg.get_id() == "skip_scm")
            .and_then(|arg| arg.get_help())
            .unwrap()
            .to_string();

        assert!(help.contains("credential check"), "{help}");
        assert!(help.contains("provider initialization"), "{help}");
        assert!(help.contains("token/key provisioning"), "{help}");
        assert!(!help.contains("every phase"), "{help}");
    }

    #[test]
    fn test_exit_code_classifies_configuration_errors() {
        let config: anyhow::Result<()> = Err(Error::MissingEnv {
            name: "GITLAB_TOKEN".to_string(),
        })
        .context("pre-flight failed");
        assert_eq!(exit_code(&config.unwrap_err()), EXIT_CONFIGURATION);

        let mutation: anyhow::Result<()> = Err(Error::PushExhausted {
            repo: "gitops".to_string(),
            attempts: 10,
        })
        .context("launch failed");
        assert_eq!(exit_code(&mutation.unwrap_err()), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }
}
