//! `create`, `check`, `status` and `reset`

use crate::adapters;
use crate::bootstrap::preflight::run_preflight;
use crate::bootstrap::report::{LaunchReport, print_report};
use crate::bootstrap::state::{FileStateStore, MemoryStateStore, RunFlags, StateStore, keys};
use crate::bootstrap::bootstrap_plan;
use crate::config::LaunchConfig;
use crate::orchestrator::{Orchestrator, RunSummary};
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

fn load_config(path: Option<&Path>) -> Result<LaunchConfig> {
    load_config_with_path(path).map(|(config, _)| config)
}

fn load_config_with_path(path: Option<&Path>) -> Result<(LaunchConfig, PathBuf)> {
    let (config, path) = LaunchConfig::load(path).context("Failed to load configuration")?;
    info!(config = %path.display(), "configuration loaded");
    Ok((config, path))
}

fn load_state(config: &LaunchConfig) -> Result<FileStateStore> {
    let path = config.state_path();
    FileStateStore::load(&path)
        .with_context(|| format!("Failed to load launch state from {}", path.display()))
}

pub async fn create(config_path: Option<&Path>, flags: RunFlags) -> Result<()> {
    let (config, saved_at) = load_config_with_path(config_path)?;
    let state = load_state(&config)?;

    if state.get_bool(keys::CLUSTER_INSTALL_COMPLETE) {
        println!("✅ Cluster install already completed; nothing to do");
        println!("   Run `gitops-launch reset --yes` to start over");
        return Ok(());
    }

    if !flags.silent {
        println!("🚀 gitops-launch: {}", config.cluster_name);
        if flags.dry_run {
            println!("🔍 Dry run: nothing will be changed");
        }
    }

    let preflight = run_preflight(&config, &flags);
    if flags.dry_run {
        for missing in preflight.missing_binaries() {
            warn!(binary = %missing.name, "not usable; a real run would stop here");
        }
    } else {
        preflight
            .ensure_ready()
            .context("Pre-flight checks failed (run `gitops-launch check` for details)")?;
    }

    let collaborators = adapters::production(&config, flags)?;
    let config = Arc::new(config);

    let summary = if flags.dry_run {
        // Checkpoints written during a dry run stay in memory.
        let overlay = MemoryStateStore::from_snapshot(state.snapshot());
        let mut orchestrator = Orchestrator::new(overlay, collaborators, config, flags)
            .with_config_path(saved_at);
        orchestrator.launch().await.context("Dry run aborted")?
    } else {
        let mut orchestrator = Orchestrator::new(state, collaborators, config, flags)
            .with_config_path(saved_at);
        orchestrator
            .launch()
            .await
            .context("Launch aborted; re-run `gitops-launch create` to resume")?
    };

    if !flags.silent {
        print_summary(&summary, flags.dry_run);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, dry_run: bool) {
    println!();
    if summary.already_complete {
        println!("✅ Cluster install already completed");
        return;
    }
    println!(
        "📊 {} phases run, {} already complete, {} not applicable",
        summary.executed.len(),
        summary.skipped.len(),
        summary.not_applicable.len()
    );
    if dry_run {
        println!("🔍 Dry run finished; no checkpoints were written");
    } else {
        println!("🎉 Cluster launched");
    }
}

pub fn check(config_path: Option<&Path>, skip_scm: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let flags = RunFlags {
        skip_scm,
        ..RunFlags::default()
    };
    let state = load_state(&config)?;
    let preflight = run_preflight(&config, &flags);
    let ready = preflight.ensure_ready();
    let plan = bootstrap_plan(&config, config.scm.provider.unwrap_or_default());
    let report = LaunchReport::new(config.state_path(), plan.checkpoint_keys(), &state.snapshot())
        .with_preflight(preflight);
    print_report(&report);
    ready.context("Pre-flight checks failed")
}

pub fn status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let state = load_state(&config)?;
    let plan = bootstrap_plan(&config, config.scm.provider.unwrap_or_default());
    let report = LaunchReport::new(config.state_path(), plan.checkpoint_keys(), &state.snapshot());
    print_report(&report);
    Ok(())
}

pub fn reset(config_path: Option<&Path>, yes: bool) -> Result<()> {
    if !yes {
        bail!("Reset clears every checkpoint; pass --yes to confirm");
    }
    let config = load_config(config_path)?;
    let mut state = load_state(&config)?;
    state.clear();
    state.flush().context("Failed to write cleared state")?;
    println!("🧹 Cleared launch state at {}", config.state_path().display());
    Ok(())
}
