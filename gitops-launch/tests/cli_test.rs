//! Binary-level tests for the commands that need no cluster.

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Self { dir };
        workspace.write_config("");
        workspace
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.toml")
    }

    fn write_config(&self, extra: &str) {
        let config = format!(
            "state_file = {:?}\nworkspace_dir = {:?}\n{extra}",
            self.state_path().display().to_string(),
            self.dir.path().display().to_string(),
        );
        fs::write(self.config_path(), config).unwrap();
    }

    fn write_state(&self, checks: &[(&str, bool)]) {
        let mut body = String::from("[checks]\n");
        for (key, value) in checks {
            body.push_str(&format!("{key:?} = {value}\n"));
        }
        fs::write(self.state_path(), body).unwrap();
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("gitops-launch").unwrap();
        cmd.arg("--config")
            .arg(self.config_path())
            .args(args)
            .env_remove("GITOPS_LAUNCH_CONFIG")
            .env("RUST_LOG", "warn");
        cmd
    }
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "{output:?}");
    String::from_utf8(output.stdout).unwrap()
}

fn state_mentions_true(path: &Path) -> bool {
    fs::read_to_string(path).is_ok_and(|content| content.contains("true"))
}

#[test]
fn test_status_lists_plan_checkpoints() {
    let workspace = Workspace::new();
    workspace.write_state(&[("launch.deployed", true), ("legacy.flag", true)]);

    let out = stdout(&mut workspace.command(&["status"]));

    assert!(out.contains("Checkpoints (1/7 complete)"), "{out}");
    assert!(out.contains("✅ launch.deployed"));
    assert!(out.contains("⬜ gitlab.credentials"));
    assert!(out.contains("legacy.flag (not in current plan)"));
}

#[test]
fn test_status_follows_configured_provider() {
    let workspace = Workspace::new();
    workspace.write_config("[scm]\nprovider = \"github\"\n");

    let out = stdout(&mut workspace.command(&["status"]));

    assert!(out.contains("github.credentials"), "{out}");
    assert!(!out.contains("gitlab.credentials"));
}

#[test]
fn test_reset_requires_confirmation() {
    let workspace = Workspace::new();
    workspace.write_state(&[("launch.deployed", true)]);

    workspace.command(&["reset"]).assert().failure().code(1);
    assert!(state_mentions_true(&workspace.state_path()));
}

#[test]
fn test_reset_clears_every_checkpoint() {
    let workspace = Workspace::new();
    workspace.write_state(&[
        ("launch.deployed", true),
        ("cluster.install-complete", true),
    ]);

    workspace.command(&["reset", "--yes"]).assert().success();

    assert!(!state_mentions_true(&workspace.state_path()));
    let out = stdout(&mut workspace.command(&["status"]));
    assert!(out.contains("Checkpoints (0/7 complete)"), "{out}");
}

#[test]
fn test_create_on_completed_install_does_nothing() {
    let workspace = Workspace::new();
    workspace.write_state(&[("cluster.install-complete", true)]);

    let out = stdout(&mut workspace.command(&["create", "--silent"]));

    assert!(out.contains("already completed"), "{out}");
}

#[test]
fn test_invalid_configuration_exits_with_configuration_code() {
    let workspace = Workspace::new();
    workspace.write_config("[retry.sync]\nmax_attempts = 0\ninterval_ms = 10\n");

    workspace.command(&["status"]).assert().failure().code(2);
}

#[test]
fn test_corrupt_state_is_reported() {
    let workspace = Workspace::new();
    fs::write(workspace.state_path(), "checks = [not toml").unwrap();

    workspace.command(&["status"]).assert().failure().code(1);
}
