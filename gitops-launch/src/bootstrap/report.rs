//! Human-readable launch report: checkpoint progress and prerequisites

use crate::bootstrap::preflight::PreflightReport;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStatus {
    pub key: String,
    pub complete: bool,
    /// False for keys on disk that the current plan does not know about.
    pub known: bool,
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub timestamp: String,
    pub state_path: PathBuf,
    pub checkpoints: Vec<CheckpointStatus>,
    pub preflight: Option<PreflightReport>,
}

impl LaunchReport {
    /// Plan keys first, in plan order, then anything else found on disk.
    pub fn new<'a>(
        state_path: PathBuf,
        plan_keys: impl IntoIterator<Item = &'a str>,
        snapshot: &BTreeMap<String, bool>,
    ) -> Self {
        let mut checkpoints: Vec<CheckpointStatus> = plan_keys
            .into_iter()
            .map(|key| CheckpointStatus {
                key: key.to_string(),
                complete: snapshot.get(key).copied().unwrap_or(false),
                known: true,
            })
            .collect();
        for (key, complete) in snapshot {
            if !checkpoints.iter().any(|c| &c.key == key) {
                checkpoints.push(CheckpointStatus {
                    key: key.clone(),
                    complete: *complete,
                    known: false,
                });
            }
        }
        Self {
            timestamp: Utc::now().to_rfc3339(),
            state_path,
            checkpoints,
            preflight: None,
        }
    }

    pub fn with_preflight(mut self, preflight: PreflightReport) -> Self {
        self.preflight = Some(preflight);
        self
    }

    pub fn completed(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.known && c.complete).count()
    }

    pub fn total(&self) -> usize {
        self.checkpoints.iter().filter(|c| c.known).count()
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "🚀 gitops-launch status")?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(f, "Generated: {}", self.timestamp)?;
        writeln!(f, "State:     {}", self.state_path.display())?;
        writeln!(f)?;

        writeln!(
            f,
            "📋 Checkpoints ({}/{} complete):",
            self.completed(),
            self.total()
        )?;
        for checkpoint in &self.checkpoints {
            let status = if checkpoint.complete { "✅" } else { "⬜" };
            let note = if checkpoint.known { "" } else { " (not in current plan)" };
            writeln!(f, "  {status} {}{note}", checkpoint.key)?;
        }

        if let Some(preflight) = &self.preflight {
            writeln!(f)?;
            write_preflight(f, preflight)?;
        }
        Ok(())
    }
}

fn write_preflight(f: &mut fmt::Formatter<'_>, preflight: &PreflightReport) -> fmt::Result {
    writeln!(f, "📦 Required Binaries:")?;
    for bin in &preflight.binaries {
        let status = if bin.found && bin.meets_requirement {
            "✅"
        } else if bin.found {
            "⚠️"
        } else {
            "❌"
        };
        match &bin.installed_version {
            Some(installed) if bin.meets_requirement => {
                writeln!(f, "  {status} {} (installed: {installed}, OK)", bin.name)?;
            }
            Some(installed) => writeln!(
                f,
                "  {status} {} (installed: {installed}, requires: {})",
                bin.name, bin.required_version
            )?,
            None => writeln!(
                f,
                "  {status} {} (not installed) - {}",
                bin.name, bin.install_hint
            )?,
        }
    }
    for name in &preflight.missing_env {
        writeln!(f, "  ❌ ${name} is not set")?;
    }
    writeln!(f)?;
    if preflight.all_met() {
        writeln!(f, "✅ All prerequisites met")
    } else {
        writeln!(f, "⚠️  Some prerequisites are missing")
    }
}

pub fn print_report(report: &LaunchReport) {
    print!("{report}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::preflight::BinaryCheck;

    #[test]
    fn test_plan_keys_first_then_unknown() {
        let snapshot = BTreeMap::from([
            ("launch.deployed".to_string(), true),
            ("legacy.flag".to_string(), true),
        ]);
        let report = LaunchReport::new(
            PathBuf::from("/tmp/state.toml"),
            ["launch.deployed", "cluster.install-complete"],
            &snapshot,
        );

        let keys: Vec<_> = report.checkpoints.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["launch.deployed", "cluster.install-complete", "legacy.flag"]
        );
        assert_eq!(report.completed(), 1);
        assert_eq!(report.total(), 2);

        let text = report.to_string();
        assert!(text.contains("✅ launch.deployed"));
        assert!(text.contains("⬜ cluster.install-complete"));
        assert!(text.contains("legacy.flag (not in current plan)"));
    }

    #[test]
    fn test_preflight_section() {
        let preflight = PreflightReport {
            binaries: vec![BinaryCheck {
                name: "helm".to_string(),
                found: true,
                installed_version: Some("3.9.0".to_string()),
                required_version: ">=3.10.0".to_string(),
                meets_requirement: false,
                path: Some(PathBuf::from("/usr/bin/helm")),
                install_hint: String::new(),
            }],
            missing_env: vec!["GITLAB_TOKEN".to_string()],
        };
        let report = LaunchReport::new(PathBuf::from("s.toml"), [], &BTreeMap::new())
            .with_preflight(preflight);

        let text = report.to_string();
        assert!(text.contains("⚠️ helm (installed: 3.9.0, requires: >=3.10.0)"));
        assert!(text.contains("$GITLAB_TOKEN is not set"));
        assert!(text.contains("Some prerequisites are missing"));
    }
}
