//! Pre-flight checks for a launch
//!
//! Validates that the required binaries are installed with usable versions
//! and that the required environment is set. Nothing here mutates anything.

use crate::bootstrap::collaborators::ScmProvider;
use crate::bootstrap::state::RunFlags;
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use duct::cmd;
use semver::{Version, VersionReq};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BinarySpec {
    pub name: &'static str,
    /// Path or bare program name from the configuration.
    pub program: String,
    pub version_args: &'static [&'static str],
    pub requirement: &'static str,
    pub install_hint: &'static str,
}

#[derive(Debug, Clone)]
pub struct BinaryCheck {
    pub name: String,
    pub found: bool,
    pub installed_version: Option<String>,
    pub required_version: String,
    pub meets_requirement: bool,
    pub path: Option<PathBuf>,
    pub install_hint: String,
}

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub binaries: Vec<BinaryCheck>,
    pub missing_env: Vec<String>,
}

impl PreflightReport {
    pub fn missing_binaries(&self) -> Vec<&BinaryCheck> {
        self.binaries
            .iter()
            .filter(|b| !b.found || !b.meets_requirement)
            .collect()
    }

    pub fn all_met(&self) -> bool {
        self.missing_env.is_empty() && self.missing_binaries().is_empty()
    }

    /// First problem found, as a configuration error.
    pub fn ensure_ready(&self) -> Result<()> {
        if let Some(name) = self.missing_env.first() {
            return Err(Error::MissingEnv { name: name.clone() });
        }
        if let Some(bin) = self.missing_binaries().first() {
            let reason = match &bin.installed_version {
                None => format!("not found on PATH ({})", bin.install_hint),
                Some(version) => format!("version {version} does not satisfy {}", bin.required_version),
            };
            return Err(Error::MissingBinary {
                name: bin.name.clone(),
                reason,
            });
        }
        Ok(())
    }
}

pub fn required_binaries(config: &LaunchConfig) -> Vec<BinarySpec> {
    vec![
        BinarySpec {
            name: "kubectl",
            program: config.binaries.kubectl.clone(),
            version_args: &["version", "--client"],
            requirement: ">=1.25.0",
            install_hint: "https://kubernetes.io/docs/tasks/tools/",
        },
        BinarySpec {
            name: "helm",
            program: config.binaries.helm.clone(),
            version_args: &["version", "--short"],
            requirement: ">=3.10.0",
            install_hint: "https://helm.sh/docs/intro/install/",
        },
        BinarySpec {
            name: "terraform",
            program: config.binaries.terraform.clone(),
            version_args: &["version"],
            requirement: ">=1.3.0",
            install_hint: "https://developer.hashicorp.com/terraform/install",
        },
        BinarySpec {
            name: "git",
            program: config.binaries.git.clone(),
            version_args: &["--version"],
            requirement: ">=2.30.0",
            install_hint: "https://git-scm.com/downloads",
        },
    ]
}

/// Environment the run cannot start without. The SCM token is only known
/// once the provider is; an unresolved provider is checked later by the
/// SCM client itself.
pub fn required_env(flags: &RunFlags, provider: Option<ScmProvider>) -> Vec<&'static str> {
    match provider {
        Some(provider) if !flags.skip_scm => vec![provider.token_env()],
        _ => Vec::new(),
    }
}

/// Names in `required` that are unset or empty.
pub fn missing_env(required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| std::env::var(name).map_or(true, |v| v.trim().is_empty()))
        .map(|name| (*name).to_string())
        .collect()
}

pub fn run_preflight(config: &LaunchConfig, flags: &RunFlags) -> PreflightReport {
    let binaries = required_binaries(config).iter().map(check_binary).collect();
    let missing_env = missing_env(&required_env(flags, config.scm.provider));
    PreflightReport {
        binaries,
        missing_env,
    }
}

fn find_binary(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let output = cmd!("which", program)
        .stdout_capture()
        .stderr_null()
        .unchecked()
        .run()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty())
}

fn get_version(program: &str, args: &[&str]) -> Option<String> {
    let output = cmd(program, args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    extract_version(&text)
}

/// Pull the first `X.Y.Z` out of a version banner.
///   "Client Version: v1.30.1" -> "1.30.1"
///   "v3.14.0+g3fc9f4b" -> "3.14.0"
///   "Terraform v1.6.0 on linux_amd64" -> "1.6.0"
fn extract_version(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"v?(\d+\.\d+\.\d+)").ok()?;
    re.captures(output)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

fn version_meets_requirement(installed: &str, requirement: &str) -> Option<bool> {
    let installed = Version::parse(installed.trim()).ok()?;
    let requirement = VersionReq::parse(requirement.trim()).ok()?;
    Some(requirement.matches(&installed))
}

pub fn check_binary(spec: &BinarySpec) -> BinaryCheck {
    let path = find_binary(&spec.program);
    let found = path.is_some();

    let (installed_version, meets_requirement) = if found {
        match get_version(&spec.program, spec.version_args) {
            Some(version) => {
                let meets = version_meets_requirement(&version, spec.requirement).unwrap_or(false);
                (Some(version), meets)
            }
            // Found but the banner is unrecognised; let the run try it.
            None => (Some("unknown".to_string()), true),
        }
    } else {
        (None, false)
    };
    debug!(binary = spec.name, found, version = ?installed_version, meets_requirement, "binary checked");

    BinaryCheck {
        name: spec.name.to_string(),
        found,
        installed_version,
        required_version: spec.requirement.to_string(),
        meets_requirement,
        path,
        install_hint: spec.install_hint.to_string(),
    }
}
