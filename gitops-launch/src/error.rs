//! Error taxonomy for the launch core.
//!
//! Three families matter to the orchestrator:
//! - configuration errors, raised before any mutating phase runs
//! - mutation errors, fatal to the run but safe to resume from
//! - plan errors, raised when the plan itself cannot proceed
//!
//! Transient readiness failures (poll exhaustion, sync not converged) are
//! not errors at all; they are reported through `PollOutcome` and
//! `SyncResult`.

use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("environment variable {name} is not set - please set it before continuing"))]
    MissingEnv { name: String },

    #[snafu(display("invalid flag combination: {reason}"))]
    InvalidFlags { reason: String },

    #[snafu(display("invalid retry policy: {reason}"))]
    InvalidRetryPolicy { reason: String },

    #[snafu(display("required binary {name} not usable: {reason}"))]
    MissingBinary { name: String, reason: String },

    #[snafu(display("failed to load configuration from {}", path.display()))]
    ConfigLoad {
        path: PathBuf,
        source: confy::ConfyError,
    },

    #[snafu(display("failed to store configuration to {}", path.display()))]
    ConfigStore {
        path: PathBuf,
        source: confy::ConfyError,
    },

    #[snafu(display("{provider} rejected the supplied credentials: {reason}"))]
    CredentialsRejected { provider: String, reason: String },

    #[snafu(display("no release named {name} in the release table"))]
    UnknownRelease { name: String },

    #[snafu(display("no choice made for: {prompt}"))]
    NoChoice { prompt: String },

    #[snafu(display("terminal I/O failed while asking: {prompt}"))]
    Terminal {
        prompt: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to read state file {}", path.display()))]
    StateRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("state file {} is corrupt", path.display()))]
    StateParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("failed to flush state file {}", path.display()))]
    StateFlush {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode state"))]
    StateEncode { source: toml::ser::Error },

    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to execute: {command}"))]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("command failed: {command} (exit {code}): {stderr}"))]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[snafu(display("failed to read kubeconfig {}", path.display()))]
    Kubeconfig {
        path: PathBuf,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("{namespace}/{selector} not ready after {attempts} attempts"))]
    WorkloadNotReady {
        namespace: String,
        selector: String,
        attempts: u32,
    },

    #[snafu(display("secret {namespace}/{name} has no key {key}"))]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: String,
    },

    #[snafu(display("kubernetes API call failed: {action}"))]
    Kube {
        action: String,
        source: kube::Error,
    },

    #[snafu(display("http request failed: {action}"))]
    Http {
        action: String,
        source: reqwest::Error,
    },

    #[snafu(display("{action} returned status {status}"))]
    HttpStatus { action: String, status: u16 },

    #[snafu(display("{action}: unexpected response, {detail}"))]
    UnexpectedResponse { action: String, detail: String },

    #[snafu(display("could not push {repo} after {attempts} attempts"))]
    PushExhausted { repo: String, attempts: u32 },

    #[snafu(display("phase {phase} requires checkpoint {key}, which is not complete"))]
    DependencyUnmet { phase: String, key: String },

    #[snafu(display("a tunnel to {namespace}/{service} is already live"))]
    TunnelBusy { namespace: String, service: String },

    #[snafu(display("failed to open tunnel to {namespace}/{service}: {reason}"))]
    TunnelOpen {
        namespace: String,
        service: String,
        reason: String,
    },
}

impl Error {
    /// Configuration errors are detected before any state mutation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::MissingEnv { .. }
                | Error::InvalidFlags { .. }
                | Error::InvalidRetryPolicy { .. }
                | Error::MissingBinary { .. }
                | Error::ConfigLoad { .. }
                | Error::ConfigStore { .. }
                | Error::CredentialsRejected { .. }
                | Error::UnknownRelease { .. }
                | Error::NoChoice { .. }
                | Error::Terminal { .. }
                | Error::Kubeconfig { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
