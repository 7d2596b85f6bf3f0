//! `kubectl port-forward` tunnels
//!
//! The forward runs as a child process. Readiness is a successful TCP
//! connect to the local port; release sends SIGTERM and falls back to a
//! hard kill if the process lingers.

use crate::bootstrap::collaborators::{ForwardProcess, PortForwarder, PortMapping};
use crate::bootstrap::poller::{RetryPolicy, poll};
use crate::error::{Error, Result};
use async_trait::async_trait;
use duct::{Handle, cmd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub struct KubectlForwarder {
    kubectl: String,
    kubeconfig: PathBuf,
    ready: RetryPolicy,
}

impl KubectlForwarder {
    pub fn new(kubectl: impl Into<String>, kubeconfig: PathBuf, ready: RetryPolicy) -> Self {
        Self {
            kubectl: kubectl.into(),
            kubeconfig,
            ready,
        }
    }
}

/// Stand-in for a forward that was never started.
struct DryRunForward;

impl ForwardProcess for DryRunForward {
    fn terminate(&mut self) {}
}

struct KubectlProcess {
    handle: Handle,
    description: String,
}

impl ForwardProcess for KubectlProcess {
    fn terminate(&mut self) {
        #[cfg(unix)]
        for pid in self.handle.pids() {
            let Ok(pid) = libc::pid_t::try_from(pid) else {
                continue;
            };
            // SAFETY: signalling a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        loop {
            match self.handle.try_wait() {
                Ok(Some(_)) => {
                    debug!(forward = %self.description, "port-forward stopped");
                    return;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                _ => break,
            }
        }

        warn!(forward = %self.description, "port-forward ignored SIGTERM, killing");
        if let Err(err) = self.handle.kill() {
            warn!(forward = %self.description, error = %err, "failed to kill port-forward");
        }
    }
}

#[async_trait]
impl PortForwarder for KubectlForwarder {
    async fn open_forward(
        &self,
        dry_run: bool,
        namespace: &str,
        service: &str,
        ports: PortMapping,
    ) -> Result<Box<dyn ForwardProcess>> {
        if dry_run {
            return Ok(Box::new(DryRunForward));
        }

        let description = format!("{namespace}/{service} {ports}");
        let open_error = |reason: String| Error::TunnelOpen {
            namespace: namespace.to_string(),
            service: service.to_string(),
            reason,
        };

        let handle = cmd!(
            self.kubectl.as_str(),
            "--kubeconfig",
            &self.kubeconfig,
            "--namespace",
            namespace,
            "port-forward",
            format!("svc/{service}"),
            ports.to_string()
        )
        .stdout_null()
        .stderr_capture()
        .unchecked()
        .start()
        .map_err(|err| open_error(err.to_string()))?;
        let mut process = KubectlProcess {
            handle,
            description,
        };

        let local_port = ports.local;
        let outcome = poll(&self.ready, move |_| async move {
            TcpStream::connect(("127.0.0.1", local_port)).await.is_ok()
        })
        .await;
        if outcome.success {
            debug!(forward = %process.description, attempts = outcome.attempts, "port-forward ready");
            return Ok(Box::new(process));
        }

        let exited = matches!(process.handle.try_wait(), Ok(Some(_)));
        process.terminate();
        let reason = if exited {
            "kubectl port-forward exited before the local port opened".to_string()
        } else {
            format!("local port {} never accepted connections", ports.local)
        };
        Err(open_error(reason))
    }
}
