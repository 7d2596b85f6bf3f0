//! Scoped tunnels into the cluster
//!
//! A [`TunnelHandle`] owns the forward process it was created with and
//! terminates it on [`TunnelHandle::release`] or on drop, whichever comes
//! first. The manager refuses a second live tunnel to the same
//! namespace/service and never reconnects on its own.

use crate::bootstrap::collaborators::{ForwardEndpoint, ForwardProcess, PortForwarder, PortMapping};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTarget {
    pub namespace: String,
    pub service: String,
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

type LiveTable = Arc<Mutex<HashMap<TunnelTarget, u64>>>;

fn lock(live: &LiveTable) -> MutexGuard<'_, HashMap<TunnelTarget, u64>> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TunnelManager {
    forwarder: Arc<dyn PortForwarder>,
    dry_run: bool,
    live: LiveTable,
    next_id: AtomicU64,
}

impl TunnelManager {
    pub fn new(forwarder: Arc<dyn PortForwarder>, dry_run: bool) -> Self {
        Self {
            forwarder,
            dry_run,
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a forward to `service` in `namespace`. Fails if one is already
    /// live for that target or the forward process cannot be started.
    pub async fn acquire(
        &self,
        namespace: &str,
        service: &str,
        ports: PortMapping,
        owner: &str,
    ) -> Result<TunnelHandle> {
        let target = TunnelTarget {
            namespace: namespace.to_string(),
            service: service.to_string(),
        };
        // Reserve the target before opening so a concurrent acquire sees it.
        let id = {
            let mut live = lock(&self.live);
            if live.contains_key(&target) {
                return Err(Error::TunnelBusy {
                    namespace: target.namespace,
                    service: target.service,
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            live.insert(target.clone(), id);
            id
        };
        let mut reservation = Reservation {
            live: &self.live,
            target: &target,
            id,
            armed: true,
        };

        let process = self
            .forwarder
            .open_forward(self.dry_run, namespace, service, ports)
            .await?;
        reservation.armed = false;
        drop(reservation);
        info!(tunnel = id, %target, %ports, owner, "tunnel opened");

        Ok(TunnelHandle {
            id,
            target,
            ports,
            owner: owner.to_string(),
            process: Some(process),
            live: Arc::clone(&self.live),
        })
    }

    pub fn is_live(&self, namespace: &str, service: &str) -> bool {
        lock(&self.live).contains_key(&TunnelTarget {
            namespace: namespace.to_string(),
            service: service.to_string(),
        })
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }
}

/// Frees a reserved target if the open fails or is abandoned.
struct Reservation<'a> {
    live: &'a LiveTable,
    target: &'a TunnelTarget,
    id: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut live = lock(self.live);
        if live.get(self.target) == Some(&self.id) {
            live.remove(self.target);
        }
    }
}

pub struct TunnelHandle {
    id: u64,
    target: TunnelTarget,
    ports: PortMapping,
    owner: String,
    process: Option<Box<dyn ForwardProcess>>,
    live: LiveTable,
}

impl TunnelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn local_port(&self) -> u16 {
        self.ports.local
    }

    pub fn remote_port(&self) -> u16 {
        self.ports.remote
    }

    pub fn endpoint(&self) -> ForwardEndpoint {
        ForwardEndpoint {
            tunnel_id: self.id,
            local_port: self.ports.local,
        }
    }

    pub fn is_released(&self) -> bool {
        self.process.is_none()
    }

    /// Terminate the forward process. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        process.terminate();

        let mut live = lock(&self.live);
        if live.get(&self.target) == Some(&self.id) {
            live.remove(&self.target);
        }
        debug!(tunnel = self.id, target = %self.target, owner = %self.owner, "tunnel released");
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("ports", &self.ports)
            .field("owner", &self.owner)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;

    struct CountingProcess(Arc<AtomicUsize>);

    impl ForwardProcess for CountingProcess {
        fn terminate(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingForwarder {
        terminated: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl PortForwarder for CountingForwarder {
        async fn open_forward(
            &self,
            _dry_run: bool,
            namespace: &str,
            service: &str,
            _ports: PortMapping,
        ) -> Result<Box<dyn ForwardProcess>> {
            if self.fail {
                return Err(Error::TunnelOpen {
                    namespace: namespace.to_string(),
                    service: service.to_string(),
                    reason: "kubectl not found".to_string(),
                });
            }
            Ok(Box::new(CountingProcess(Arc::clone(&self.terminated))))
        }
    }

    const PORTS: PortMapping = PortMapping {
        local: 8080,
        remote: 80,
    };

    #[tokio::test]
    async fn test_release_is_idempotent_and_drop_does_not_repeat() {
        let forwarder = Arc::new(CountingForwarder::default());
        let terminated = Arc::clone(&forwarder.terminated);
        let manager = TunnelManager::new(forwarder, false);

        let mut handle = manager
            .acquire("argocd", "argocd-server", PORTS, "test")
            .await
            .unwrap();
        assert!(manager.is_live("argocd", "argocd-server"));

        handle.release();
        handle.release();
        drop(handle);

        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_second_tunnel_to_same_target_is_refused() {
        let manager = TunnelManager::new(Arc::new(CountingForwarder::default()), false);

        let first = manager
            .acquire("vault", "vault", PORTS, "test")
            .await
            .unwrap();
        let err = manager
            .acquire("vault", "vault", PORTS, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelBusy { .. }));

        drop(first);
        let second = manager.acquire("vault", "vault", PORTS, "test").await.unwrap();
        assert_eq!(second.id(), 2);
    }

    #[tokio::test]
    async fn test_early_return_releases_exactly_once() {
        async fn phase_body(manager: &TunnelManager) -> Result<()> {
            let _tunnel = manager.acquire("gitlab", "webservice", PORTS, "phase").await?;
            Err(Error::PushExhausted {
                repo: "gitops".to_string(),
                attempts: 1,
            })
        }

        let forwarder = Arc::new(CountingForwarder::default());
        let terminated = Arc::clone(&forwarder.terminated);
        let manager = TunnelManager::new(forwarder, false);

        assert!(phase_body(&manager).await.is_err());
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert!(!manager.is_live("gitlab", "webservice"));
    }

    /// Holds every open until the test lets it through.
    struct GatedForwarder {
        gate: tokio::sync::Semaphore,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PortForwarder for GatedForwarder {
        async fn open_forward(
            &self,
            _dry_run: bool,
            _namespace: &str,
            _service: &str,
            _ports: PortMapping,
        ) -> Result<Box<dyn ForwardProcess>> {
            let _permit = self.gate.acquire().await;
            Ok(Box::new(CountingProcess(Arc::clone(&self.terminated))))
        }
    }

    #[tokio::test]
    async fn test_target_is_reserved_while_open_is_in_flight() {
        let manager = TunnelManager::new(
            Arc::new(GatedForwarder {
                gate: tokio::sync::Semaphore::new(0),
                terminated: Arc::new(AtomicUsize::new(0)),
            }),
            false,
        );

        let mut first = Box::pin(manager.acquire("vault", "vault", PORTS, "first"));
        // Drive the first acquire up to the gated open.
        assert!(poll_once(first.as_mut()).await.is_none());
        assert!(manager.is_live("vault", "vault"));

        let err = manager
            .acquire("vault", "vault", PORTS, "second")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelBusy { .. }));

        // Abandoning the pending acquire frees the target.
        drop(first);
        assert!(!manager.is_live("vault", "vault"));
    }

    async fn poll_once<F: Future + Unpin>(mut fut: F) -> Option<F::Output> {
        std::future::poll_fn(|cx| match Future::poll(Pin::new(&mut fut), cx) {
            Poll::Ready(output) => Poll::Ready(Some(output)),
            Poll::Pending => Poll::Ready(None),
        })
        .await
    }

    #[tokio::test]
    async fn test_open_failure_propagates_and_leaves_nothing_live() {
        let forwarder = Arc::new(CountingForwarder {
            fail: true,
            ..CountingForwarder::default()
        });
        let manager = TunnelManager::new(forwarder, false);

        let err = manager
            .acquire("argocd", "argocd-server", PORTS, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelOpen { .. }));
        assert_eq!(manager.live_count(), 0);
    }
}
