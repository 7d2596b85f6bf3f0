//! Sync-until-ready for deployed applications
//!
//! Each attempt triggers a sync and inspects the reported health. Transport
//! failures and out-of-sync states both count as a failed attempt; running
//! out of attempts yields `ready: false`, never an error.

use crate::bootstrap::collaborators::{DeploymentController, ForwardEndpoint};
use crate::bootstrap::poller::{RetryPolicy, poll};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub ready: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub async fn sync_until_ready(
    controller: &dyn DeploymentController,
    endpoint: &ForwardEndpoint,
    app: &str,
    token: &str,
    policy: &RetryPolicy,
    dry_run: bool,
) -> SyncResult {
    if dry_run {
        info!(app, "[dry-run] sync skipped");
        return SyncResult {
            ready: true,
            attempts: 0,
            last_error: None,
        };
    }

    let last_error: Mutex<Option<String>> = Mutex::new(None);
    let outcome = poll(policy, |attempt| {
        let last_error = &last_error;
        async move {
            match controller.trigger_sync(endpoint, app, token).await {
                Ok(health) if health.is_ready() => true,
                Ok(health) => {
                    debug!(
                        app,
                        attempt,
                        sync = %health.sync_status,
                        health = %health.health_status,
                        "application not synced yet"
                    );
                    false
                }
                Err(err) => {
                    debug!(app, attempt, error = %err, "sync request failed");
                    if let Ok(mut slot) = last_error.lock() {
                        *slot = Some(err.to_string());
                    }
                    false
                }
            }
        }
    })
    .await;

    let last_error = last_error.into_inner().unwrap_or_default();
    if outcome.success {
        info!(app, attempts = outcome.attempts, "application synced");
    } else {
        warn!(app, attempts = outcome.attempts, "application did not converge");
    }

    SyncResult {
        ready: outcome.success,
        attempts: outcome.attempts,
        last_error,
    }
}
