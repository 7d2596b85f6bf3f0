//! Cluster access through the Kubernetes API
//!
//! The kubeconfig only exists once the cluster has been launched, so the
//! client is built on first use rather than at construction.

use crate::bootstrap::collaborators::ClusterClient;
use crate::bootstrap::poller::{RetryPolicy, poll};
use crate::error::{Error, KubeSnafu, KubeconfigSnafu, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use serde_json::json;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "gitops-launch";

pub struct KubeCluster {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
    workload: RetryPolicy,
}

impl KubeCluster {
    pub fn new(kubeconfig: PathBuf, workload: RetryPolicy) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
            workload,
        }
    }

    async fn client(&self) -> Result<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let path = &self.kubeconfig;
                let raw = Kubeconfig::read_from(path).context(KubeconfigSnafu { path })?;
                let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
                    .await
                    .context(KubeconfigSnafu { path })?;
                debug!(kubeconfig = %path.display(), "kubernetes client connected");
                Client::try_from(config).context(KubeSnafu {
                    action: "build client",
                })
            })
            .await?;
        Ok(client.clone())
    }

    async fn pods(&self, namespace: &str) -> Result<Api<Pod>> {
        Ok(Api::namespaced(self.client().await?, namespace))
    }

    async fn secrets(&self, namespace: &str) -> Result<Api<Secret>> {
        Ok(Api::namespaced(self.client().await?, namespace))
    }

    pub async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<()> {
        self.pods(namespace)
            .await?
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await
            .context(KubeSnafu {
                action: format!("delete pods {namespace}/{selector}"),
            })?;
        info!(namespace, selector, "pods deleted");
        Ok(())
    }

    /// Merge one key into an existing secret.
    pub async fn patch_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({ "stringData": { key: value } });
        self.secrets(namespace)
            .await?
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(KubeSnafu {
                action: format!("patch secret {namespace}/{name}"),
            })?;
        debug!(namespace, name, key, "secret patched");
        Ok(())
    }

    /// Decoded value of `key` in secret `namespace/name`.
    pub async fn read_secret_key(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let secret = self.secrets(namespace).await?.get(name).await.context(KubeSnafu {
            action: format!("read secret {namespace}/{name}"),
        })?;
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .ok_or_else(|| Error::SecretKeyMissing {
                namespace: namespace.to_string(),
                name: name.to_string(),
                key: key.to_string(),
            })
    }

    /// Create or update a secret from plain string values.
    pub async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            string_data: Some(data.clone()),
            ..Secret::default()
        };
        self.secrets(namespace)
            .await?
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .context(KubeSnafu {
                action: format!("apply secret {namespace}/{name}"),
            })?;
        Ok(())
    }
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

impl KubeCluster {
    /// Poll until at least one pod matches and every match passes `check`.
    async fn wait_for_pods(
        &self,
        dry_run: bool,
        namespace: &str,
        label_selector: &str,
        check: fn(&Pod) -> bool,
        state: &str,
    ) -> Result<()> {
        if dry_run {
            debug!(namespace, label_selector, state, "[dry-run] workload wait skipped");
            return Ok(());
        }

        let api = self.pods(namespace).await?;
        let params = ListParams::default().labels(label_selector);
        let outcome = poll(&self.workload, |attempt| {
            let api = &api;
            let params = &params;
            async move {
                match api.list(params).await {
                    Ok(pods) => !pods.items.is_empty() && pods.items.iter().all(check),
                    Err(err) => {
                        debug!(namespace, label_selector, attempt, error = %err, "pod list failed");
                        false
                    }
                }
            }
        })
        .await;

        if !outcome.success {
            return Err(Error::WorkloadNotReady {
                namespace: namespace.to_string(),
                selector: label_selector.to_string(),
                attempts: outcome.attempts,
            });
        }
        info!(namespace, label_selector, state, "workload up");
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn wait_for_workload(
        &self,
        dry_run: bool,
        namespace: &str,
        label_selector: &str,
    ) -> Result<()> {
        self.wait_for_pods(dry_run, namespace, label_selector, pod_ready, "ready")
            .await
    }

    async fn wait_for_running(
        &self,
        dry_run: bool,
        namespace: &str,
        label_selector: &str,
    ) -> Result<()> {
        self.wait_for_pods(dry_run, namespace, label_selector, pod_running, "running")
            .await
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.apply_secret(namespace, name, data).await
    }
}
