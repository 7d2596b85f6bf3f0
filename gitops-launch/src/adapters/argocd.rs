//! Argo CD as the deployment controller
//!
//! API calls go through the tunnel endpoint handed in by the caller; pod
//! and secret operations go straight to the Kubernetes API.

use crate::adapters::http::{self, str_at};
use crate::adapters::kube_cluster::KubeCluster;
use crate::bootstrap::collaborators::{AppHealth, DeploymentController, ForwardEndpoint};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

const ADMIN_USER: &str = "admin";
const INITIAL_ADMIN_SECRET: &str = "argocd-initial-admin-secret";
const IN_CLUSTER: &str = "https://kubernetes.default.svc";

pub struct ArgoCd {
    http: Client,
    kube: Arc<KubeCluster>,
    namespace: String,
}

impl ArgoCd {
    pub fn new(kube: Arc<KubeCluster>, namespace: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http::tunnel_client()?,
            kube,
            namespace: namespace.into(),
        })
    }

    async fn application_health(
        &self,
        endpoint: &ForwardEndpoint,
        app: &str,
        token: &str,
    ) -> Result<AppHealth> {
        let url = format!("{}/api/v1/applications/{app}", endpoint.http_url());
        let body = http::send_json(
            self.http.get(url).bearer_auth(token),
            &format!("read application {app}"),
        )
        .await?;
        Ok(AppHealth {
            sync_status: str_at(&body, "/status/sync/status")
                .unwrap_or("Unknown")
                .to_string(),
            health_status: str_at(&body, "/status/health/status")
                .unwrap_or("Unknown")
                .to_string(),
        })
    }
}

/// An auto-syncing Application in the controller's own namespace.
fn application(name: &str, namespace: &str, repo_url: &str, path: &str) -> Value {
    json!({
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "project": "default",
            "source": { "repoURL": repo_url, "path": path, "targetRevision": "HEAD" },
            "destination": { "server": IN_CLUSTER, "namespace": namespace },
            "syncPolicy": { "automated": { "prune": true, "selfHeal": true } },
        },
    })
}

#[async_trait]
impl DeploymentController for ArgoCd {
    async fn get_auth_token(&self, dry_run: bool, endpoint: &ForwardEndpoint) -> Result<String> {
        if dry_run {
            return Ok("dry-run-token".to_string());
        }
        let password = self
            .kube
            .read_secret_key(&self.namespace, INITIAL_ADMIN_SECRET, "password")
            .await?;
        let body = http::send_json(
            self.http
                .post(format!("{}/api/v1/session", endpoint.http_url()))
                .json(&json!({ "username": ADMIN_USER, "password": password })),
            "create argocd session",
        )
        .await?;
        let token = str_at(&body, "/token").ok_or_else(|| Error::UnexpectedResponse {
            action: "create argocd session".to_string(),
            detail: "no token".to_string(),
        })?;
        debug!(tunnel = endpoint.tunnel_id, "argocd session created");
        Ok(token.to_string())
    }

    async fn trigger_sync(
        &self,
        endpoint: &ForwardEndpoint,
        app: &str,
        token: &str,
    ) -> Result<AppHealth> {
        let url = format!("{}/api/v1/applications/{app}/sync", endpoint.http_url());
        http::send(
            self.http.post(url).bearer_auth(token).json(&json!({})),
            &format!("sync application {app}"),
        )
        .await?;
        self.application_health(endpoint, app, token).await
    }

    async fn delete_by_label(&self, namespace: &str, selector: &str) -> Result<()> {
        self.kube.delete_pods(namespace, selector).await
    }

    async fn patch_secret(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        self.kube.patch_secret_key(namespace, name, key, value).await
    }

    async fn register_repository(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        repo_url: &str,
    ) -> Result<()> {
        let url = format!("{}/api/v1/repositories?upsert=true", endpoint.http_url());
        http::send(
            self.http
                .post(url)
                .bearer_auth(token)
                .json(&json!({ "repo": repo_url, "type": "git", "insecure": true })),
            "register repository",
        )
        .await?;
        info!(repo_url, "repository registered with argocd");
        Ok(())
    }

    async fn create_application(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        app: &str,
        repo_url: &str,
        path: &str,
    ) -> Result<()> {
        let url = format!("{}/api/v1/applications?upsert=true", endpoint.http_url());
        http::send(
            self.http
                .post(url)
                .bearer_auth(token)
                .json(&application(app, &self.namespace, repo_url, path)),
            &format!("create application {app}"),
        )
        .await?;
        info!(app, repo_url, path, "application created");
        Ok(())
    }

    async fn repoint_application(
        &self,
        endpoint: &ForwardEndpoint,
        token: &str,
        app: &str,
        repo_url: &str,
    ) -> Result<()> {
        let patch = json!({ "spec": { "source": { "repoURL": repo_url } } }).to_string();
        let url = format!("{}/api/v1/applications/{app}", endpoint.http_url());
        http::send(
            self.http.patch(url).bearer_auth(token).json(&json!({
                "name": app,
                "patch": patch,
                "patchType": "merge",
            })),
            &format!("re-point application {app}"),
        )
        .await?;
        info!(app, repo_url, "application re-pointed");
        Ok(())
    }
}
