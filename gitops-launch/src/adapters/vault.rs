//! HashiCorp Vault over its HTTP API
//!
//! The root token and unseal key produced at initialization are kept in a
//! Kubernetes secret next to vault itself, so a resumed run can pick them
//! up again.

use crate::adapters::http::{self, str_at};
use crate::adapters::kube_cluster::KubeCluster;
use crate::adapters::terraform::Terraform;
use crate::bootstrap::collaborators::{ForwardEndpoint, ScmProvider, VaultClient};
use crate::config::LaunchConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const UNSEAL_SECRET: &str = "vault-unseal-secret";
const ROOT_TOKEN_KEY: &str = "root-token";
const UNSEAL_KEY: &str = "unseal-key";

/// An OIDC client vault issues credentials for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoClient {
    pub name: String,
    pub redirect_uri: String,
}

/// The deployment controller and the in-cluster GitLab both log in
/// through vault.
pub fn sso_clients(config: &LaunchConfig) -> Vec<SsoClient> {
    vec![
        SsoClient {
            name: config.controller.sso_client.clone(),
            redirect_uri: format!("https://{}/auth/callback", config.controller_host()),
        },
        SsoClient {
            name: ScmProvider::Gitlab.as_str().to_string(),
            redirect_uri: format!(
                "https://gitlab.{}/users/auth/openid_connect/callback",
                config.domain
            ),
        },
    ]
}

pub struct VaultHttp {
    http: Client,
    kube: Arc<KubeCluster>,
    terraform: Terraform,
    workdir: PathBuf,
    namespace: String,
    clients: Vec<SsoClient>,
}

impl VaultHttp {
    pub fn new(
        config: &LaunchConfig,
        kube: Arc<KubeCluster>,
        terraform: Terraform,
    ) -> Result<Self> {
        Ok(Self {
            http: http::tunnel_client()?,
            kube,
            terraform,
            workdir: config.vault_workdir(),
            namespace: config.vault.namespace.clone(),
            clients: sso_clients(config),
        })
    }

    async fn root_token(&self) -> Result<String> {
        self.kube
            .read_secret_key(&self.namespace, UNSEAL_SECRET, ROOT_TOKEN_KEY)
            .await
    }

    fn authorized(request: RequestBuilder, token: &str) -> RequestBuilder {
        request.header("X-Vault-Token", token)
    }

    async fn initialize(&self, url: &str) -> Result<()> {
        let body = http::send_json(
            self.http
                .put(format!("{url}/v1/sys/init"))
                .json(&json!({ "secret_shares": 1, "secret_threshold": 1 })),
            "initialize vault",
        )
        .await?;
        let (root_token, unseal_key) = init_credentials(&body)?;
        let data = BTreeMap::from([
            (ROOT_TOKEN_KEY.to_string(), root_token),
            (UNSEAL_KEY.to_string(), unseal_key),
        ]);
        self.kube
            .apply_secret(&self.namespace, UNSEAL_SECRET, &data)
            .await?;
        info!(namespace = %self.namespace, "vault initialized, credentials stored");
        Ok(())
    }
}

fn init_credentials(body: &Value) -> Result<(String, String)> {
    let unexpected = |detail: &str| Error::UnexpectedResponse {
        action: "initialize vault".to_string(),
        detail: detail.to_string(),
    };
    let root_token = str_at(body, "/root_token").ok_or_else(|| unexpected("no root token"))?;
    let unseal_key = str_at(body, "/keys_base64/0")
        .or_else(|| str_at(body, "/keys/0"))
        .ok_or_else(|| unexpected("no unseal key"))?;
    Ok((root_token.to_string(), unseal_key.to_string()))
}

#[async_trait]
impl VaultClient for VaultHttp {
    async fn configure(&self, endpoint: &ForwardEndpoint, bootstrap_phase: bool) -> Result<()> {
        let token = self.root_token().await?;
        self.terraform
            .apply(
                &self.workdir,
                &[
                    ("VAULT_ADDR", endpoint.http_url()),
                    ("VAULT_TOKEN", token),
                    ("TF_VAR_bootstrap", bootstrap_phase.to_string()),
                ],
            )
            .await
    }

    async fn add_sso_integrations(&self, endpoint: &ForwardEndpoint) -> Result<()> {
        let token = self.root_token().await?;
        for client in &self.clients {
            let url = format!(
                "{}/v1/identity/oidc/client/{}",
                endpoint.http_url(),
                client.name
            );
            let request = self.http.post(url).json(&json!({
                "redirect_uris": [client.redirect_uri],
                "assignments": ["allow_all"],
            }));
            http::send(
                Self::authorized(request, &token),
                &format!("register oidc client {}", client.name),
            )
            .await?;
            debug!(client = %client.name, "oidc client registered");
        }
        Ok(())
    }

    async fn unseal(&self, endpoint: &ForwardEndpoint) -> Result<()> {
        let url = endpoint.http_url();
        let init = http::send_json(
            self.http.get(format!("{url}/v1/sys/init")),
            "read vault init status",
        )
        .await?;
        if !init.pointer("/initialized").and_then(Value::as_bool).unwrap_or(false) {
            self.initialize(&url).await?;
        }

        let status = http::send_json(
            self.http.get(format!("{url}/v1/sys/seal-status")),
            "read vault seal status",
        )
        .await?;
        if !status.pointer("/sealed").and_then(Value::as_bool).unwrap_or(true) {
            debug!("vault already unsealed");
            return Ok(());
        }

        let key = self
            .kube
            .read_secret_key(&self.namespace, UNSEAL_SECRET, UNSEAL_KEY)
            .await?;
        http::send(
            self.http
                .put(format!("{url}/v1/sys/unseal"))
                .json(&json!({ "key": key })),
            "unseal vault",
        )
        .await?;
        info!("vault unsealed");
        Ok(())
    }

    async fn sso_client_secret(&self, endpoint: &ForwardEndpoint, client: &str) -> Result<String> {
        let token = self.root_token().await?;
        let url = format!("{}/v1/identity/oidc/client/{client}", endpoint.http_url());
        let action = format!("read oidc client {client}");
        let body = http::send_json(Self::authorized(self.http.get(url), &token), &action).await?;
        str_at(&body, "/data/client_secret")
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedResponse {
                action,
                detail: "no client_secret".to_string(),
            })
    }
}
