//! GitLab / GitHub as the SCM provider
//!
//! Provider REST calls use the public API (or the configured `api_url`);
//! token and key provisioning on the in-cluster platform go through the
//! tunnel endpoint. Pushes shell out to `git`.

use crate::adapters::http::{self, str_at};
use crate::adapters::shell::ShellCommand;
use crate::bootstrap::collaborators::{
    ForwardEndpoint, RepoRef, ScmAuth, ScmClient, ScmInitParams, ScmProvider,
};
use crate::bootstrap::poller::{RetryPolicy, poll};
use crate::config::{LaunchConfig, expand};
use crate::error::{Error, HttpSnafu, ReadFileSnafu, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use snafu::ResultExt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const HOST_POLL_INTERVAL: Duration = Duration::from_secs(10);
const KEY_TITLE: &str = "gitops-launch";

#[derive(Debug, Clone)]
struct Session {
    provider: ScmProvider,
    token: String,
    owner: String,
}

pub struct ScmRest {
    public: Client,
    tunnel: Client,
    config: LaunchConfig,
    git: String,
    gitops_dir: PathBuf,
    ssh_public_key: PathBuf,
    session: Mutex<Option<Session>>,
}

impl ScmRest {
    pub fn new(config: &LaunchConfig) -> Result<Self> {
        Ok(Self {
            public: http::public_client()?,
            tunnel: http::tunnel_client()?,
            config: config.clone(),
            git: config.binaries.git.clone(),
            gitops_dir: config.gitops_dir(),
            ssh_public_key: expand(&config.scm.ssh_public_key),
            session: Mutex::new(None),
        })
    }

    fn api_url(&self, provider: ScmProvider) -> String {
        self.config.scm_api_url(provider)
    }

    fn session(&self) -> Result<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::InvalidFlags {
                reason: "SCM credentials were not validated before the run".to_string(),
            })
    }

    fn remember(&self, session: Session) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    fn authorized(request: RequestBuilder, provider: ScmProvider, token: &str) -> RequestBuilder {
        match provider {
            ScmProvider::Gitlab => request.header("PRIVATE-TOKEN", token),
            ScmProvider::Github => request.bearer_auth(token),
        }
    }

    fn read_public_key(&self) -> Result<String> {
        std::fs::read_to_string(&self.ssh_public_key)
            .map(|key| key.trim().to_string())
            .context(ReadFileSnafu {
                path: &self.ssh_public_key,
            })
    }

    async fn ensure_repository(&self, session: &Session, name: &str) -> Result<()> {
        let action = format!("create repository {name}");
        match session.provider {
            ScmProvider::Gitlab => {
                let request = self
                    .public
                    .post(format!("{}/projects", self.api_url(session.provider)))
                    .json(&json!({ "name": name, "path": name, "visibility": "private" }));
                http::send_idempotent(
                    Self::authorized(request, session.provider, &session.token),
                    &action,
                    &[StatusCode::BAD_REQUEST],
                )
                .await
            }
            ScmProvider::Github => {
                let body = json!({ "name": name, "private": true });
                let org = self
                    .public
                    .post(format!("{}/orgs/{}/repos", self.api_url(session.provider), session.owner))
                    .json(&body);
                let response = Self::authorized(org, session.provider, &session.token)
                    .send()
                    .await
                    .context(HttpSnafu { action: &action })?;
                match response.status() {
                    status if status.is_success() || status == StatusCode::UNPROCESSABLE_ENTITY => {
                        Ok(())
                    }
                    // The owner is a user account, not an organization.
                    StatusCode::NOT_FOUND => {
                        let user = self
                            .public
                            .post(format!("{}/user/repos", self.api_url(session.provider)))
                            .json(&body);
                        http::send_idempotent(
                            Self::authorized(user, session.provider, &session.token),
                            &action,
                            &[StatusCode::UNPROCESSABLE_ENTITY],
                        )
                        .await
                    }
                    status => Err(Error::HttpStatus {
                        action,
                        status: status.as_u16(),
                    }),
                }
            }
        }
    }

    async fn ensure_team(&self, session: &Session, team: &str) -> Result<()> {
        match session.provider {
            ScmProvider::Github => {
                let request = self
                    .public
                    .post(format!("{}/orgs/{}/teams", self.api_url(session.provider), session.owner))
                    .json(&json!({ "name": team, "privacy": "closed" }));
                http::send_idempotent(
                    Self::authorized(request, session.provider, &session.token),
                    &format!("create team {team}"),
                    &[StatusCode::UNPROCESSABLE_ENTITY],
                )
                .await
            }
            ScmProvider::Gitlab => {
                debug!(team, "gitlab teams are managed as subgroups by terraform");
                Ok(())
            }
        }
    }

    async fn host_answers(&self, host: &str) -> bool {
        if tokio::net::lookup_host((host, 443)).await.is_err() {
            return false;
        }
        self.tunnel
            .get(format!("https://{host}"))
            .send()
            .await
            .is_ok()
    }
}

#[async_trait]
impl ScmClient for ScmRest {
    async fn validate_credentials(&self, provider: ScmProvider, owner: &str) -> Result<ScmAuth> {
        let token = std::env::var(provider.token_env())
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::MissingEnv {
                name: provider.token_env().to_string(),
            })?;

        let action = format!("validate {provider} credentials");
        let request = Self::authorized(
            self.public.get(format!("{}/user", self.api_url(provider))),
            provider,
            &token,
        );
        let response = request.send().await.context(HttpSnafu { action: &action })?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::CredentialsRejected {
                    provider: provider.to_string(),
                    reason: format!("status {}", response.status().as_u16()),
                });
            }
            status if !status.is_success() => {
                return Err(Error::HttpStatus {
                    action,
                    status: status.as_u16(),
                });
            }
            _ => {}
        }
        let body: serde_json::Value = response.json().await.context(HttpSnafu { action: &action })?;
        let login = match provider {
            ScmProvider::Gitlab => str_at(&body, "/username"),
            ScmProvider::Github => str_at(&body, "/login"),
        }
        .unwrap_or_default()
        .to_string();

        let owner = if owner.is_empty() { login } else { owner.to_string() };
        self.remember(Session {
            provider,
            token: token.clone(),
            owner: owner.clone(),
        });
        Ok(ScmAuth { token, owner })
    }

    async fn initialize_provider(&self, params: &ScmInitParams) -> Result<()> {
        let session = Session {
            provider: params.provider,
            token: params.token.clone(),
            owner: params.owner.clone(),
        };
        for repository in &params.repositories {
            self.ensure_repository(&session, repository).await?;
        }
        for team in &params.teams {
            self.ensure_team(&session, team).await?;
        }
        info!(
            provider = %params.provider,
            repositories = params.repositories.len(),
            teams = params.teams.len(),
            "SCM provider initialized"
        );
        self.remember(session);
        Ok(())
    }

    async fn provision_tokens(
        &self,
        provider: ScmProvider,
        endpoint: &ForwardEndpoint,
    ) -> Result<()> {
        if provider == ScmProvider::Github {
            debug!("github pulls authenticate with the registered ssh key; no deploy token");
            return Ok(());
        }
        let session = self.session()?;
        let url = format!(
            "{}/api/v4/groups/{}/deploy_tokens",
            endpoint.http_url(),
            session.owner
        );
        let request = self.tunnel.post(url).json(&json!({
            "name": KEY_TITLE,
            "scopes": ["read_repository", "read_registry"],
        }));
        http::send_idempotent(
            Self::authorized(request, provider, &session.token),
            "create deploy token",
            &[StatusCode::BAD_REQUEST],
        )
        .await
    }

    async fn push_repository(&self, repo: &RepoRef) -> Result<()> {
        let git = || ShellCommand::new(&self.git).arg("-C").arg(&self.gitops_dir);
        if let Err(err) = git().args(["remote", "remove", repo.remote_name.as_str()]).run().await {
            debug!(remote = %repo.remote_name, error = %err, "no previous remote");
        }
        git()
            .args(["remote", "add", repo.remote_name.as_str(), repo.remote_url.as_str()])
            .run()
            .await?;
        git()
            .args(["push", "--set-upstream", repo.remote_name.as_str(), "HEAD:main"])
            .run()
            .await?;
        info!(repo = %repo.name, remote = %repo.remote_name, "repository pushed");
        Ok(())
    }

    async fn register_keys(&self, endpoint: &ForwardEndpoint) -> Result<()> {
        let session = self.session()?;
        let key = self.read_public_key()?;
        let body = json!({ "title": KEY_TITLE, "key": key });
        let (request, already) = match session.provider {
            ScmProvider::Gitlab => (
                self.tunnel
                    .post(format!("{}/api/v4/user/keys", endpoint.http_url()))
                    .json(&body),
                StatusCode::BAD_REQUEST,
            ),
            ScmProvider::Github => (
                self.public
                    .post(format!("{}/user/keys", self.api_url(session.provider)))
                    .json(&body),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        };
        http::send_idempotent(
            Self::authorized(request, session.provider, &session.token),
            "register ssh key",
            &[already],
        )
        .await
    }

    async fn await_host_resolvable(&self, host: &str, attempts_per_call: u32) -> bool {
        let policy = RetryPolicy::constant(attempts_per_call, HOST_POLL_INTERVAL);
        let outcome = poll(&policy, |_| self.host_answers(host)).await;
        if !outcome.success {
            warn!(host, attempts = outcome.attempts, "host not answering yet");
        }
        outcome.success
    }
}
