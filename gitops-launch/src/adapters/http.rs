//! Shared HTTP plumbing for the REST adapters

use crate::error::{Error, HttpSnafu, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use snafu::ResultExt;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for in-cluster services reached through tunnels. Those serve
/// self-signed certificates, so verification is off.
pub fn tunnel_client() -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context(HttpSnafu {
            action: "build tunnel http client",
        })
}

pub fn public_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("gitops-launch/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context(HttpSnafu {
            action: "build http client",
        })
}

/// Send and require a 2xx status.
pub async fn send(request: RequestBuilder, action: &str) -> Result<Response> {
    let response = request.send().await.context(HttpSnafu { action })?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus {
            action: action.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// Send, require a 2xx status and decode the JSON body.
pub async fn send_json(request: RequestBuilder, action: &str) -> Result<Value> {
    send(request, action)
        .await?
        .json()
        .await
        .context(HttpSnafu { action })
}

/// Send, accepting the listed non-2xx statuses as "already done".
pub async fn send_idempotent(
    request: RequestBuilder,
    action: &str,
    already_done: &[StatusCode],
) -> Result<()> {
    let response = request.send().await.context(HttpSnafu { action })?;
    let status = response.status();
    if status.is_success() || already_done.contains(&status) {
        return Ok(());
    }
    Err(Error::HttpStatus {
        action: action.to_string(),
        status: status.as_u16(),
    })
}

/// String at a JSON pointer, if present.
pub fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_str_at() {
        let body = json!({ "status": { "sync": { "status": "Synced" } } });
        assert_eq!(str_at(&body, "/status/sync/status"), Some("Synced"));
        assert_eq!(str_at(&body, "/status/health/status"), None);
    }

    #[test]
    fn test_clients_build() {
        assert!(tunnel_client().is_ok());
        assert!(public_client().is_ok());
    }
}
