//! FreeIPA JSON-RPC over a Kerberos-authenticated session.
//!
//! One `login_kerberos` round trades a Negotiate token for an `ipa_session`
//! cookie; JSON-RPC calls then ride on that cookie.

use crate::{
    APP_USER_AGENT,
    broker::{AuthToken, BrokerError, ServiceTarget},
};
use reqwest::{
    Client,
    cookie::Cookie,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE, REFERER},
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use std::{fmt, time::Duration};
use tracing::{debug, error, instrument};
use url::Url;

const SESSION_COOKIE_PREFIX: &str = "ipa_session";
const MAX_ERROR_BODY: usize = 256;

fn transport(err: impl fmt::Display) -> BrokerError {
    BrokerError::DownstreamTransportError(err.to_string())
}

/// The `ipa_session` cookie returned by a successful login.
#[derive(Clone)]
pub struct SessionCookie {
    name: String,
    value: SecretString,
}

impl SessionCookie {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: SecretString::from(value.into()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn header_value(&self) -> String {
        format!("{}={}", self.name, self.value.expose_secret())
    }

    /// Pick the session cookie out of a login response's cookies.
    fn find<'a>(cookies: impl IntoIterator<Item = Cookie<'a>>) -> Option<Self> {
        cookies.into_iter().find_map(|cookie| {
            let value = cookie.value().trim_matches('"');
            (cookie.name().starts_with(SESSION_COOKIE_PREFIX) && !value.is_empty())
                .then(|| Self::new(cookie.name(), value))
        })
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// HTTP Negotiate client for the FreeIPA API.
#[derive(Debug, Clone)]
pub struct NegotiateAdapter {
    client: Client,
    base: String,
    host: String,
}

impl NegotiateAdapter {
    /// # Errors
    /// Returns `ConfigInvalid` if `base_url` is not an http(s) URL with a host,
    /// or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let url = Url::parse(base_url)
            .map_err(|e| BrokerError::ConfigInvalid(format!("directory URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BrokerError::ConfigInvalid(format!(
                "directory URL: unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BrokerError::ConfigInvalid("directory URL: no host".to_string()))?
            .to_ascii_lowercase();
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::ConfigInvalid(format!("directory client: {e}")))?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
            host,
        })
    }

    /// `HTTP/<host>` of the directory.
    #[must_use]
    pub fn target(&self) -> ServiceTarget {
        ServiceTarget::new("HTTP", &self.host)
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Trade `token` for a session cookie. Single round, never retried.
    ///
    /// # Errors
    /// `DownstreamAuthRejected` on a non-success status,
    /// `SessionCookieMissing` when no `ipa_session` cookie comes back,
    /// `DownstreamTransportError` when the request cannot be made.
    #[instrument(skip(self, token), fields(base = %self.base))]
    pub async fn authenticate(&self, token: &AuthToken) -> Result<SessionCookie, BrokerError> {
        let response = self
            .client
            .get(format!("{}/ipa/session/login_kerberos", self.base))
            .header(AUTHORIZATION, format!("Negotiate {}", token.to_base64()))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            error!(%status, "directory login rejected");
            return Err(BrokerError::DownstreamAuthRejected(format!(
                "login_kerberos returned {status}"
            )));
        }

        let cookie = SessionCookie::find(response.cookies())
            .ok_or_else(|| BrokerError::SessionCookieMissing(SESSION_COOKIE_PREFIX.to_string()))?;
        debug!(cookie = cookie.name(), "directory session established");
        Ok(cookie)
    }

    /// Call a JSON-RPC method and return `result.result`.
    ///
    /// # Errors
    /// `DownstreamTransportError` on transport failures, non-success statuses
    /// or unexpected bodies; `DownstreamApplicationError` when the server
    /// answers with an error envelope.
    #[instrument(skip(self, cookie, positional, named), fields(base = %self.base))]
    pub async fn invoke(
        &self,
        cookie: &SessionCookie,
        method: &str,
        positional: Value,
        named: Value,
    ) -> Result<Map<String, Value>, BrokerError> {
        let response = self
            .client
            .post(format!("{}/ipa/session/json", self.base))
            .header(COOKIE, cookie.header_value())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(REFERER, format!("{}/ipa", self.base))
            .json(&json!({ "method": method, "params": [positional, named] }))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            error!(%status, method, "directory call failed");
            return Err(transport(format!("{method}: HTTP {status}: {body}")));
        }

        let json_response: Value = response.json().await.map_err(transport)?;
        if let Some(envelope) = json_response.get("error").filter(|e| !e.is_null()) {
            let code = match &envelope["code"] {
                Value::String(code) => code.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let message = envelope["message"].as_str().unwrap_or_default().to_string();
            return Err(BrokerError::DownstreamApplicationError { code, message });
        }

        match &json_response["result"]["result"] {
            Value::Object(result) => Ok(result.clone()),
            _ => Err(transport(format!("{method}: response carried no result"))),
        }
    }

    /// `user_show` with all attributes.
    ///
    /// # Errors
    /// See [`invoke`](Self::invoke).
    pub async fn user_show(
        &self,
        cookie: &SessionCookie,
        uid: &str,
    ) -> Result<Map<String, Value>, BrokerError> {
        self.invoke(cookie, "user_show", json!([uid]), json!({ "all": true }))
            .await
    }
}
