//! Obtains short-lived session credentials from the issuance endpoint.

use crate::error::SessionError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// A short-lived bearer credential authorizing one transport connection.
///
/// Created per connect attempt, immutable, discarded on disconnect. The
/// controller never holds more than one at a time.
#[derive(Debug, Clone)]
pub struct SessionCredential {
    pub token: String,
    /// Transport URL, already rewritten to the transport's native scheme.
    pub transport_url: String,
    pub room: String,
    /// Participant identity the credential was issued for, when the
    /// endpoint reports one.
    pub issued_for: Option<String>,
}

/// Issues session credentials. The controller talks to the issuance
/// endpoint only through this trait so tests can script it.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Obtains a fresh credential, optionally bound to an agent preset.
    ///
    /// All failure causes fold into [`SessionError::TokenAcquisition`];
    /// this layer never retries.
    async fn issue(&self, preset: Option<String>) -> Result<SessionCredential, SessionError>;
}

/// Shape of the issuance endpoint's JSON response. The server also emits
/// `participant` and `expires`, which the client does not need beyond
/// logging who the token was cut for.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    room: String,
    #[serde(alias = "livekit_url")]
    transport_url: String,
    participant: Option<String>,
}

/// `GET {endpoint}?preset_id=...` against the token server.
pub struct HttpCredentialClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpCredentialClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialClient {
    async fn issue(&self, preset: Option<String>) -> Result<SessionCredential, SessionError> {
        let mut request = self.http.get(&self.endpoint);
        if let Some(preset) = &preset {
            request = request.query(&[("preset_id", preset.as_str())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SessionError::TokenAcquisition(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::TokenAcquisition(format!(
                "endpoint returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::TokenAcquisition(format!("malformed response: {e}")))?;

        if body.token.is_empty() || body.transport_url.is_empty() {
            return Err(SessionError::TokenAcquisition(
                "response missing token or transport URL".to_string(),
            ));
        }

        debug!(room = %body.room, issued_for = ?body.participant, "credential issued");
        Ok(SessionCredential {
            token: body.token,
            transport_url: to_transport_scheme(&body.transport_url),
            room: body.room,
            issued_for: body.participant,
        })
    }
}

/// Rewrites an `http(s)` URL to the transport's native `ws(s)` scheme.
/// URLs already carrying a websocket scheme pass through untouched.
fn to_transport_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
