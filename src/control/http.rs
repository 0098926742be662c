//! HTTP-Umsetzung der Control-Plane
//!
//! - `POST /calls/make {to}` → `{callId, status}`
//! - `POST /calls/accept/{callId}`
//! - `POST /calls/reject/{callId}`
//! - `POST /calls/hangup/{callId}`

use super::{validate_number, CallControl, ControlAction, ControlError, DialResponse};
use crate::config::ServerConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use url::Url;

pub struct HttpCallControl {
    http: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpCallControl {
    pub fn new(config: &ServerConfig, auth_token: Option<String>) -> Result<Self, ControlError> {
        let base_url = Url::parse(&config.api_url)
            .map_err(|e| ControlError::Validation(format!("api_url: {}", e)))?;

        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ControlError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            auth_token,
        })
    }

    /// Hängt Pfadsegmente an die Basis-URL (mit Escaping der Call-ID)
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ControlError> {
        endpoint(&self.base_url, segments)
    }

    async fn post(
        &self,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ControlError> {
        let mut request = self.http.post(url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        request
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))
    }

    async fn call_action(&self, action: ControlAction, call_id: &str) -> Result<(), ControlError> {
        let segment = action.to_string();
        let url = self.endpoint(&["calls", segment.as_str(), call_id])?;
        tracing::debug!("POST {} ({})", url, action);

        let response = self.post(url, None).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(action, status, call_id, &body))
    }
}

#[async_trait]
impl CallControl for HttpCallControl {
    async fn dial(&self, number: &str) -> Result<DialResponse, ControlError> {
        let number = validate_number(number)?;
        let url = self.endpoint(&["calls", "make"])?;
        tracing::debug!("POST {} (dial)", url);

        let response = self.post(url, Some(json!({ "to": number }))).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(ControlAction::Dial, status, number, &body));
        }

        response
            .json::<DialResponse>()
            .await
            .map_err(|e| ControlError::Network(format!("invalid dial response: {}", e)))
    }

    async fn accept(&self, call_id: &str) -> Result<(), ControlError> {
        self.call_action(ControlAction::Accept, call_id).await
    }

    async fn reject(&self, call_id: &str) -> Result<(), ControlError> {
        self.call_action(ControlAction::Reject, call_id).await
    }

    async fn hangup(&self, call_id: &str) -> Result<(), ControlError> {
        self.call_action(ControlAction::Hangup, call_id).await
    }
}

impl std::fmt::Debug for HttpCallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCallControl")
            .field("base_url", &self.base_url.as_str())
            .field("has_token", &self.auth_token.is_some())
            .finish()
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ControlError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ControlError::Validation(format!("api_url cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Übersetzt einen HTTP-Fehlerstatus in die Fehler-Taxonomie
fn classify_failure(
    action: ControlAction,
    status: StatusCode,
    subject: &str,
    body: &str,
) -> ControlError {
    match (action, status) {
        (ControlAction::Dial, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY) => {
            ControlError::Validation(if body.is_empty() {
                format!("server rejected number {}", subject)
            } else {
                body.to_string()
            })
        }
        (ControlAction::Dial, _) => ControlError::Network(format!("dial failed with {}", status)),
        (_, StatusCode::NOT_FOUND) => ControlError::NotFound(subject.to_string()),
        (_, _) => ControlError::Network(format!("{} failed with {}", action, status)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
