//! Client for the server's admin HTTP API.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crosswire_shared::protocol::MemberInfo;
use crosswire_shared::types::Role;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberStatus {
    #[serde(flatten)]
    pub info: MemberInfo,
    pub muted: bool,
    pub banned: bool,
}

#[derive(Debug, Deserialize)]
struct BlacklistResponse {
    words: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct RestrictBody<'a> {
    reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<u64>,
}

pub struct AdminClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl AdminClient {
    /// `base_url` is e.g. `http://127.0.0.1:8080`. Without a token only the
    /// read-only endpoints work.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut req = self.http.get(self.url(path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let mut req = self.http.request(method, self.url(path)).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        self.send(reqwest::Method::POST, path, body).await
    }

    pub async fn health(&self) -> Result<HealthInfo> {
        self.get("/health").await
    }

    /// Server counters, as the server reports them.
    pub async fn stats(&self) -> Result<serde_json::Value> {
        self.get("/stats").await
    }

    pub async fn members(&self) -> Result<Vec<MemberStatus>> {
        self.get("/members").await
    }

    pub async fn mute(&self, member_id: &str, duration: Option<Duration>, reason: &str) -> Result<()> {
        let body = RestrictBody {
            reason,
            duration_secs: duration.map(|d| d.as_secs()),
        };
        let _: serde_json::Value = self
            .post(&format!("/members/{member_id}/mute"), serde_json::to_value(body)?)
            .await?;
        Ok(())
    }

    pub async fn unmute(&self, member_id: &str) -> Result<()> {
        let _: serde_json::Value = self.post(&format!("/members/{member_id}/unmute"), json!({})).await?;
        Ok(())
    }

    pub async fn ban(&self, member_id: &str, reason: &str, duration: Option<Duration>) -> Result<()> {
        let body = RestrictBody {
            reason,
            duration_secs: duration.map(|d| d.as_secs()),
        };
        let _: serde_json::Value = self
            .post(&format!("/members/{member_id}/ban"), serde_json::to_value(body)?)
            .await?;
        Ok(())
    }

    pub async fn unban(&self, member_id: &str) -> Result<()> {
        let _: serde_json::Value = self.post(&format!("/members/{member_id}/unban"), json!({})).await?;
        Ok(())
    }

    pub async fn kick(&self, member_id: &str, reason: &str) -> Result<MemberInfo> {
        self.post(&format!("/members/{member_id}/kick"), json!({ "reason": reason }))
            .await
    }

    pub async fn set_role(&self, member_id: &str, role: Role) -> Result<MemberInfo> {
        self.post(&format!("/members/{member_id}/role"), json!({ "role": role }))
            .await
    }

    pub async fn blacklist(&self) -> Result<Vec<String>> {
        let resp: BlacklistResponse = self.get("/blacklist").await?;
        Ok(resp.words)
    }

    pub async fn add_blacklist_word(&self, word: &str) -> Result<Vec<String>> {
        let resp: BlacklistResponse = self.post("/blacklist", json!({ "word": word })).await?;
        Ok(resp.words)
    }

    pub async fn remove_blacklist_word(&self, word: &str) -> Result<Vec<String>> {
        let resp: BlacklistResponse = self
            .send(reqwest::Method::DELETE, &format!("/blacklist/{word}"), json!({}))
            .await?;
        Ok(resp.words)
    }
}

/// Turn a non-2xx response into [`ClientError::Api`] with the server's
/// error message.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

impl ClientError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::FORBIDDEN.as_u16())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}
