use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ByteStream, ChatBackend, SessionContext};
use crate::config::VedaConfig;
use crate::error::{Result, VedaError};
use crate::model::{HistoryEntry, SendMessageRequest, SessionSummary};
use crate::retry::with_retry;

/// Path of the login endpoint. A 401 from here is a wrong password, not an
/// expired session, so it never evicts the token.
pub const LOGIN_PATH: &str = "auth/login";
const REGISTER_PATH: &str = "auth/register";
const SEND_STREAM_PATH: &str = "chat/send-stream";
const SESSIONS_PATH: &str = "chat/sessions";
const HISTORY_PATH: &str = "chat/history";

/// reqwest-backed client for the chat and auth endpoints.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    context: Arc<SessionContext>,
    /// Bounds the plain request/response calls. The reply stream is unbounded.
    request_timeout: Duration,
    max_retries: usize,
    retry_base_delay_ms: u64,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("context", &self.context)
            .finish()
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, context: Arc<SessionContext>) -> Result<Self> {
        Self::build(base_url, context, Duration::from_secs(30), 0, 0)
    }

    /// Create a transport from the `[backend]` section of the configuration.
    pub fn from_config(config: &VedaConfig, context: Arc<SessionContext>) -> Result<Self> {
        Self::build(
            &config.backend.base_url,
            context,
            Duration::from_secs(config.backend.timeout_secs),
            config.backend.max_retries,
            config.backend.retry_base_delay_ms,
        )
    }

    fn build(
        base_url: &str,
        context: Arc<SessionContext>,
        timeout: Duration,
        max_retries: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| VedaError::Config(format!("invalid backend URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(VedaError::Config(format!(
                "backend URL '{base_url}' cannot be used as a base"
            )));
        }
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| VedaError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            context,
            request_timeout: timeout,
            max_retries,
            retry_base_delay_ms,
        })
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// `POST /auth/login`. Installs the returned token on success.
    pub async fn login(&self, email: &str, password: &str) -> Result<String> {
        let body = LoginRequest { email, password };
        let resp = self
            .authorize(self.client.post(self.endpoint(&[LOGIN_PATH])?))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let auth: AuthResponse = self.check(LOGIN_PATH, resp).await?.json().await?;
        self.context.set_token(auth.token.clone());
        tracing::info!("logged in");
        Ok(auth.token)
    }

    /// `POST /auth/register`. Installs the returned token on success.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<String> {
        let body = RegisterRequest {
            name,
            email,
            password,
        };
        let resp = self
            .authorize(self.client.post(self.endpoint(&[REGISTER_PATH])?))
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await?;
        let auth: AuthResponse = self.check(REGISTER_PATH, resp).await?.json().await?;
        self.context.set_token(auth.token.clone());
        Ok(auth.token)
    }

    /// Join path segments onto the base URL. Each segment may itself contain
    /// `/`; session ids are pushed as single escaped segments by the caller.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| VedaError::Config("backend URL cannot be a base".into()))?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/'));
            }
        }
        Ok(url)
    }

    fn history_endpoint(&self, session_id: &str) -> Result<Url> {
        let mut url = self.endpoint(&[HISTORY_PATH])?;
        url.path_segments_mut()
            .map_err(|_| VedaError::Config("backend URL cannot be a base".into()))?
            .push(session_id);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.context.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Turn non-success statuses into errors. A 401 from anything but the
    /// login endpoint evicts the token first.
    async fn check(&self, path: &str, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            if !path.contains(LOGIN_PATH) {
                self.context.evict();
            }
            return Err(VedaError::Unauthorized(format!("{path}: {body}")));
        }
        Err(VedaError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, url: &Url) -> Result<T> {
        let resp = self
            .authorize(self.client.get(url.clone()))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let resp = self.check(path, resp).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl ChatBackend for HttpTransport {
    async fn send_stream(&self, request: &SendMessageRequest) -> Result<ByteStream> {
        let url = self.endpoint(&[SEND_STREAM_PATH])?;
        tracing::debug!(%url, has_session = request.session_id.is_some(), "opening reply stream");
        let resp = self
            .authorize(self.client.post(url))
            .json(request)
            .send()
            .await?;
        let resp = self.check(SEND_STREAM_PATH, resp).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(VedaError::from))
            .boxed())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let url = self.history_endpoint(session_id)?;
        with_retry(self.max_retries, self.retry_base_delay_ms, || {
            self.get_json(HISTORY_PATH, &url)
        })
        .await
    }

    async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        let url = self.endpoint(&[SESSIONS_PATH])?;
        with_retry(self.max_retries, self.retry_base_delay_ms, || {
            self.get_json(SESSIONS_PATH, &url)
        })
        .await
    }
}
