//! In-process fake of the chat backend, served by axum on an ephemeral port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};

pub const EMAIL: &str = "user@example.com";
pub const PASSWORD: &str = "secret";
pub const ISSUED_TOKEN: &str = "tok-1";

/// One piece of the scripted reply body.
#[derive(Debug, Clone)]
pub enum Chunk {
    Data(&'static str),
    /// Abort the connection mid-body.
    Abort,
}

#[derive(Default)]
pub struct FakeBackend {
    /// When set, chat endpoints answer 401 unless this bearer token is sent.
    pub required_token: Mutex<Option<String>>,
    /// When set, `send-stream` answers with this status instead of a body.
    pub send_status: Mutex<Option<u16>>,
    pub reply: Mutex<Vec<Chunk>>,
    pub sessions: Mutex<Value>,
    /// When set, `sessions` waits this long before answering.
    pub sessions_delay: Mutex<Option<Duration>>,
    pub history: Mutex<HashMap<String, Value>>,
    pub send_bodies: Mutex<Vec<Value>>,
    pub auth_headers: Mutex<Vec<Option<String>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        *backend.sessions.lock().unwrap() = json!([]);
        Arc::new(backend)
    }

    pub fn require_token(&self, token: &str) {
        *self.required_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn script_reply(&self, chunks: &[Chunk]) {
        *self.reply.lock().unwrap() = chunks.to_vec();
    }

    pub fn fail_sends_with(&self, status: u16) {
        *self.send_status.lock().unwrap() = Some(status);
    }

    pub fn set_sessions(&self, sessions: Value) {
        *self.sessions.lock().unwrap() = sessions;
    }

    pub fn stall_sessions(&self, delay: Duration) {
        *self.sessions_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_history(&self, session_id: &str, entries: Value) {
        self.history
            .lock()
            .unwrap()
            .insert(session_id.to_string(), entries);
    }

    pub fn send_bodies(&self) -> Vec<Value> {
        self.send_bodies.lock().unwrap().clone()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.auth_headers.lock().unwrap().clone()
    }

    fn record(&self, headers: &HeaderMap) {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.auth_headers.lock().unwrap().push(value);
    }

    fn reject(&self, headers: &HeaderMap) -> Option<Response> {
        let required = self.required_token.lock().unwrap().clone()?;
        let expected = format!("Bearer {required}");
        let sent = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        (sent != Some(expected.as_str()))
            .then(|| (StatusCode::UNAUTHORIZED, "token expired").into_response())
    }
}

/// Serve `backend` on 127.0.0.1 and return its base URL.
pub async fn spawn(backend: Arc<FakeBackend>) -> String {
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/chat/send-stream", post(send_stream))
        .route("/chat/sessions", get(sessions))
        .route("/chat/history/{id}", get(history))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn login(Json(body): Json<Value>) -> Response {
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        Json(json!({ "accessToken": ISSUED_TOKEN, "user": { "email": EMAIL } })).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "invalid credentials").into_response()
    }
}

async fn send_stream(
    State(backend): State<Arc<FakeBackend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend.record(&headers);
    backend.send_bodies.lock().unwrap().push(body);
    if let Some(rejection) = backend.reject(&headers) {
        return rejection;
    }
    let status = *backend.send_status.lock().unwrap();
    if let Some(status) = status {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, "scripted failure").into_response();
    }

    let chunks: Vec<Result<Vec<u8>, std::io::Error>> = backend
        .reply
        .lock()
        .unwrap()
        .iter()
        .map(|chunk| match chunk {
            Chunk::Data(text) => Ok(text.as_bytes().to_vec()),
            Chunk::Abort => Err(std::io::Error::other("connection dropped")),
        })
        .collect();
    // Pause before each chunk so every piece reaches the client on its own.
    let body = futures::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        chunk
    });
    Body::from_stream(body).into_response()
}

async fn sessions(State(backend): State<Arc<FakeBackend>>, headers: HeaderMap) -> Response {
    backend.record(&headers);
    if let Some(rejection) = backend.reject(&headers) {
        return rejection;
    }
    let delay = *backend.sessions_delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let sessions = backend.sessions.lock().unwrap().clone();
    Json(sessions).into_response()
}

async fn history(
    State(backend): State<Arc<FakeBackend>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    backend.record(&headers);
    if let Some(rejection) = backend.reject(&headers) {
        return rejection;
    }
    let entries = backend.history.lock().unwrap().get(&id).cloned();
    match entries {
        Some(entries) => Json(entries).into_response(),
        None => (StatusCode::NOT_FOUND, "no such session").into_response(),
    }
}
