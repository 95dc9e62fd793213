mod context;
mod http;

pub use context::SessionContext;
pub use http::{HttpTransport, LOGIN_PATH};

use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{HistoryEntry, SendMessageRequest, SessionSummary};

/// Raw reply body, chunk by chunk, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// The chat endpoints of the backend. [`HttpTransport`] is the real
/// implementation; tests script their own.
pub trait ChatBackend: Send + Sync {
    /// `POST /chat/send-stream`. Resolves once the response status has been
    /// checked; a non-success status is an error, never a stream.
    fn send_stream(
        &self,
        request: &SendMessageRequest,
    ) -> impl std::future::Future<Output = Result<ByteStream>> + Send;

    /// `GET /chat/history/{session_id}`, oldest pair first.
    fn history(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryEntry>>> + Send;

    /// `GET /chat/sessions`.
    fn sessions(&self) -> impl std::future::Future<Output = Result<Vec<SessionSummary>>> + Send;
}
