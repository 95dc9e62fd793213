//! One send, end to end: optimistic turn, streaming request, decoding,
//! session list refresh, and the failure policy that ties them together.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;

use crate::config::ChatConfig;
use crate::conversation::{Conversation, TurnHandle};
use crate::decoder::decode_stream;
use crate::directory::SessionDirectory;
use crate::error::VedaError;
use crate::model::{validate_message_text, SendMessageRequest, StreamEvent};
use crate::transport::{ByteStream, ChatBackend};

/// Shown to the user whenever a send fails, whatever the cause.
pub const SEND_FAILED_MESSAGE: &str = "Failed to send message. Please try again.";

/// How a call to [`ChatOrchestrator::send`] ended.
#[derive(Debug)]
pub enum SendOutcome {
    /// Blank input. Nothing was sent and nothing changed.
    Rejected,
    /// A reply is already streaming into this conversation.
    Busy,
    /// The reply finished, with `[DONE]` or by end of stream.
    Completed,
    /// The request or the stream failed. Partial output, if any, is kept.
    Failed { error: VedaError },
}

impl SendOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

enum StreamEnd {
    Completed,
    Failed(VedaError),
}

pub struct ChatOrchestrator<B> {
    backend: Arc<B>,
    conversation: Arc<Conversation>,
    directory: Arc<SessionDirectory<B>>,
    options: ChatConfig,
}

impl<B: ChatBackend + 'static> ChatOrchestrator<B> {
    pub fn new(backend: Arc<B>, options: ChatConfig) -> Self {
        let directory = Arc::new(SessionDirectory::new(Arc::clone(&backend)));
        Self {
            backend,
            conversation: Arc::new(Conversation::new(None)),
            directory,
            options,
        }
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.conversation
    }

    pub fn directory(&self) -> &Arc<SessionDirectory<B>> {
        &self.directory
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn refresh_sessions(&self) -> bool {
        self.directory.refresh().await
    }

    /// Switch to `session_id` (or a new draft for `None`) and load its
    /// history. A history failure leaves the conversation empty.
    pub async fn open_session(&self, session_id: Option<&str>) {
        self.conversation.reset(session_id.map(str::to_string));
        let Some(id) = session_id else {
            return;
        };

        let generation = self.conversation.begin_loading();
        let entries = match self.backend.history(id).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "failed to load history");
                Vec::new()
            }
        };
        if !self.conversation.finish_loading(generation, &entries) {
            tracing::debug!(session_id = id, "discarding history of a replaced conversation");
        }
    }

    /// Send `text` and stream the reply into the conversation.
    ///
    /// `session_id` overrides the conversation's own id; with neither the
    /// backend starts a new session. Returns once the reply has ended. The
    /// session list refresh and the read past `[DONE]` carry on in the
    /// background.
    pub async fn send(&self, text: &str, session_id: Option<&str>) -> SendOutcome {
        if validate_message_text(text).is_err() {
            return SendOutcome::Rejected;
        }
        let Ok(handle) = self.conversation.start_turn(text) else {
            return SendOutcome::Busy;
        };
        self.conversation.clear_error();

        let session_id = session_id
            .map(str::to_string)
            .or_else(|| self.conversation.session_id());
        let request = SendMessageRequest::new(text, session_id.as_deref());
        tracing::info!(new_session = request.session_id.is_none(), "sending message");

        let bytes = match self.backend.send_stream(&request).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(handle, e),
        };

        if self.options.refresh_sessions_on_send {
            self.spawn_refresh(handle, request.session_id.is_none());
        }

        match self.consume(handle, bytes).await {
            StreamEnd::Completed => {
                tracing::info!("reply complete");
                SendOutcome::Completed
            }
            StreamEnd::Failed(e) => self.fail(handle, e),
        }
    }

    /// Apply every delta through `handle` and finalize the turn at `[DONE]`
    /// or end of stream.
    async fn consume(&self, handle: TurnHandle, bytes: ByteStream) -> StreamEnd {
        let mut events = Box::pin(decode_stream(bytes));
        let mut stale_logged = false;

        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::TextDelta(fragment)) => {
                    if !self.conversation.apply_delta(handle, &fragment) && !stale_logged {
                        tracing::debug!("conversation replaced mid-stream, ignoring deltas");
                        stale_logged = true;
                    }
                }
                Ok(StreamEvent::Done) => {
                    self.finalize(handle);
                    if self.options.drain_after_done {
                        tokio::spawn(drain(events));
                    }
                    return StreamEnd::Completed;
                }
                Err(e) => return StreamEnd::Failed(e),
            }
        }
        self.finalize(handle);
        StreamEnd::Completed
    }

    fn finalize(&self, handle: TurnHandle) {
        if !self.conversation.finalize_turn(handle) {
            tracing::debug!("reply finished after the conversation was replaced");
        }
    }

    fn fail(&self, handle: TurnHandle, error: VedaError) -> SendOutcome {
        tracing::warn!(error = %error, "send failed");
        if !self.conversation.fail_turn(handle, SEND_FAILED_MESSAGE) {
            tracing::debug!("failed turn belongs to a replaced conversation");
        }
        SendOutcome::Failed { error }
    }

    /// Refresh the session list without holding up the reply. A draft is
    /// bound to its new session once the refreshed list shows it.
    fn spawn_refresh(&self, handle: TurnHandle, draft: bool) {
        let directory = Arc::clone(&self.directory);
        let conversation = Arc::clone(&self.conversation);
        // Only a directory that has loaded at least once can tell new sessions apart.
        let known_before =
            (draft && !directory.is_loading()).then(|| known_session_ids(&directory));

        tokio::spawn(async move {
            directory.refresh().await;
            if let Some(known) = known_before {
                adopt_new_session(&directory, &conversation, handle, &known);
            }
        });
    }
}

fn known_session_ids<B: ChatBackend>(directory: &SessionDirectory<B>) -> HashSet<String> {
    directory.sessions().into_iter().map(|s| s.id).collect()
}

/// Adopt the one session in the refreshed list that was not there before.
/// Zero or several new sessions leave the draft unbound.
fn adopt_new_session<B: ChatBackend>(
    directory: &SessionDirectory<B>,
    conversation: &Conversation,
    handle: TurnHandle,
    known_before: &HashSet<String>,
) {
    let mut fresh = directory
        .sessions()
        .into_iter()
        .filter(|s| !known_before.contains(&s.id));
    if let (Some(session), None) = (fresh.next(), fresh.next()) {
        if conversation.adopt_session_id(handle, session.id.clone()) {
            tracing::debug!(session_id = %session.id, "draft bound to new session");
        }
    }
}

/// Read and discard whatever follows `[DONE]`.
async fn drain<S>(mut events: S)
where
    S: futures::Stream<Item = crate::error::Result<StreamEvent>> + Unpin,
{
    while let Some(event) = events.next().await {
        if let Err(e) = event {
            tracing::debug!(error = %e, "read error after end of reply, ignoring");
        }
    }
}
