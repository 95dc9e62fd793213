//! Client-side state of the open conversation.
//!
//! A send is applied optimistically: the user message and an empty assistant
//! placeholder are appended before any network I/O, deltas are appended to
//! the placeholder as they arrive, and a failed turn is rolled back or kept
//! depending on whether any content made it through.
//!
//! Transitions: `Idle --start_turn--> Streaming --finalize/rollback--> Idle`,
//! and `reset` from either state to a fresh `Idle` conversation.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{Result, VedaError};
use crate::model::{expand_history, validate_message_text, HistoryEntry, Message};

/// Identifies the placeholder of one turn. Becomes stale once the turn ends or
/// the conversation is reset; applying a delta through a stale handle does
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnHandle {
    generation: u64,
    turn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
}

/// What observers see after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub session_id: Option<String>,
    pub messages: Vec<Message>,
    /// User-visible error of the last failed send.
    pub error: Option<String>,
    /// A history fetch is in flight.
    pub loading: bool,
}

#[derive(Debug, Clone, Copy)]
struct ActiveTurn {
    turn: u64,
    index: usize,
}

#[derive(Debug, Default)]
struct Inner {
    session_id: Option<String>,
    messages: Vec<Message>,
    active: Option<ActiveTurn>,
    generation: u64,
    next_turn: u64,
    error: Option<String>,
    loading: bool,
}

impl Inner {
    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            session_id: self.session_id.clone(),
            messages: self.messages.clone(),
            error: self.error.clone(),
            loading: self.loading,
        }
    }

    fn active_for(&self, handle: TurnHandle) -> Option<usize> {
        if handle.generation != self.generation {
            return None;
        }
        self.active
            .filter(|active| active.turn == handle.turn)
            .map(|active| active.index)
    }
}

/// Conversation state machine bound to one session id (or none for a draft).
pub struct Conversation {
    inner: Mutex<Inner>,
    tx: watch::Sender<ConversationSnapshot>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Conversation")
            .field("session_id", &inner.session_id)
            .field("messages", &inner.messages.len())
            .field("streaming", &inner.active.is_some())
            .finish()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Conversation {
    pub fn new(session_id: Option<String>) -> Self {
        let inner = Inner {
            session_id,
            ..Default::default()
        };
        let (tx, _rx) = watch::channel(inner.snapshot());
        Self {
            inner: Mutex::new(inner),
            tx,
        }
    }

    /// Receive a fresh snapshot after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.lock().snapshot()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn state(&self) -> TurnState {
        if self.lock().active.is_some() {
            TurnState::Streaming
        } else {
            TurnState::Idle
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == TurnState::Streaming
    }

    /// Append the user message and an empty streaming placeholder.
    pub fn start_turn(&self, user_text: &str) -> Result<TurnHandle> {
        validate_message_text(user_text)?;
        let mut inner = self.lock();
        if inner.active.is_some() {
            return Err(VedaError::InvalidInput(
                "a reply is already streaming".into(),
            ));
        }

        inner.messages.push(Message::user(user_text));
        inner.messages.push(Message::placeholder());

        let turn = inner.next_turn;
        let index = inner.messages.len() - 1;
        inner.next_turn += 1;
        inner.active = Some(ActiveTurn { turn, index });
        let handle = TurnHandle {
            generation: inner.generation,
            turn,
        };
        self.publish(&inner);
        Ok(handle)
    }

    /// Append a streamed fragment to the placeholder. Returns `false` (and
    /// changes nothing) when the handle is stale.
    pub fn apply_delta(&self, handle: TurnHandle, fragment: &str) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.active_for(handle) else {
            return false;
        };
        if !fragment.is_empty() {
            inner.messages[index].text.push_str(fragment);
            self.publish(&inner);
        }
        true
    }

    /// Whether `handle` still refers to the active turn.
    pub fn is_current(&self, handle: TurnHandle) -> bool {
        self.lock().active_for(handle).is_some()
    }

    /// Turn the placeholder into an ordinary message. No-op when idle.
    pub fn finalize(&self) {
        let mut inner = self.lock();
        if let Some(active) = inner.active.take() {
            inner.messages[active.index].streaming = false;
            self.publish(&inner);
        }
    }

    /// End a failed turn: drop the placeholder if nothing arrived, otherwise
    /// keep the partial reply. Returns `true` if the placeholder was removed.
    pub fn rollback_empty_turn(&self) -> bool {
        let mut inner = self.lock();
        let Some(active) = inner.active.take() else {
            return false;
        };
        let removed = if inner.messages[active.index].text.is_empty() {
            inner.messages.remove(active.index);
            true
        } else {
            inner.messages[active.index].streaming = false;
            false
        };
        self.publish(&inner);
        removed
    }

    /// Record `error` and roll back the turn identified by `handle`, in one
    /// step. Returns `false` without touching anything if the handle is stale.
    pub fn fail_turn(&self, handle: TurnHandle, error: impl Into<String>) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.active_for(handle) else {
            return false;
        };
        inner.active = None;
        if inner.messages[index].text.is_empty() {
            inner.messages.remove(index);
        } else {
            inner.messages[index].streaming = false;
        }
        inner.error = Some(error.into());
        self.publish(&inner);
        true
    }

    /// [`finalize`](Self::finalize), but only if `handle` is still current.
    pub fn finalize_turn(&self, handle: TurnHandle) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.active_for(handle) else {
            return false;
        };
        inner.active = None;
        inner.messages[index].streaming = false;
        self.publish(&inner);
        true
    }

    /// Bind a draft conversation to the session the backend created for it.
    /// Ignored if the conversation already has an id or was reset after
    /// `handle` was issued.
    pub fn adopt_session_id(&self, handle: TurnHandle, session_id: impl Into<String>) -> bool {
        let mut inner = self.lock();
        if inner.generation != handle.generation || inner.session_id.is_some() {
            return false;
        }
        inner.session_id = Some(session_id.into());
        self.publish(&inner);
        true
    }

    /// Replace everything with an empty conversation bound to `session_id`.
    /// An in-flight turn is abandoned and its handle goes stale.
    pub fn reset(&self, session_id: Option<String>) {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        let next_turn = inner.next_turn;
        *inner = Inner {
            session_id,
            generation,
            next_turn,
            ..Default::default()
        };
        self.publish(&inner);
    }

    /// Mark a history fetch as started. Returns the generation the fetch
    /// belongs to, for [`finish_loading`](Self::finish_loading).
    pub fn begin_loading(&self) -> u64 {
        let mut inner = self.lock();
        inner.loading = true;
        self.publish(&inner);
        inner.generation
    }

    /// Install fetched history. Messages already added by a send started
    /// while loading stay after the history. Returns `false` if the
    /// conversation was reset since `begin_loading`.
    pub fn finish_loading(&self, generation: u64, entries: &[HistoryEntry]) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        let mut messages = expand_history(entries);
        let offset = messages.len();
        messages.append(&mut inner.messages);
        inner.messages = messages;
        if let Some(active) = inner.active.as_mut() {
            active.index += offset;
        }
        inner.loading = false;
        self.publish(&inner);
        true
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.error = Some(message.into());
        self.publish(&inner);
    }

    pub fn clear_error(&self) {
        let mut inner = self.lock();
        if inner.error.take().is_some() {
            self.publish(&inner);
        }
    }

    fn publish(&self, inner: &Inner) {
        self.tx.send_replace(inner.snapshot());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked: every mutation
        // completes before the guard is released.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn streaming_count(conv: &Conversation) -> usize {
        conv.messages().iter().filter(|m| m.streaming).count()
    }

    #[test]
    fn test_start_turn_appends_user_and_placeholder() {
        let conv = Conversation::new(None);
        conv.start_turn("How are you").unwrap();
        let messages = conv.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::user("How are you"));
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].streaming);
        assert!(messages[1].text.is_empty());
        assert_eq!(conv.state(), TurnState::Streaming);
    }

    #[test]
    fn test_start_turn_rejects_blank() {
        let conv = Conversation::new(None);
        assert!(matches!(
            conv.start_turn("  \n"),
            Err(VedaError::InvalidInput(_))
        ));
        assert!(conv.messages().is_empty());
    }

    #[test]
    fn test_start_turn_rejects_second_placeholder() {
        let conv = Conversation::new(None);
        conv.start_turn("one").unwrap();
        assert!(conv.start_turn("two").is_err());
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(streaming_count(&conv), 1);
    }

    #[test]
    fn test_deltas_concatenate_in_order() {
        let fragments = ["The ", "three ", "doshas", " are ", "", "Vata, Pitta, Kapha."];
        let conv = Conversation::new(None);
        let handle = conv.start_turn("doshas?").unwrap();
        for f in fragments {
            assert!(conv.apply_delta(handle, f));
        }
        conv.finalize();
        let last = conv.messages().pop().unwrap();
        assert_eq!(last.text, fragments.concat());
        assert!(!last.streaming);
    }

    #[test]
    fn test_finalize_is_noop_when_idle() {
        let conv = Conversation::new(None);
        let rx = conv.subscribe();
        conv.finalize();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_rollback_removes_empty_placeholder() {
        let conv = Conversation::new(None);
        conv.start_turn("hello").unwrap();
        assert!(conv.rollback_empty_turn());
        let messages = conv.messages();
        assert_eq!(messages, vec![Message::user("hello")]);
        assert_eq!(conv.state(), TurnState::Idle);
    }

    #[test]
    fn test_rollback_keeps_partial_content() {
        let conv = Conversation::new(None);
        let handle = conv.start_turn("hello").unwrap();
        conv.apply_delta(handle, "Partial");
        assert!(!conv.rollback_empty_turn());
        let last = conv.messages().pop().unwrap();
        assert_eq!(last.text, "Partial");
        assert!(!last.streaming);
    }

    #[test]
    fn test_rollback_is_noop_when_idle() {
        let conv = Conversation::new(None);
        conv.start_turn("a").unwrap();
        conv.finalize();
        assert!(!conv.rollback_empty_turn());
        assert_eq!(conv.messages().len(), 2);
    }

    #[test]
    fn test_handle_stale_after_finalize() {
        let conv = Conversation::new(None);
        let handle = conv.start_turn("a").unwrap();
        conv.apply_delta(handle, "x");
        conv.finalize();
        assert!(!conv.apply_delta(handle, "y"));
        assert_eq!(conv.messages()[1].text, "x");

        // A new turn does not accept the old handle either
        let fresh = conv.start_turn("b").unwrap();
        assert!(!conv.apply_delta(handle, "z"));
        assert!(conv.apply_delta(fresh, "ok"));
        assert_eq!(conv.messages()[3].text, "ok");
    }

    #[test]
    fn test_reset_discards_everything() {
        let conv = Conversation::new(Some("old".into()));
        let handle = conv.start_turn("question").unwrap();
        conv.apply_delta(handle, "half an ans");
        conv.record_error("boom");

        conv.reset(Some("new".into()));
        let snap = conv.snapshot();
        assert!(snap.messages.is_empty());
        assert!(snap.error.is_none());
        assert_eq!(snap.session_id.as_deref(), Some("new"));
        assert_eq!(conv.state(), TurnState::Idle);

        // Stale handle cannot touch the new conversation
        assert!(!conv.apply_delta(handle, "wer"));
        conv.start_turn("fresh").unwrap();
        assert!(!conv.apply_delta(handle, "leak"));
        assert!(conv.messages()[1].text.is_empty());
    }

    #[test]
    fn test_at_most_one_streaming_message_under_any_interleaving() {
        // Exhaustively run every sequence of up to 6 operations
        const OPS: usize = 5;
        const DEPTH: u32 = 6;
        for seq in 0..OPS.pow(DEPTH) {
            let conv = Conversation::new(None);
            let mut handles = Vec::new();
            let mut code = seq;
            for _ in 0..DEPTH {
                match code % OPS {
                    0 => {
                        if let Ok(h) = conv.start_turn("q") {
                            handles.push(h);
                        }
                    }
                    1 => {
                        for h in &handles {
                            conv.apply_delta(*h, "d");
                        }
                    }
                    2 => conv.finalize(),
                    3 => {
                        conv.rollback_empty_turn();
                    }
                    _ => conv.reset(None),
                }
                code /= OPS;

                let messages = conv.messages();
                let streaming: Vec<usize> = messages
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.streaming)
                    .map(|(i, _)| i)
                    .collect();
                assert!(streaming.len() <= 1, "sequence {seq}");
                if let Some(&i) = streaming.first() {
                    assert_eq!(i, messages.len() - 1, "placeholder not last in {seq}");
                    assert!(conv.is_streaming());
                } else {
                    assert!(!conv.is_streaming());
                }
            }
        }
    }

    #[test]
    fn test_history_loading() {
        let conv = Conversation::new(Some("s1".into()));
        let generation = conv.begin_loading();
        assert!(conv.snapshot().loading);
        let entries = vec![HistoryEntry {
            question: "Hi".into(),
            answer: "Hello".into(),
            created_at: Some("2024-01-01".into()),
        }];
        assert!(conv.finish_loading(generation, &entries));
        let snap = conv.snapshot();
        assert!(!snap.loading);
        assert_eq!(
            snap.messages,
            vec![Message::user("Hi"), Message::assistant("Hello")]
        );
    }

    #[test]
    fn test_history_after_reset_is_discarded() {
        let conv = Conversation::new(Some("s1".into()));
        let generation = conv.begin_loading();
        conv.reset(Some("s2".into()));
        let entries = vec![HistoryEntry {
            question: "from s1".into(),
            answer: String::new(),
            created_at: None,
        }];
        assert!(!conv.finish_loading(generation, &entries));
        assert!(conv.messages().is_empty());
    }

    #[test]
    fn test_history_lands_before_turn_started_while_loading() {
        let conv = Conversation::new(Some("s1".into()));
        let generation = conv.begin_loading();
        let handle = conv.start_turn("new question").unwrap();
        let entries = vec![HistoryEntry {
            question: "old q".into(),
            answer: "old a".into(),
            created_at: None,
        }];
        conv.finish_loading(generation, &entries);
        assert!(conv.apply_delta(handle, "answer"));
        conv.finalize();
        let texts: Vec<String> = conv.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["old q", "old a", "new question", "answer"]);
    }

    #[test]
    fn test_subscribers_see_every_delta() {
        let conv = Conversation::new(None);
        let mut rx = conv.subscribe();
        let handle = conv.start_turn("q").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().messages.len(), 2);

        conv.apply_delta(handle, "abc");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().messages[1].text, "abc");
    }

    #[test]
    fn test_fail_turn_with_stale_handle_is_inert() {
        let conv = Conversation::new(None);
        let handle = conv.start_turn("q").unwrap();
        conv.reset(Some("other".into()));
        conv.start_turn("q2").unwrap();
        assert!(!conv.fail_turn(handle, "boom"));
        assert!(!conv.finalize_turn(handle));
        let snap = conv.snapshot();
        assert!(snap.error.is_none());
        assert!(snap.messages[1].streaming);
    }

    #[test]
    fn test_fail_turn_records_error_and_rolls_back() {
        let conv = Conversation::new(None);
        let handle = conv.start_turn("q").unwrap();
        assert!(conv.fail_turn(handle, "boom"));
        let snap = conv.snapshot();
        assert_eq!(snap.error.as_deref(), Some("boom"));
        assert_eq!(snap.messages, vec![Message::user("q")]);
        assert_eq!(conv.state(), TurnState::Idle);
    }

    #[test]
    fn test_adopt_session_id_only_for_drafts() {
        let conv = Conversation::new(None);
        let handle = conv.start_turn("q").unwrap();
        conv.finalize_turn(handle);
        assert!(conv.adopt_session_id(handle, "s-new"));
        assert_eq!(conv.session_id().as_deref(), Some("s-new"));
        assert!(!conv.adopt_session_id(handle, "s-other"));

        conv.reset(None);
        assert!(!conv.adopt_session_id(handle, "s-late"));
        assert!(conv.session_id().is_none());
    }

    #[test]
    fn test_error_slot() {
        let conv = Conversation::new(None);
        conv.record_error("Failed to send message. Please try again.");
        assert!(conv.snapshot().error.is_some());
        conv.clear_error();
        assert!(conv.snapshot().error.is_none());
    }
}
