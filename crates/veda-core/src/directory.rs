use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::model::SessionSummary;
use crate::transport::ChatBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub sessions: Vec<SessionSummary>,
    /// True until the first refresh attempt has finished.
    pub loading: bool,
}

impl Default for DirectorySnapshot {
    fn default() -> Self {
        Self {
            sessions: Vec::new(),
            loading: true,
        }
    }
}

/// Sidebar list of known sessions. Lives independently of whichever
/// conversation is open; a new session shows up after the next successful
/// [`refresh`](Self::refresh).
pub struct SessionDirectory<B> {
    backend: Arc<B>,
    state: Mutex<DirectorySnapshot>,
    tx: watch::Sender<DirectorySnapshot>,
}

impl<B: ChatBackend> SessionDirectory<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let (tx, _rx) = watch::channel(DirectorySnapshot::default());
        Self {
            backend,
            state: Mutex::new(DirectorySnapshot::default()),
            tx,
        }
    }

    /// Fetch the authoritative list and replace the stored one wholesale.
    ///
    /// Never fails: on error the previous list stays visible and the failure
    /// is only logged. Returns whether the fetch succeeded.
    pub async fn refresh(&self) -> bool {
        match self.backend.sessions().await {
            Ok(sessions) => {
                tracing::debug!(count = sessions.len(), "session list refreshed");
                self.update(|state| {
                    state.sessions = sessions;
                    state.loading = false;
                });
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to refresh session list");
                self.update(|state| state.loading = false);
                false
            }
        }
    }

    /// Forget every session, e.g. after the token was evicted.
    pub fn clear(&self) {
        self.update(|state| state.sessions.clear());
    }

    pub fn subscribe(&self) -> watch::Receiver<DirectorySnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.lock().clone()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.lock().sessions.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    fn update(&self, f: impl FnOnce(&mut DirectorySnapshot)) {
        let mut state = self.lock();
        f(&mut state);
        self.tx.send_replace(state.clone());
    }

    fn lock(&self) -> MutexGuard<'_, DirectorySnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VedaError};
    use crate::model::{HistoryEntry, SendMessageRequest};
    use crate::transport::ByteStream;
    use std::collections::VecDeque;

    /// Backend whose session-list responses are scripted in order.
    struct ScriptedSessions {
        responses: Mutex<VecDeque<Result<Vec<SessionSummary>>>>,
    }

    impl ScriptedSessions {
        fn new(responses: Vec<Result<Vec<SessionSummary>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    impl ChatBackend for ScriptedSessions {
        async fn send_stream(&self, _: &SendMessageRequest) -> Result<ByteStream> {
            Err(VedaError::Stream("not scripted".into()))
        }
        async fn history(&self, _: &str) -> Result<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }
        async fn sessions(&self) -> Result<Vec<SessionSummary>> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_list() {
        let backend = ScriptedSessions::new(vec![
            Ok(vec![SessionSummary::new("a", "First")]),
            Ok(vec![
                SessionSummary::new("b", "Second"),
                SessionSummary::new("a", "First"),
            ]),
        ]);
        let dir = SessionDirectory::new(backend);
        assert!(dir.is_loading());

        assert!(dir.refresh().await);
        assert_eq!(dir.sessions().len(), 1);
        assert!(!dir.is_loading());

        assert!(dir.refresh().await);
        let ids: Vec<String> = dir.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_list() {
        let backend = ScriptedSessions::new(vec![
            Ok(vec![SessionSummary::new("a", "First")]),
            Err(VedaError::Status {
                status: 500,
                body: "down".into(),
            }),
        ]);
        let dir = SessionDirectory::new(backend);
        assert!(dir.refresh().await);
        assert!(!dir.refresh().await);
        assert_eq!(dir.sessions(), vec![SessionSummary::new("a", "First")]);
    }

    #[tokio::test]
    async fn test_first_refresh_failure_clears_loading() {
        let backend = ScriptedSessions::new(vec![Err(VedaError::Unauthorized("x".into()))]);
        let dir = SessionDirectory::new(backend);
        assert!(!dir.refresh().await);
        assert!(!dir.is_loading());
        assert!(dir.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_notified_on_refresh() {
        let backend = ScriptedSessions::new(vec![Ok(vec![SessionSummary::new("a", "A")])]);
        let dir = SessionDirectory::new(backend);
        let mut rx = dir.subscribe();
        dir.refresh().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().sessions.len(), 1);

        dir.clear();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().sessions.is_empty());
    }
}
