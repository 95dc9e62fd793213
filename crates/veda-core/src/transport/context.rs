use std::sync::RwLock;

type UnauthorizedHandler = Box<dyn Fn() + Send + Sync>;

/// Credentials shared by every request of one signed-in user.
///
/// The token is read on each request. When the backend answers 401 the token
/// is dropped and the `on_unauthorized` handler runs, which is where a UI
/// sends the user back to its login screen.
#[derive(Default)]
pub struct SessionContext {
    token: RwLock<Option<String>>,
    on_unauthorized: Option<UnauthorizedHandler>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("has_token", &self.token().is_some())
            .field("has_handler", &self.on_unauthorized.is_some())
            .finish()
    }
}

impl SessionContext {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
            on_unauthorized: None,
        }
    }

    pub fn with_unauthorized_handler(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_unauthorized = Some(Box::new(handler));
        self
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// Drop the token and notify the handler.
    pub(crate) fn evict(&self) {
        tracing::info!("backend rejected credentials, clearing token");
        self.clear_token();
        if let Some(handler) = &self.on_unauthorized {
            handler();
        }
    }
}
