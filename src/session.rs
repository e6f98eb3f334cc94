//! Session coordinator: who is logged in and with which tokens.
//!
//! State is published through a `tokio::sync::watch` channel so any number of
//! observers can follow it; all writes go through the sender, one at a time.
//! Tokens stay outside the published state and are read through
//! `Credentials::access_token` and `refresh_token`.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{ApiClient, ApiRequest};
use crate::error::{ClientError, ValidationError};
use crate::models::{AuthResponse, AuthTokens, LoginRequest, RegisterRequest, User};
use crate::storage::{KeyValueStore, SessionVault, StoredSession};

/// Read access to the current credentials, all the feature side needs.
pub trait Credentials: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn access_token(&self) -> Option<String>;
}

/// What observers of the session see. Tokens are never published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub is_authenticated: bool,
    pub current_user: Option<User>,
    pub error_message: Option<String>,
}

#[derive(Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    api: ApiClient,
    vault: SessionVault,
    state: watch::Sender<SessionState>,
    tokens: RwLock<Tokens>,
}

impl SessionCoordinator {
    /// Builds the coordinator and restores whatever session the store holds.
    /// It counts as authenticated only when both a token and a user were stored.
    pub fn new(api: ApiClient, store: Arc<dyn KeyValueStore>) -> Self {
        let vault = SessionVault::new(store);
        let stored = vault.load().unwrap_or_else(|e| {
            warn!("Could not restore session: {e}");
            StoredSession::default()
        });

        let is_authenticated = stored.user.is_some() && stored.access_token.is_some();
        if let Some(user) = stored.user.as_ref().filter(|_| is_authenticated) {
            info!(user_id = user.id, username = %user.username, "restored session");
        }
        let (state, _) = watch::channel(SessionState {
            is_authenticated,
            current_user: stored.user,
            error_message: None,
        });
        let tokens = Tokens {
            access: stored.access_token,
            refresh: stored.refresh_token,
        };

        Self {
            inner: Arc::new(Inner {
                api,
                vault,
                state,
                tokens: RwLock::new(tokens),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.state.borrow().current_user.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_tokens().refresh.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.state.borrow().error_message.clone()
    }

    pub async fn register(&self, username: &str, email: &str, password: &str, password_confirm: &str) {
        self.clear_error();
        let request = RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            password_confirm: password_confirm.to_string(),
        };
        let result = self
            .request_tokens("auth/register/", &request, StatusCode::CREATED)
            .await;
        self.finish("register", result);
    }

    pub async fn login(&self, username: &str, password: &str) {
        self.clear_error();
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let result = self.request_tokens("auth/login/", &request, StatusCode::OK).await;
        self.finish("login", result);
    }

    /// Clears the session and its persisted copy. Safe to call repeatedly.
    ///
    /// If the stored copy cannot be removed, the in-memory session is still
    /// cleared and the failure is published in `error_message`: the next
    /// start would otherwise restore the session.
    pub fn logout(&self) {
        let was_authenticated = self.inner.state.borrow().is_authenticated;
        *self.write_tokens() = Tokens::default();
        let cleared = self.inner.vault.clear();

        self.inner.state.send_modify(|state| {
            *state = SessionState::default();
            if let Err(e) = &cleared {
                state.error_message = Some(format!("Failed to clear stored session: {e}"));
            }
        });
        match cleared {
            Err(e) => warn!("Could not clear stored session: {e}"),
            Ok(()) if was_authenticated => info!("logged out"),
            Ok(()) => {}
        }
    }

    async fn request_tokens<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        success: StatusCode,
    ) -> Result<AuthResponse, ClientError> {
        let res = self.inner.api.execute(ApiRequest::post(path).json(body)?).await?;
        if res.status == success {
            return res.json();
        }

        let rejection = ValidationError::from_slice(&res.body)?;
        Err(ClientError::rejected(res.status, rejection.message()))
    }

    fn finish(&self, action: &str, result: Result<AuthResponse, ClientError>) {
        match result {
            Ok(auth) => self.handle_successful_auth(auth),
            Err(e) => {
                warn!(action, status = ?e.status(), "authentication failed: {e}");
                self.inner
                    .state
                    .send_modify(|state| state.error_message = Some(e.to_string()));
            }
        }
    }

    fn handle_successful_auth(&self, auth: AuthResponse) {
        info!(user_id = auth.user.id, username = %auth.user.username, "{}", auth.message);
        // The in-memory session stands even if persisting it fails.
        if let Err(e) = self.inner.vault.save(&auth.tokens, &auth.user) {
            warn!("Could not persist session: {e}");
        }

        let AuthResponse { user, tokens, .. } = auth;
        let AuthTokens { access, refresh } = tokens;
        *self.write_tokens() = Tokens {
            access: Some(access),
            refresh: Some(refresh),
        };
        self.inner.state.send_modify(|state| {
            state.is_authenticated = true;
            state.current_user = Some(user);
            state.error_message = None;
        });
    }

    fn clear_error(&self) {
        self.inner.state.send_if_modified(|state| state.error_message.take().is_some());
    }

    fn read_tokens(&self) -> RwLockReadGuard<'_, Tokens> {
        self.inner.tokens.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_tokens(&self) -> RwLockWriteGuard<'_, Tokens> {
        self.inner.tokens.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Credentials for SessionCoordinator {
    fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated
    }

    fn access_token(&self) -> Option<String> {
        self.read_tokens().access.clone()
    }
}
