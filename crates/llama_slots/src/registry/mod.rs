//! Implements the [`SessionRegistry`], the named collection of inference slots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::config::snapshot;
use crate::session::{InferenceSession, Session, SessionError, SessionHandle};
use crate::weights::WeightsRegistry;
use crate::SharedConfig;

mod sequence;

pub use sequence::SequenceIdAllocator;

/// An error raised by the [`SessionRegistry`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// No session is registered under the given id.
    #[error("no session named \"{0}\"")]
    SessionNotFound(String),

    /// A session is already registered under the given id.
    #[error("a session named \"{0}\" already exists")]
    SessionExists(String),

    /// No weights are registered under the given key.
    #[error("no weights are loaded under \"{0}\"")]
    WeightsNotLoaded(String),

    /// The session itself failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct SessionEntry {
    session: SessionHandle,

    /// Where to load weights from when the session is first used without any.
    path: Option<PathBuf>,
}

struct RegistryState {
    sessions: HashMap<String, SessionEntry>,
    default: Option<String>,
}

struct RegistryInner {
    backend: Arc<dyn InferenceBackend>,
    weights: Arc<WeightsRegistry>,
    sequences: Arc<SequenceIdAllocator>,
    config: SharedConfig,
    state: Mutex<RegistryState>,

    /// Context usage counters, per session id.
    leases: Mutex<HashMap<String, usize>>,
}

/// Named collection of [`Session`]s sharing one [`WeightsRegistry`].
///
/// Cloning a registry creates a new reference to the same collection.
///
/// Locks are always taken in the order leases, sessions, session, weights.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Creates an empty registry whose sessions load weights through `weights`.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        weights: Arc<WeightsRegistry>,
        config: SharedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                weights,
                sequences: Arc::new(SequenceIdAllocator::new()),
                config,
                state: Mutex::new(RegistryState {
                    sessions: HashMap::new(),
                    default: None,
                }),
                leases: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The weights registry backing this registry.
    pub fn weights(&self) -> &Arc<WeightsRegistry> {
        &self.inner.weights
    }

    /// The allocator sessions draw their sequence ids from.
    pub fn sequences(&self) -> &Arc<SequenceIdAllocator> {
        &self.inner.sequences
    }

    fn new_session(&self, id: &str) -> InferenceSession {
        InferenceSession::new(
            id,
            self.inner.backend.clone(),
            self.inner.weights.clone(),
            self.inner.sequences.clone(),
            self.inner.config.clone(),
        )
    }

    fn insert(state: &mut RegistryState, id: &str, entry: SessionEntry) {
        state.sessions.insert(id.to_string(), entry);

        if state.default.is_none() {
            debug!(session = id, "Session is the new default");
            state.default = Some(id.to_string());
        }
    }

    /// Returns the session named `id`, creating an empty one if there is none.
    ///
    /// A new session holds no weights; `path` is remembered so the session can load them
    /// when first acquired. The first session ever created becomes the default.
    pub async fn get_or_create(&self, id: &str, path: Option<&Path>) -> SessionHandle {
        let mut state = self.inner.state.lock().await;

        if let Some(entry) = state.sessions.get_mut(id) {
            if let Some(path) = path {
                entry.path = Some(path.to_path_buf());
            }
            return entry.session.clone();
        }

        let session = Session::new(self.new_session(id));
        info!(session = id, "Created session");

        Self::insert(
            &mut state,
            id,
            SessionEntry {
                session: session.clone(),
                path: path.map(Path::to_path_buf),
            },
        );

        session
    }

    /// Creates a session bound to the weights already registered as `weights_key`.
    ///
    /// The context is built on first use.
    pub async fn create_shared_session(
        &self,
        id: &str,
        weights_key: &str,
    ) -> Result<SessionHandle, RegistryError> {
        let mut state = self.inner.state.lock().await;

        if state.sessions.contains_key(id) {
            return Err(RegistryError::SessionExists(id.to_string()));
        }

        let Some(weights) = self.inner.weights.acquire_existing(id, weights_key) else {
            return Err(RegistryError::WeightsNotLoaded(weights_key.to_string()));
        };

        let path = weights.path().to_path_buf();
        let mut session = self.new_session(id);
        session.attach_weights(weights);
        let session = Session::new(session);

        info!(session = id, key = weights_key, "Created shared session");

        Self::insert(
            &mut state,
            id,
            SessionEntry {
                session: session.clone(),
                path: Some(path),
            },
        );

        Ok(session)
    }

    /// Gets or creates the session named `id` and loads the weights at `path` into it.
    pub async fn load_session(
        &self,
        id: &str,
        path: impl AsRef<Path>,
    ) -> Result<SessionHandle, RegistryError> {
        let path = path.as_ref();
        let session = self.get_or_create(id, Some(path)).await;

        session.load_model(path).await?;
        Ok(session)
    }

    /// Returns the session named `id`.
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        let state = self.inner.state.lock().await;
        state.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Whether a session named `id` exists.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.state.lock().await.sessions.contains_key(id)
    }

    /// Returns the ids of every registered session, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<_> = state.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Makes `id` the default session. Returns false if there is no such session.
    pub async fn set_default(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock().await;

        if !state.sessions.contains_key(id) {
            return false;
        }

        state.default = Some(id.to_string());
        true
    }

    /// Returns the default session, if any session exists.
    pub async fn get_default(&self) -> Option<SessionHandle> {
        let state = self.inner.state.lock().await;
        let id = state.default.as_ref()?;
        state.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Returns the id of the default session.
    pub async fn default_id(&self) -> Option<String> {
        self.inner.state.lock().await.default.clone()
    }

    /// Frees the context of session `id` but keeps its weights reference.
    pub async fn unload_context_only(&self, id: &str) -> Result<(), RegistryError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;

        info!(session = id, "Unloading context");
        session.unload_context_only().await?;
        Ok(())
    }

    /// Removes session `id`, releasing its context, weights reference and sequence id.
    ///
    /// If it was the default, another session (the lowest id) becomes the default.
    pub async fn unload_fully(&self, id: &str) -> Result<(), RegistryError> {
        let entry = {
            let mut state = self.inner.state.lock().await;

            let entry = state
                .sessions
                .remove(id)
                .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;

            if state.default.as_deref() == Some(id) {
                state.default = state.sessions.keys().min().cloned();
                debug!(session = id, new_default = ?state.default, "Reassigned default session");
            }

            entry
        };

        self.inner.leases.lock().await.remove(id);

        info!(session = id, "Unloading session");
        entry.session.unload_fully().await?;
        Ok(())
    }

    /// Fully unloads every session.
    pub async fn unload_all(&self) {
        for id in self.ids().await {
            if let Err(err) = self.unload_fully(&id).await {
                warn!(session = id, "Failed to unload session: {err}");
            }
        }
    }

    /// Takes a context-usage reference on session `id`.
    ///
    /// The first reference makes sure a context is live: it is rebuilt from resident weights,
    /// or loaded from the path the session was created with. The context stays live until
    /// every reference has been released.
    pub async fn acquire_session_context(&self, id: &str) -> Result<ContextLease, RegistryError> {
        let mut leases = self.inner.leases.lock().await;
        let count = leases.get(id).copied().unwrap_or(0);

        if count == 0 {
            let (session, path) = {
                let state = self.inner.state.lock().await;
                let entry = state
                    .sessions
                    .get(id)
                    .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
                (entry.session.clone(), entry.path.clone())
            };

            let has_weights = session.lock().await.has_weights();
            match (has_weights, path) {
                (true, _) => session.ensure_context().await?,
                (false, Some(path)) => session.load_model(path).await?,
                (false, None) => return Err(SessionError::NotLoaded.into()),
            }

            info!(session = id, "Context acquired");
        }

        leases.insert(id.to_string(), count + 1);
        debug!(session = id, users = count + 1, "Took context lease");

        Ok(ContextLease {
            registry: self.clone(),
            id: id.to_string(),
            released: false,
        })
    }

    /// Gives back a context-usage reference. When the last one is released, the context is
    /// torn down; the weights stay resident.
    pub async fn release_session_context(&self, id: &str) -> Result<(), RegistryError> {
        let mut leases = self.inner.leases.lock().await;

        let Some(count) = leases.get_mut(id) else {
            warn!(session = id, "Context released more often than acquired");
            return Ok(());
        };

        *count -= 1;
        debug!(session = id, users = *count, "Released context lease");

        if *count > 0 {
            return Ok(());
        }

        leases.remove(id);

        match self.get(id).await {
            Some(session) => {
                info!(session = id, "Last context user gone, unloading context");
                session.unload_context_only().await?;
            }
            None => debug!(session = id, "Session already removed"),
        }

        Ok(())
    }

    /// Returns how many context leases are outstanding for session `id`.
    pub async fn context_users(&self, id: &str) -> usize {
        self.inner.leases.lock().await.get(id).copied().unwrap_or(0)
    }

    /// Acquires the configured thinking session's context.
    pub async fn acquire_thinking_session(&self) -> Result<ContextLease, RegistryError> {
        let id = self.thinking_session_id();
        self.acquire_session_context(&id).await
    }

    /// Releases one reference on the configured thinking session's context.
    pub async fn release_thinking_session(&self) -> Result<(), RegistryError> {
        let id = self.thinking_session_id();
        self.release_session_context(&id).await
    }

    fn thinking_session_id(&self) -> String {
        snapshot(&self.inner.config).thinking_session_id
    }
}

/// A context-usage reference taken with [`SessionRegistry::acquire_session_context`].
///
/// Dropping the lease releases it in the background; [`ContextLease::release`] does so and
/// waits for the teardown.
pub struct ContextLease {
    registry: SessionRegistry,
    id: String,
    released: bool,
}

impl ContextLease {
    /// The session this lease keeps alive.
    pub fn session_id(&self) -> &str {
        &self.id
    }

    /// Releases the lease and waits for the context to be torn down if it was the last one.
    pub async fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        self.registry.release_session_context(&self.id).await
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let registry = self.registry.clone();
        let id = std::mem::take(&mut self.id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = registry.release_session_context(&id).await {
                        warn!(session = id, "Failed to release context lease: {err}");
                    }
                });
            }
            Err(_) => warn!(session = id, "Context lease dropped outside a runtime, leaking it"),
        }
    }
}
