//! Implements the [`WeightsRegistry`], which loads model weights at most once per key and
//! shares them between sessions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, InferenceBackend, ModelHandle, ModelParams};

/// Owner recorded for references taken outside of any session.
const EXTERNAL_OWNER: &str = "<external>";

/// Source of registry identities, used to catch handles released to the wrong registry.
static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// An error raised while loading weights.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightsLoadError {
    /// The given path couldn't be loaded because it doesn't exist on the filesystem.
    #[error("Path does not exist: {0}")]
    DoesNotExist(PathBuf),

    /// Something went wrong on the other side of the backend boundary.
    #[error("the backend couldn't load the provided weights: {0}")]
    Backend(#[from] BackendError),
}

/// Explicit unload was refused because sessions still reference the weights.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("weights \"{key}\" are still in use by {users:?}")]
pub struct WeightsStillInUse {
    /// The key that was asked to be unloaded.
    pub key: String,

    /// Everyone still holding a reference.
    pub users: Vec<String>,
}

/// Loaded, immutable tensor data shared by any number of sessions.
pub struct ModelWeights {
    key: String,
    path: PathBuf,
    model: ModelHandle,
    vocabulary_size: usize,
    ref_count: AtomicUsize,
}

impl ModelWeights {
    /// The identity these weights are registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The file the weights were loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The backend handle.
    pub fn model(&self) -> ModelHandle {
        self.model
    }

    /// The number of entries in the vocabulary.
    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary_size
    }

    /// The number of outstanding [`WeightsHandle`]s.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ModelWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelWeights")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("model", &self.model)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// One counted reference to [`ModelWeights`].
///
/// Handles are not `Clone`: every handle stands for exactly one acquire and must be given
/// back through [`WeightsRegistry::release`]. Dropping a handle without releasing it keeps the
/// weights loaded.
pub struct WeightsHandle {
    registry: u64,
    owner: String,
    weights: Arc<ModelWeights>,
    released: bool,
}

impl WeightsHandle {
    /// The identity these weights are registered under.
    pub fn key(&self) -> &str {
        self.weights.key()
    }

    /// The file the weights were loaded from.
    pub fn path(&self) -> &Path {
        self.weights.path()
    }

    /// The backend handle.
    pub fn model(&self) -> ModelHandle {
        self.weights.model()
    }

    /// The number of entries in the vocabulary.
    pub fn vocabulary_size(&self) -> usize {
        self.weights.vocabulary_size()
    }

    /// Who took this reference.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl fmt::Debug for WeightsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightsHandle")
            .field("key", &self.key())
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for WeightsHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                key = self.key(),
                owner = self.owner,
                "Weights handle dropped without being released; weights stay loaded"
            );
        }
    }
}

struct RegistryInner {
    weights: HashMap<String, Arc<ModelWeights>>,

    /// Owners per key, one entry per outstanding reference. Cross-checked against
    /// [`ModelWeights::ref_count`].
    usage: HashMap<String, Vec<String>>,

    /// Keys whose weights are being loaded right now, with the registry lock released.
    loading: HashSet<String>,
}

/// Reference-counted owner of every loaded set of weights.
///
/// Loading happens outside the registry lock: other keys stay usable while weights load,
/// and concurrent acquires of a key that is loading wait for that load instead of starting
/// another.
pub struct WeightsRegistry {
    id: u64,
    backend: Arc<dyn InferenceBackend>,
    params: ModelParams,
    inner: Mutex<RegistryInner>,
    load_finished: Condvar,
}

impl WeightsRegistry {
    /// Creates an empty registry loading weights through `backend`.
    pub fn new(backend: Arc<dyn InferenceBackend>, params: ModelParams) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            params,
            inner: Mutex::new(RegistryInner {
                weights: HashMap::new(),
                usage: HashMap::new(),
                loading: HashSet::new(),
            }),
            load_finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derives the registry key for a path.
    pub fn key_for(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    /// Acquires the weights at `path`, keyed by the path itself, loading them if needed.
    pub fn acquire(&self, path: impl AsRef<Path>) -> Result<WeightsHandle, WeightsLoadError> {
        let path = path.as_ref();
        self.acquire_for(EXTERNAL_OWNER, &Self::key_for(path), path)
    }

    /// Acquires the weights registered as `key`, loading them from `path` if needed.
    pub fn acquire_keyed(
        &self,
        key: &str,
        path: impl AsRef<Path>,
    ) -> Result<WeightsHandle, WeightsLoadError> {
        self.acquire_for(EXTERNAL_OWNER, key, path.as_ref())
    }

    /// Acquires the weights registered as `key` on behalf of `owner`, loading them from `path`
    /// if they are not resident yet.
    pub fn acquire_for(
        &self,
        owner: &str,
        key: &str,
        path: &Path,
    ) -> Result<WeightsHandle, WeightsLoadError> {
        let mut inner = self.lock();

        loop {
            if let Some(weights) = inner.weights.get(key).cloned() {
                let count = weights.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
                inner
                    .usage
                    .entry(key.to_string())
                    .or_default()
                    .push(owner.to_string());
                debug!(key, owner, count, "Reusing loaded weights");

                return Ok(self.handle(owner, weights));
            }

            if !inner.loading.contains(key) {
                break;
            }

            debug!(key, owner, "Waiting for weights that are already loading");
            inner = self
                .load_finished
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if !path.exists() {
            return Err(WeightsLoadError::DoesNotExist(path.into()));
        }

        inner.loading.insert(key.to_string());
        drop(inner);

        let loading = LoadingGuard {
            registry: self,
            key,
        };

        info!("Loading weights \"{}\" as \"{key}\"", path.to_string_lossy());

        let model = self.backend.load_model(path, &self.params).map_err(|err| {
            error!(key, "Failed to load weights: {err}");
            err
        })?;

        let weights = Arc::new(ModelWeights {
            key: key.to_string(),
            path: path.to_path_buf(),
            model,
            vocabulary_size: self.backend.vocabulary_size(model),
            ref_count: AtomicUsize::new(1),
        });

        let mut inner = self.lock();
        inner.weights.insert(key.to_string(), weights.clone());
        inner
            .usage
            .insert(key.to_string(), vec![owner.to_string()]);
        drop(inner);
        drop(loading);

        Ok(self.handle(owner, weights))
    }

    /// Takes another reference to weights already registered as `key`, without loading.
    pub fn acquire_existing(&self, owner: &str, key: &str) -> Option<WeightsHandle> {
        let mut inner = self.lock();
        let weights = inner.weights.get(key).cloned()?;

        weights.ref_count.fetch_add(1, Ordering::SeqCst);
        inner
            .usage
            .entry(key.to_string())
            .or_default()
            .push(owner.to_string());

        Some(self.handle(owner, weights))
    }

    fn handle(&self, owner: &str, weights: Arc<ModelWeights>) -> WeightsHandle {
        WeightsHandle {
            registry: self.id,
            owner: owner.to_string(),
            weights,
            released: false,
        }
    }

    /// Gives back one reference. The weights are freed when the last reference is released.
    ///
    /// Releasing a handle this registry never issued is a programming error: it panics in
    /// debug builds and is ignored (with an error log) in release builds.
    pub fn release(&self, mut handle: WeightsHandle) {
        handle.released = true;

        if handle.registry != self.id {
            misuse(&format!(
                "weights \"{}\" released to a registry that never issued them",
                handle.key()
            ));
            return;
        }

        let mut inner = self.lock();
        let key = handle.key().to_string();

        let registered = matches!(
            inner.weights.get(&key),
            Some(weights) if Arc::ptr_eq(weights, &handle.weights)
        );
        if !registered {
            drop(inner);
            misuse(&format!("weights \"{key}\" are not registered"));
            return;
        }

        if let Some(owners) = inner.usage.get_mut(&key) {
            if let Some(i) = owners.iter().position(|owner| *owner == handle.owner) {
                owners.swap_remove(i);
            } else {
                warn!(key, owner = handle.owner, "Usage ledger has no entry for owner");
            }
        }

        let remaining = handle.weights.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        let ledger = inner.usage.get(&key).map_or(0, Vec::len);
        if ledger != remaining {
            warn!(key, remaining, ledger, "Weights reference count disagrees with usage ledger");
        }

        if remaining == 0 {
            inner.weights.remove(&key);
            inner.usage.remove(&key);
            drop(inner);

            info!(key, "Freeing weights");
            self.backend.free_model(handle.model());
        } else {
            debug!(key, remaining, "Released weights reference");
        }
    }

    /// Explicitly unloads the weights registered as `key`.
    ///
    /// Weights are freed as soon as their last reference is released, so this only succeeds
    /// when nothing references `key` anymore; otherwise it is refused.
    pub fn unload(&self, key: &str) -> Result<(), WeightsStillInUse> {
        let inner = self.lock();

        match inner.weights.get(key) {
            Some(weights) if weights.ref_count() > 0 => Err(WeightsStillInUse {
                key: key.to_string(),
                users: inner.usage.get(key).cloned().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    /// Returns the keys of every resident set of weights, sorted.
    pub fn list_loaded(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().weights.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns true if weights are registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().weights.contains_key(key)
    }

    /// Returns the number of outstanding references to `key`, or 0 if it is not resident.
    pub fn ref_count(&self, key: &str) -> usize {
        self.lock().weights.get(key).map_or(0, |w| w.ref_count())
    }

    /// Returns who holds references to `key`, one entry per reference.
    pub fn users(&self, key: &str) -> Vec<String> {
        self.lock().usage.get(key).cloned().unwrap_or_default()
    }

    /// Returns the path `key` was loaded from.
    pub fn path(&self, key: &str) -> Option<PathBuf> {
        self.lock().weights.get(key).map(|w| w.path.clone())
    }
}

impl Drop for WeightsRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);

        for (key, weights) in inner.weights.drain() {
            warn!(
                key,
                refs = weights.ref_count(),
                "Registry dropped with weights still referenced; freeing"
            );
            self.backend.free_model(weights.model);
        }
    }
}

/// Clears a key's loading mark and wakes everyone waiting on it, whether the load
/// succeeded, failed, or panicked.
struct LoadingGuard<'a> {
    registry: &'a WeightsRegistry,
    key: &'a str,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().loading.remove(self.key);
        self.registry.load_finished.notify_all();
    }
}

fn misuse(message: &str) {
    error!("{message}; this should never happen");
    debug_assert!(false, "{message}");
}
