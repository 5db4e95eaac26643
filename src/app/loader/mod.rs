pub mod source;

pub use source::FileModelSource;

use crate::core::{Cancellable, Error, LanguageModel, Result};
use crate::infra::{DefinedModel, ProgressFn, Quantization};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub model: DefinedModel,
    pub quantization: Quantization,
}

impl ModelKey {
    pub fn new(model: DefinedModel, quantization: Quantization) -> Self {
        Self { model, quantization }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.quantization)
    }
}

#[async_trait]
pub trait ModelSource: Send + Sync + 'static {
    async fn load(&self, key: ModelKey, cancel: Cancellable, on_progress: Option<ProgressFn>) -> Result<LanguageModel>;
}

pub type ReadyFn = Box<dyn FnOnce(Result<Arc<LanguageModel>>) + Send>;

struct PendingLoad {
    id: u64,
    key: ModelKey,
    load_cancel: Cancellable,
    on_ready: ReadyFn,
    caller_cancel: Cancellable,
    on_progress: Option<ProgressFn>,
}

#[derive(Default)]
struct LoaderState {
    loaded: Option<(ModelKey, Arc<LanguageModel>)>,
    pending: Option<PendingLoad>,
    next_id: u64,
    // id of the load that filled `loaded`
    loaded_id: u64,
}

/// Keeps at most one loaded model and at most one load in flight.
///
/// A second request for the key being loaded takes over the callback of the
/// first without restarting the transfer. A request for another key cancels
/// the transfer in flight and replaces it.
#[derive(Clone)]
pub struct ModelLoader {
    source: Arc<dyn ModelSource>,
    state: Arc<Mutex<LoaderState>>,
}

impl ModelLoader {
    pub fn new(source: impl ModelSource) -> Self {
        Self {
            source: Arc::new(source),
            state: Arc::new(Mutex::new(LoaderState::default())),
        }
    }

    pub fn loaded_key(&self) -> Option<ModelKey> {
        self.state.lock().loaded.as_ref().map(|(key, _)| *key)
    }

    pub fn pending_key(&self) -> Option<ModelKey> {
        self.state.lock().pending.as_ref().map(|p| p.key)
    }

    pub fn unload(&self) {
        self.state.lock().loaded = None;
    }

    /// Calls `on_ready` with the model for `key`, loading it first if needed.
    ///
    /// Must be called from within a tokio runtime. `on_ready` runs on the
    /// calling thread when the model is already loaded, otherwise on the load
    /// task. It is never invoked once `cancel` has fired.
    pub fn with_model(&self, key: ModelKey, cancel: &Cancellable, on_ready: ReadyFn, on_progress: Option<ProgressFn>) {
        let mut state = self.state.lock();

        if let Some((loaded_key, model)) = &state.loaded {
            if *loaded_key == key {
                let model = model.clone();
                drop(state);
                if cancel.is_cancelled() {
                    debug!("{} requested by a cancelled caller", key);
                } else {
                    on_ready(Ok(model));
                }
                return;
            }
        }

        if let Some(pending) = state.pending.as_mut() {
            if pending.key == key {
                debug!("joining pending load of {}", key);
                pending.on_ready = on_ready;
                pending.caller_cancel = cancel.clone();
                pending.on_progress = on_progress;
                return;
            }
            info!("cancelling load of {} in favour of {}", pending.key, key);
            pending.load_cancel.cancel();
        }

        state.next_id += 1;
        let id = state.next_id;
        let load_cancel = Cancellable::new();
        state.pending = Some(PendingLoad {
            id,
            key,
            load_cancel: load_cancel.clone(),
            on_ready,
            caller_cancel: cancel.clone(),
            on_progress,
        });
        drop(state);

        info!("loading {}", key);
        let loader = self.clone();
        let progress = self.progress_forwarder(id);
        tokio::spawn(async move {
            let result = loader.source.load(key, load_cancel, Some(progress)).await;
            loader.finish(id, key, result);
        });
    }

    /// Awaitable form of [`ModelLoader::with_model`].
    pub async fn load(&self, key: ModelKey, cancel: &Cancellable, on_progress: Option<ProgressFn>) -> Result<Arc<LanguageModel>> {
        let (tx, rx) = oneshot::channel();
        self.with_model(
            key,
            cancel,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            on_progress,
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            // a dropped callback means the request was superseded
            result = rx => result.unwrap_or(Err(Error::Cancelled)),
        }
    }

    // Progress goes to whichever caller currently owns load `id`.
    fn progress_forwarder(&self, id: u64) -> ProgressFn {
        let state = Arc::downgrade(&self.state);
        Arc::new(move |received, total| {
            let Some(state) = state.upgrade() else { return };
            let observer = state
                .lock()
                .pending
                .as_ref()
                .filter(|p| p.id == id)
                .and_then(|p| p.on_progress.clone());
            if let Some(observer) = observer {
                observer(received, total);
            }
        })
    }

    fn finish(&self, id: u64, key: ModelKey, result: Result<LanguageModel>) {
        let mut state = self.state.lock();
        let pending = match state.pending.take() {
            Some(p) if p.id == id => p,
            other => {
                state.pending = other;
                match result {
                    // a transfer that finished despite being superseded is kept,
                    // unless a newer load already filled the slot
                    Ok(model) if state.loaded_id < id => {
                        state.loaded = Some((key, Arc::new(model)));
                        state.loaded_id = id;
                        debug!("cached superseded load of {}", key);
                    }
                    _ => debug!("discarding superseded load of {}", key),
                }
                return;
            }
        };

        match result {
            Ok(model) => {
                let model = Arc::new(model);
                state.loaded = Some((key, model.clone()));
                state.loaded_id = id;
                drop(state);
                info!("loaded {}", key);
                if pending.caller_cancel.is_cancelled() {
                    debug!("{} cached for a cancelled caller", key);
                } else {
                    (pending.on_ready)(Ok(model));
                }
            }
            Err(e) if e.is_cancelled() => {
                drop(state);
                debug!("load of {} cancelled", key);
            }
            Err(e) => {
                drop(state);
                error!("failed to load {}: {}", key, e);
                if !pending.caller_cancel.is_cancelled() {
                    (pending.on_ready)(Err(e));
                }
            }
        }
    }
}
