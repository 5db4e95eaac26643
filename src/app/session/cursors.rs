use crate::app::cursor::{CompletionCursor, StreamChunk};
use crate::app::loader::{ModelKey, ModelLoader};
use crate::core::{Cancellable, Error, Result, SamplerConfig};
use crate::infra::ProgressFn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorRetention {
    /// Keep the cursor until an edit or a model switch invalidates it.
    RetainWhileUnchanged,
    PerPrediction,
}

impl CursorRetention {
    pub fn from_flag(retain: bool) -> Self {
        if retain {
            CursorRetention::RetainWhileUnchanged
        } else {
            CursorRetention::PerPrediction
        }
    }
}

struct ManagerState {
    key: ModelKey,
    cursor: Option<CompletionCursor>,
    destroyed: bool,
}

/// Owns the model loader of a session and the cursor bound to its text.
pub struct CursorManager {
    loader: ModelLoader,
    sampler: SamplerConfig,
    max_tokens: usize,
    retention: CursorRetention,
    on_progress: Option<ProgressFn>,
    state: Mutex<ManagerState>,
}

impl CursorManager {
    pub fn new(loader: ModelLoader, key: ModelKey) -> Self {
        Self {
            loader,
            sampler: SamplerConfig::default(),
            max_tokens: crate::infra::config::DEFAULT_MAX_TOKENS,
            retention: CursorRetention::RetainWhileUnchanged,
            on_progress: None,
            state: Mutex::new(ManagerState {
                key,
                cursor: None,
                destroyed: false,
            }),
        }
    }

    pub fn sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn retention(mut self, retention: CursorRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn on_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn key(&self) -> ModelKey {
        self.state.lock().key
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    pub fn has_cursor(&self) -> bool {
        self.state.lock().cursor.is_some()
    }

    /// The retained cursor, or a new one over `prompt` once the model is loaded.
    pub async fn with_cursor(&self, prompt: &str, cancel: &Cancellable) -> Result<CompletionCursor> {
        let key = {
            let state = self.state.lock();
            if state.destroyed {
                return Err(Error::Cancelled);
            }
            if let Some(cursor) = &state.cursor {
                return Ok(cursor.clone());
            }
            state.key
        };

        let model = self.loader.load(key, cancel, self.on_progress.clone()).await?;

        let mut state = self.state.lock();
        if state.destroyed || state.key != key {
            debug!("model {} no longer wanted", key);
            return Err(Error::Cancelled);
        }
        let cursor = CompletionCursor::new(model, prompt, self.max_tokens, self.sampler.build())?;
        if self.retention == CursorRetention::RetainWhileUnchanged {
            state.cursor = Some(cursor.clone());
        }
        Ok(cursor)
    }

    pub fn invalidate_cursor(&self) {
        if self.state.lock().cursor.take().is_some() {
            debug!("cursor invalidated");
        }
    }

    pub fn set_model(&self, key: ModelKey) {
        let mut state = self.state.lock();
        if state.key != key {
            state.key = key;
            state.cursor = None;
        }
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.cursor = None;
    }

    /// Generates up to `n_tokens` tokens after `prompt`, handing each generated
    /// chunk to `on_chunk`. Returns whether generation stopped at end of text.
    pub async fn predict<F>(
        &self,
        prompt: &str,
        n_tokens: usize,
        batch_size: usize,
        cancel: &Cancellable,
        mut on_chunk: F,
    ) -> Result<bool>
    where
        F: FnMut(StreamChunk) + Send + 'static,
    {
        let cursor = self.with_cursor(prompt, cancel).await?;
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut eos = false;
            for chunk in cursor.exec_stream(n_tokens, batch_size, &cancel)? {
                let chunk = chunk?;
                eos |= chunk.is_eos;
                if !chunk.is_prompt {
                    on_chunk(chunk);
                }
            }
            Ok(eos)
        })
        .await
        .map_err(|e| Error::format(format!("prediction task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::loader::ModelSource;
    use crate::app::session::{drive_prediction, Session, SessionCommand, SessionEvent, SessionState};
    use crate::core::model::testing::tiny_model;
    use crate::core::{DType, LanguageModel};
    use crate::infra::{DefinedModel, Quantization};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct TinySource {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelSource for TinySource {
        async fn load(&self, key: ModelKey, _cancel: Cancellable, _p: Option<ProgressFn>) -> Result<LanguageModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(tiny_model(key.quantization.target().unwrap_or(DType::F32), 4))
        }
    }

    fn manager(retention: CursorRetention) -> (CursorManager, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        let loader = ModelLoader::new(TinySource { loads: loads.clone() });
        let key = ModelKey::new(DefinedModel::Gpt2Small, Quantization::None);
        (CursorManager::new(loader, key).max_tokens(16).retention(retention), loads)
    }

    #[tokio::test]
    async fn test_cursor_is_retained() {
        let (manager, loads) = manager(CursorRetention::RetainWhileUnchanged);
        let cancel = Cancellable::new();
        let first = manager.with_cursor("The meaning", &cancel).await.unwrap();
        first.exec(1, &cancel).unwrap();
        let second = manager.with_cursor("The meaning", &cancel).await.unwrap();
        assert_eq!(second.n_past(), first.n_past());

        manager.invalidate_cursor();
        let third = manager.with_cursor("The meaning", &cancel).await.unwrap();
        assert_eq!(third.n_past(), 0);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_prediction_cursor() {
        let (manager, _) = manager(CursorRetention::PerPrediction);
        let cancel = Cancellable::new();
        manager.with_cursor("a b", &cancel).await.unwrap().exec(1, &cancel).unwrap();
        assert!(!manager.has_cursor());
        assert_eq!(manager.with_cursor("a b", &cancel).await.unwrap().n_past(), 0);
    }

    #[tokio::test]
    async fn test_set_model_reloads() {
        let (manager, loads) = manager(CursorRetention::RetainWhileUnchanged);
        let cancel = Cancellable::new();
        manager.with_cursor("a", &cancel).await.unwrap();

        let q8 = ModelKey::new(DefinedModel::Gpt2Small, Quantization::Q8_0);
        manager.set_model(q8);
        assert!(!manager.has_cursor());
        let cursor = manager.with_cursor("a", &cancel).await.unwrap();
        assert_eq!(cursor.model().hparams().weight_dtype().unwrap(), DType::Q8_0);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_destroyed_manager_refuses() {
        let (manager, _) = manager(CursorRetention::RetainWhileUnchanged);
        manager.destroy();
        let err = manager.with_cursor("a", &Cancellable::new()).await.err().unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_predict_skips_prompt() {
        let (manager, _) = manager(CursorRetention::RetainWhileUnchanged);
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let eos = manager
            .predict("The meaning of life", 4, 2, &Cancellable::new(), move |c| sink.lock().push(c))
            .await
            .unwrap();

        assert!(!eos);
        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| !c.is_prompt));
        assert!(chunks[1].is_complete);
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (manager, _) = manager(CursorRetention::RetainWhileUnchanged);
        let mut session = Session::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let commands = session.handle(SessionEvent::CaretForward {
            text: "The meaning".into(),
            at_end: true,
        });
        let [SessionCommand::StartPrediction { id, prompt, cancel }] = commands.as_slice() else {
            panic!("unexpected {:?}", commands);
        };
        drive_prediction(&manager, *id, prompt.clone(), cancel.clone(), 3, 1, tx).await;

        let mut shown = String::new();
        while let Ok(event) = rx.try_recv() {
            for command in session.handle(event) {
                if let SessionCommand::ShowCandidate(text) = command {
                    shown.push_str(&text);
                }
            }
        }
        assert_eq!(session.state(), SessionState::AwaitingAccept);
        assert_eq!(session.candidate(), shown);
        assert!(!shown.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_prediction_reports_cancelled() {
        let (manager, _) = manager(CursorRetention::RetainWhileUnchanged);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = Cancellable::new();
        cancel.cancel();

        drive_prediction(&manager, 7, "a".into(), cancel, 3, 1, tx).await;
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Cancelled { id: 7 })));
    }
}
