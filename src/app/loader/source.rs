use super::{ModelKey, ModelSource};
use crate::core::{Cancellable, Error, LanguageModel, Result};
use crate::infra::{read_model_file, ModelStore, ProgressFn, QuantizeConfig};
use async_trait::async_trait;
use std::path::PathBuf;

/// Models from the local store, downloaded on first use.
pub struct FileModelSource {
    store: ModelStore,
}

impl FileModelSource {
    pub fn new(store: ModelStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }
}

async fn parse_file(
    path: PathBuf,
    quantize: QuantizeConfig,
    cancel: Cancellable,
    on_progress: Option<ProgressFn>,
) -> Result<LanguageModel> {
    tokio::task::spawn_blocking(move || read_model_file(&path, &quantize, Some(&cancel), on_progress))
        .await
        .map_err(|e| Error::format(format!("model parse task failed: {}", e)))?
}

#[async_trait]
impl ModelSource for FileModelSource {
    async fn load(&self, key: ModelKey, cancel: Cancellable, on_progress: Option<ProgressFn>) -> Result<LanguageModel> {
        let path = self.store.fetch(key.model, &cancel, on_progress.clone()).await?;
        let quantize = QuantizeConfig::for_gpt2(key.quantization)?;
        parse_file(path, quantize, cancel, on_progress).await
    }
}
