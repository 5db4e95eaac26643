use crate::core::{Cancellable, Error, Result};
use crate::infra::format::ProgressFn;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

const MODEL_BASE_URL: &str = "https://huggingface.co/ggerganov/ggml/resolve/main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefinedModel {
    #[serde(rename = "gpt2-117M")]
    Gpt2Small,
    #[serde(rename = "gpt2-345M")]
    Gpt2Medium,
    #[serde(rename = "gpt2-774M")]
    Gpt2Large,
    #[serde(rename = "gpt2-1558M")]
    Gpt2Xl,
}

impl DefinedModel {
    pub const ALL: [DefinedModel; 4] = [
        DefinedModel::Gpt2Small,
        DefinedModel::Gpt2Medium,
        DefinedModel::Gpt2Large,
        DefinedModel::Gpt2Xl,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DefinedModel::Gpt2Small => "gpt2-117M",
            DefinedModel::Gpt2Medium => "gpt2-345M",
            DefinedModel::Gpt2Large => "gpt2-774M",
            DefinedModel::Gpt2Xl => "gpt2-1558M",
        }
    }

    fn size(&self) -> &'static str {
        self.name().trim_start_matches("gpt2-")
    }

    pub fn url(&self) -> String {
        format!("{}/ggml-model-gpt-2-{}.bin", MODEL_BASE_URL, self.size())
    }
}

impl fmt::Display for DefinedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DefinedModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s) || m.size().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::NotFound(format!("model {}", s)))
    }
}

/// Local cache of model files, filled from the network on first use.
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
    client: Client,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            client: Client::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn local_path(&self, model: DefinedModel) -> Result<PathBuf> {
        let url = Url::parse(&model.url()).map_err(|e| Error::Download(e.to_string()))?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Download(format!("no file name in {}", url)))?;
        Ok(self.models_dir.join(name))
    }

    pub fn is_cached(&self, model: DefinedModel) -> bool {
        self.local_path(model).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Path of the local copy of `model`, downloading it first when missing.
    pub async fn fetch(
        &self,
        model: DefinedModel,
        cancel: &Cancellable,
        on_progress: Option<ProgressFn>,
    ) -> Result<PathBuf> {
        let path = self.local_path(model)?;
        if path.is_file() {
            debug!("{} is cached at {}", model, path.display());
            return Ok(path);
        }

        self.download(&model.url(), &path, cancel, on_progress).await?;
        Ok(path)
    }

    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &Cancellable,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut part_name = dest.file_name().unwrap_or_default().to_os_string();
        part_name.push(".part");
        let part = dest.with_file_name(part_name);

        info!("downloading {} to {}", url, dest.display());
        match self.download_to(url, &part, cancel, on_progress).await {
            Ok(()) => {
                tokio::fs::rename(&part, dest).await?;
                info!("downloaded {}", dest.display());
                Ok(())
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&part).await {
                    debug!("could not remove {}: {}", part.display(), remove);
                }
                if e.is_cancelled() {
                    debug!("download of {} cancelled", url);
                } else {
                    warn!("download of {} failed: {}", url, e);
                }
                Err(e)
            }
        }
    }

    async fn download_to(
        &self,
        url: &str,
        part: &Path,
        cancel: &Cancellable,
        on_progress: Option<ProgressFn>,
    ) -> Result<()> {
        cancel.check()?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.client.get(url).send() => response?,
        };
        if !response.status().is_success() {
            return Err(Error::Download(format!("{} returned {}", url, response.status())));
        }

        let total = response.content_length().map(|n| n as i64).unwrap_or(-1);
        if let Some(cb) = &on_progress {
            cb(-1, total);
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut body = response.bytes_stream();
        let mut received: i64 = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            cancel.check()?;

            file.write_all(&chunk).await?;
            received += chunk.len() as i64;
            if let Some(cb) = &on_progress {
                cb(received, total);
            }
        }

        file.flush().await?;
        if total >= 0 && received != total {
            return Err(Error::Download(format!("expected {} bytes, received {}", total, received)));
        }
        Ok(())
    }
}
