use crate::progress::{human_bytes, Bar};
use anyhow::{Context, Result};
use clap::Args;
use gpt2_complete::app::{CompletionCursor, FileModelSource, ModelKey, ModelLoader};
use gpt2_complete::infra::{read_model_file, write_model_file, ProgressFn};
use gpt2_complete::{
    Cancellable, DefinedModel, EngineConfig, LanguageModel, ModelStore, QuantizeConfig, Quantization, SamplerConfig,
};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Args)]
pub struct CompleteArgs {
    pub prompt: String,
    #[arg(short, long, default_value = "gpt2-117M")]
    pub model: String,
    #[arg(short, long, default_value = "none")]
    pub quantization: String,
    /// Read this model file instead of the store
    #[arg(long)]
    pub model_file: Option<PathBuf>,
    #[arg(short = 'n', long, default_value_t = 64)]
    pub tokens: usize,
    /// Tokens per streamed chunk, defaults to GPT2_COMPLETE_CHUNK_SIZE
    #[arg(short, long)]
    pub batch: Option<usize>,
    #[arg(long)]
    pub top_k: Option<usize>,
    #[arg(long)]
    pub top_p: Option<f32>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Always pick the most likely token
    #[arg(long)]
    pub greedy: bool,
}

/// Treats a run stopped by Ctrl-C as a clean exit.
pub fn ignore_cancelled(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.downcast_ref::<gpt2_complete::Error>().is_some_and(|e| e.is_cancelled()) => {
            println!();
            debug!("cancelled");
            Ok(())
        }
        other => other,
    }
}

fn cancel_on_ctrl_c() -> Cancellable {
    let cancel = Cancellable::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    cancel
}

async fn read_file(path: PathBuf, quantize: QuantizeConfig, on_progress: Option<ProgressFn>) -> Result<LanguageModel> {
    let shown = path.display().to_string();
    let model = tokio::task::spawn_blocking(move || read_model_file(&path, &quantize, None, on_progress))
        .await?
        .with_context(|| format!("reading {}", shown))?;
    Ok(model)
}

pub async fn complete(args: CompleteArgs) -> Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(top_k) = args.top_k {
        config = config.top_k(top_k);
    }
    if let Some(top_p) = args.top_p {
        config = config.top_p(top_p);
    }
    if args.seed.is_some() {
        config = config.seed(args.seed);
    }
    let sampler = if args.greedy { SamplerConfig::Argmax } else { config.sampler() };
    let quantization: Quantization = args.quantization.parse()?;
    let cancel = cancel_on_ctrl_c();

    let bar = Bar::new("loading model");
    let model = match args.model_file {
        Some(path) => Arc::new(read_file(path, QuantizeConfig::for_gpt2(quantization)?, Some(bar.observer())).await?),
        None => {
            let key = ModelKey::new(args.model.parse()?, quantization);
            let loader = ModelLoader::new(FileModelSource::new(ModelStore::new(&config.models_dir)));
            loader.load(key, &cancel, Some(bar.observer())).await?
        }
    };
    bar.finish();

    let capacity = model.hparams().n_ctx;
    let cursor = CompletionCursor::new(model, &args.prompt, capacity, sampler.build())?;
    let batch = args.batch.unwrap_or(config.chunk_size);
    let n_tokens = args.tokens;

    let eos = tokio::task::spawn_blocking(move || -> Result<bool> {
        let mut stdout = io::stdout();
        let mut eos = false;
        for chunk in cursor.exec_stream(n_tokens, batch, &cancel)? {
            let chunk = chunk?;
            write!(stdout, "{}", chunk.text)?;
            stdout.flush()?;
            eos |= chunk.is_eos;
        }
        writeln!(stdout)?;
        Ok(eos)
    })
    .await??;

    debug!("completion finished, eos {}", eos);
    Ok(())
}

pub async fn pull(model: &str) -> Result<()> {
    let model: DefinedModel = model.parse()?;
    let config = EngineConfig::from_env();
    let store = ModelStore::new(&config.models_dir);
    if store.is_cached(model) {
        println!("Model {} is already downloaded", model);
        return Ok(());
    }

    let bar = Bar::new(&format!("pulling {}", model));
    let cancel = cancel_on_ctrl_c();
    let path = store.fetch(model, &cancel, Some(bar.observer())).await?;
    bar.finish();

    println!("Model {} pulled to {}", model, path.display());
    Ok(())
}

pub async fn list() -> Result<()> {
    let config = EngineConfig::from_env();
    let store = ModelStore::new(&config.models_dir);

    println!("{:<14} {:<10} PATH", "NAME", "SIZE");
    println!("{}", "-".repeat(80));
    for model in DefinedModel::ALL {
        let path = store.local_path(model)?;
        let size = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => human_bytes(meta.len()),
            _ => "-".to_string(),
        };
        println!("{:<14} {:<10} {}", model.name(), size, path.display());
    }
    Ok(())
}

pub async fn quantize(input: PathBuf, output: PathBuf, quantization: &str) -> Result<()> {
    let quantization: Quantization = quantization.parse()?;
    let bar = Bar::new(&format!("quantizing to {}", quantization));
    let model = read_file(input, QuantizeConfig::for_gpt2(quantization)?, Some(bar.observer())).await?;
    bar.finish();

    let target = output.clone();
    tokio::task::spawn_blocking(move || write_model_file(&target, &model)).await??;
    println!("Wrote {}", output.display());
    Ok(())
}

#[derive(Serialize)]
struct TensorReport {
    name: String,
    shape: Vec<usize>,
    dtype: &'static str,
}

#[derive(Serialize)]
struct InspectReport {
    hparams: gpt2_complete::Hyperparameters,
    n_tokens: usize,
    tensors: Vec<TensorReport>,
}

pub async fn inspect(file: PathBuf, json: bool) -> Result<()> {
    let model = read_file(file, QuantizeConfig::none(), None).await?;
    let report = InspectReport {
        hparams: *model.hparams(),
        n_tokens: model.dictionary().len(),
        tensors: model
            .desc()
            .flatten()
            .into_iter()
            .map(|(name, desc)| TensorReport {
                name,
                shape: desc.shape.dims().to_vec(),
                dtype: desc.dtype.name(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let hp = &report.hparams;
    println!("n_vocab: {}", hp.n_vocab);
    println!("n_ctx:   {}", hp.n_ctx);
    println!("n_embd:  {}", hp.n_embd);
    println!("n_head:  {}", hp.n_head);
    println!("n_layer: {}", hp.n_layer);
    println!("ftype:   {}", hp.ftype);
    println!();
    for tensor in &report.tensors {
        println!("{:<32} {:<6} {:?}", tensor.name, tensor.dtype, tensor.shape);
    }
    Ok(())
}
