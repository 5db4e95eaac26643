use crate::core::{
    ArgmaxSampler, Cancellable, Error, KvCache, LanguageModel, Result, Sampler, TensorOps, TokenId,
};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

pub use crate::infra::config::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub text: String,
    pub is_prompt: bool,
    pub is_complete: bool,
    pub is_eos: bool,
}

struct CursorState {
    cache: KvCache,
    prompt: Vec<TokenId>,
    n_past: usize,
    last_token: Option<TokenId>,
    sampler: Box<dyn Sampler>,
    prompt_echoed: bool,
    // bytes of a character split across token boundaries
    pending: Vec<u8>,
}

struct CursorInner {
    model: Arc<LanguageModel>,
    prompt_text: String,
    busy: AtomicBool,
    state: Mutex<CursorState>,
}

/// Incremental completion of one prompt against a shared model.
///
/// The cursor owns its KV cache, so successive `exec` calls only run the
/// tokens produced since the previous call.
#[derive(Clone)]
pub struct CompletionCursor {
    inner: Arc<CursorInner>,
}

pub fn create_completion(model: Arc<LanguageModel>, prompt: &str, max_cache_tokens: usize) -> Result<CompletionCursor> {
    CompletionCursor::new(model, prompt, max_cache_tokens, Box::new(ArgmaxSampler))
}

impl CompletionCursor {
    pub fn new(
        model: Arc<LanguageModel>,
        prompt: &str,
        max_cache_tokens: usize,
        sampler: Box<dyn Sampler>,
    ) -> Result<Self> {
        let tokens = model.dictionary().tokenize(prompt)?;
        if tokens.is_empty() {
            return Err(Error::format("Prompt does not contain any known token"));
        }
        let cache = model.new_cache(max_cache_tokens)?;
        debug!(
            "cursor over {} prompt tokens, cache of {} positions",
            tokens.len(),
            cache.n_ctx()
        );

        Ok(Self {
            inner: Arc::new(CursorInner {
                prompt_text: prompt.to_string(),
                model,
                busy: AtomicBool::new(false),
                state: Mutex::new(CursorState {
                    cache,
                    prompt: tokens,
                    n_past: 0,
                    last_token: None,
                    sampler,
                    prompt_echoed: false,
                    pending: Vec::new(),
                }),
            }),
        })
    }

    pub fn model(&self) -> &Arc<LanguageModel> {
        &self.inner.model
    }

    pub fn prompt(&self) -> &str {
        &self.inner.prompt_text
    }

    pub fn n_past(&self) -> usize {
        self.inner.state.lock().n_past
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().cache.n_ctx()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Generates up to `n_tokens` tokens and returns the text with the EOS flag.
    /// The first call on a fresh cursor includes the prompt.
    pub fn exec(&self, n_tokens: usize, cancel: &Cancellable) -> Result<(String, bool)> {
        let mut text = String::new();
        let mut eos = false;
        for chunk in self.exec_stream(n_tokens, n_tokens.max(1), cancel)? {
            let chunk = chunk?;
            text.push_str(&chunk.text);
            eos |= chunk.is_eos;
        }
        Ok((text, eos))
    }

    pub async fn exec_async(&self, n_tokens: usize, cancel: &Cancellable) -> Result<(String, bool)> {
        let cursor = self.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || cursor.exec(n_tokens, &cancel))
            .await
            .map_err(|e| Error::format(format!("completion task failed: {}", e)))?
    }

    /// Lazily generates `n_tokens` tokens, yielding text every `batch_size` tokens.
    pub fn exec_stream(&self, n_tokens: usize, batch_size: usize, cancel: &Cancellable) -> Result<ExecStream> {
        let guard = BusyGuard::acquire(&self.inner)?;
        let echo_prompt = !self.inner.state.lock().prompt_echoed;
        Ok(ExecStream {
            cursor: self.clone(),
            cancel: cancel.clone(),
            remaining: n_tokens,
            batch_size: batch_size.max(1),
            echo_prompt,
            generated: 0,
            is_eos: false,
            deferred: None,
            done: false,
            _guard: guard,
        })
    }

    fn step(&self, state: &mut CursorState, cancel: &Cancellable) -> Result<TokenId> {
        cancel.check()?;
        let feed = match state.last_token {
            Some(token) if state.n_past > 0 => vec![token],
            _ => state.prompt.clone(),
        };

        let model = &self.inner.model;
        let logits = model.forward(&mut state.cache, &feed, state.n_past, Some(cancel))?;
        let token = state.sampler.sample(logits.row(feed.len() - 1)?);

        state.n_past += feed.len();
        state.last_token = Some(token);
        debug!("fed {} tokens, n_past {}, sampled {}", feed.len(), state.n_past, token.0);
        Ok(token)
    }
}

struct BusyGuard {
    inner: Arc<CursorInner>,
}

impl BusyGuard {
    fn acquire(inner: &Arc<CursorInner>) -> Result<Self> {
        if inner.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        Ok(Self { inner: inner.clone() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::SeqCst);
    }
}

// Longest decodable prefix of `bytes`. An incomplete trailing character stays
// buffered, invalid sequences are replaced.
fn take_text(bytes: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                out.push_str(s);
                bytes.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                match e.error_len() {
                    Some(bad) => {
                        out.push_str(&String::from_utf8_lossy(&bytes[..valid + bad]));
                        bytes.drain(..valid + bad);
                    }
                    None => {
                        out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                        bytes.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Chunks produced by [`CompletionCursor::exec_stream`].
///
/// Usable both as a blocking iterator and as a `futures::Stream`. As a stream
/// it runs one forward pass per poll and yields to the executor between
/// steps, so other tasks on the same thread (a canceller included) get to run.
pub struct ExecStream {
    cursor: CompletionCursor,
    cancel: Cancellable,
    remaining: usize,
    batch_size: usize,
    echo_prompt: bool,
    // progress of the batch being assembled
    generated: usize,
    is_eos: bool,
    deferred: Option<Error>,
    done: bool,
    _guard: BusyGuard,
}

enum Advance {
    Chunk(Result<StreamChunk>),
    Stepped,
    Finished,
}

impl ExecStream {
    pub fn cursor(&self) -> &CompletionCursor {
        &self.cursor
    }

    // Runs at most one forward pass.
    fn advance(&mut self) -> Advance {
        if let Some(e) = self.deferred.take() {
            self.done = true;
            return Advance::Chunk(Err(e));
        }
        if self.done {
            return Advance::Finished;
        }

        let inner = self.cursor.inner.clone();
        let mut state = inner.state.lock();

        if self.echo_prompt {
            if let Err(e) = self.cancel.check() {
                self.done = true;
                return Advance::Chunk(Err(e));
            }
            self.echo_prompt = false;
            state.prompt_echoed = true;
            self.done = self.remaining == 0;
            return Advance::Chunk(Ok(StreamChunk {
                text: inner.prompt_text.clone(),
                is_prompt: true,
                is_complete: self.done,
                is_eos: false,
            }));
        }

        if self.remaining > 0 {
            match self.cursor.step(&mut state, &self.cancel) {
                Ok(token) => {
                    self.generated += 1;
                    self.remaining -= 1;
                    if Some(token) == inner.model.dictionary().eos() {
                        self.is_eos = true;
                    } else if let Some(bytes) = inner.model.dictionary().token_bytes(token) {
                        state.pending.extend_from_slice(bytes);
                    }
                }
                Err(e) => {
                    if e.is_cancelled() {
                        debug!("completion cancelled at n_past {}", state.n_past);
                    }
                    if self.generated == 0 {
                        self.done = true;
                        return Advance::Chunk(Err(e));
                    }
                    // hand out what was generated, report the error on the next poll
                    self.deferred = Some(e);
                }
            }

            let batch_open = self.generated < self.batch_size && self.remaining > 0;
            if batch_open && !self.is_eos && self.deferred.is_none() {
                return Advance::Stepped;
            }
        }

        let text = take_text(&mut state.pending);
        let is_eos = std::mem::take(&mut self.is_eos);
        self.generated = 0;
        self.done = self.deferred.is_none() && (is_eos || self.remaining == 0);
        Advance::Chunk(Ok(StreamChunk {
            text,
            is_prompt: false,
            is_complete: self.done,
            is_eos,
        }))
    }
}

impl Iterator for ExecStream {
    type Item = Result<StreamChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.advance() {
                Advance::Chunk(chunk) => return Some(chunk),
                Advance::Stepped => continue,
                Advance::Finished => return None,
            }
        }
    }
}

impl Stream for ExecStream {
    type Item = Result<StreamChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().advance() {
            Advance::Chunk(chunk) => Poll::Ready(Some(chunk)),
            Advance::Finished => Poll::Ready(None),
            Advance::Stepped => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::testing::{tiny_model, tiny_model_with_vocab, TINY_VOCAB};
    use crate::core::tokenizer::END_OF_TEXT;
    use crate::core::{DType, FnSampler, SamplerConfig};

    const PROMPT: &str = "The meaning of life";

    fn model() -> Arc<LanguageModel> {
        Arc::new(tiny_model(DType::F32, 11))
    }

    fn seeded(model: &Arc<LanguageModel>) -> CompletionCursor {
        let sampler = SamplerConfig::TopKTopP {
            top_k: 8,
            top_p: 0.9,
            seed: Some(5),
        };
        CompletionCursor::new(model.clone(), PROMPT, 16, sampler.build()).unwrap()
    }

    #[test]
    fn test_first_exec_echoes_prompt() {
        let cursor = create_completion(model(), PROMPT, 16).unwrap();
        let (first, _) = cursor.exec(3, &Cancellable::new()).unwrap();
        assert!(first.starts_with(PROMPT));
        assert_eq!(cursor.n_past(), 4 + 2);

        let (second, _) = cursor.exec(1, &Cancellable::new()).unwrap();
        assert!(!second.starts_with(PROMPT));
        assert_eq!(cursor.n_past(), 7);
    }

    #[test]
    fn test_resumption_equivalence() {
        let model = model();
        for (a, b) in [(0, 4), (1, 3), (2, 2), (4, 0)] {
            let whole = create_completion(model.clone(), PROMPT, 16).unwrap();
            let (expected, _) = whole.exec(a + b, &Cancellable::new()).unwrap();

            let split = create_completion(model.clone(), PROMPT, 16).unwrap();
            let (head, _) = split.exec(a, &Cancellable::new()).unwrap();
            let (tail, _) = split.exec(b, &Cancellable::new()).unwrap();
            assert_eq!(format!("{}{}", head, tail), expected, "a={} b={}", a, b);
        }
    }

    #[test]
    fn test_resumption_equivalence_with_seeded_sampler() {
        let model = model();
        let (expected, _) = seeded(&model).exec(6, &Cancellable::new()).unwrap();

        let split = seeded(&model);
        let (head, _) = split.exec(2, &Cancellable::new()).unwrap();
        let (tail, _) = split.exec(4, &Cancellable::new()).unwrap();
        assert_eq!(head + &tail, expected);
    }

    #[test]
    fn test_stream_batches() {
        let cursor = create_completion(model(), PROMPT, 16).unwrap();
        let chunks: Vec<StreamChunk> = cursor
            .exec_stream(5, 2, &Cancellable::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(chunks.len(), 4);
        assert!(chunks[0].is_prompt);
        assert_eq!(chunks[0].text, PROMPT);
        assert!(chunks[1..].iter().all(|c| !c.is_prompt));
        assert!(chunks[..3].iter().all(|c| !c.is_complete));
        assert!(chunks[3].is_complete);
        assert_eq!(cursor.n_past(), 4 + 4);
    }

    #[test]
    fn test_stream_matches_exec() {
        let model = model();
        let streamed: String = create_completion(model.clone(), PROMPT, 16)
            .unwrap()
            .exec_stream(6, 4, &Cancellable::new())
            .unwrap()
            .map(|c| c.unwrap().text)
            .collect();
        let (whole, _) = create_completion(model, PROMPT, 16)
            .unwrap()
            .exec(6, &Cancellable::new())
            .unwrap();
        assert_eq!(streamed, whole);
    }

    #[test]
    fn test_cancel_between_chunks_keeps_cursor_usable() {
        let model = model();
        let (expected, _) = create_completion(model.clone(), PROMPT, 16)
            .unwrap()
            .exec(5, &Cancellable::new())
            .unwrap();

        let cursor = create_completion(model, PROMPT, 16).unwrap();
        let cancel = Cancellable::new();
        let mut stream = cursor.exec_stream(5, 1, &cancel).unwrap();
        let mut text = String::new();
        for _ in 0..3 {
            text.push_str(&stream.next().unwrap().unwrap().text);
        }
        cancel.cancel();
        assert!(stream.next().unwrap().unwrap_err().is_cancelled());
        assert!(stream.next().is_none());
        drop(stream);

        // prompt chunk plus two generated tokens
        assert_eq!(cursor.n_past(), 4 + 1);
        let (rest, _) = cursor.exec(3, &Cancellable::new()).unwrap();
        assert_eq!(text + &rest, expected);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cursor = create_completion(model(), PROMPT, 16).unwrap();
        let cancel = Cancellable::new();
        cancel.cancel();
        let err = cursor.exec(2, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(cursor.n_past(), 0);
    }

    #[test]
    fn test_busy() {
        let cursor = create_completion(model(), PROMPT, 16).unwrap();
        let stream = cursor.exec_stream(2, 1, &Cancellable::new()).unwrap();
        assert!(cursor.is_busy());
        assert!(matches!(cursor.exec(1, &Cancellable::new()), Err(Error::Busy)));
        drop(stream);
        assert!(!cursor.is_busy());
        assert!(cursor.exec(1, &Cancellable::new()).is_ok());
    }

    #[test]
    fn test_eos_stops_early() {
        let mut vocab = TINY_VOCAB.to_vec();
        vocab.push(END_OF_TEXT);
        let model = Arc::new(tiny_model_with_vocab(DType::F32, 11, &vocab));
        let eos = model.dictionary().eos().unwrap();
        let sampler = FnSampler(move |_: &[f32]| eos);
        let cursor = CompletionCursor::new(model, PROMPT, 16, Box::new(sampler)).unwrap();

        let chunks: Vec<StreamChunk> = cursor
            .exec_stream(10, 4, &Cancellable::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let last = chunks.last().unwrap();
        assert!(last.is_eos && last.is_complete);
        assert_eq!(last.text, "");
        assert_eq!(cursor.n_past(), 4);
    }

    #[test]
    fn test_context_overflow_is_surfaced() {
        let cursor = create_completion(model(), PROMPT, 6).unwrap();
        assert_eq!(cursor.capacity(), 6);
        let err = cursor.exec(5, &Cancellable::new()).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }), "{:?}", err);
        assert_eq!(cursor.n_past(), 6);
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        assert!(create_completion(model(), "", 16).is_err());
    }

    #[test]
    fn test_take_text_keeps_split_characters() {
        let mut bytes = "é".as_bytes()[..1].to_vec();
        assert_eq!(take_text(&mut bytes), "");
        bytes.push("é".as_bytes()[1]);
        assert_eq!(take_text(&mut bytes), "é");
        assert!(bytes.is_empty());

        let mut bad = vec![b'a', 0xff, b'b'];
        assert_eq!(take_text(&mut bad), "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_stream_and_async_exec() {
        let model = model();
        let cursor = create_completion(model.clone(), PROMPT, 16).unwrap();
        let mut stream = cursor.exec_stream(3, 3, &Cancellable::new()).unwrap();
        let mut text = String::new();
        while let Some(chunk) = futures::StreamExt::next(&mut stream).await {
            text.push_str(&chunk.unwrap().text);
        }

        let (expected, _) = create_completion(model, PROMPT, 16)
            .unwrap()
            .exec_async(3, &Cancellable::new())
            .await
            .unwrap();
        assert_eq!(text, expected);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_stream_yields_to_canceller_between_steps() {
        let cursor = create_completion(model(), PROMPT, 16).unwrap();
        let cancel = Cancellable::new();
        let canceller = cancel.clone();
        tokio::spawn(async move { canceller.cancel() });

        let mut stream = cursor.exec_stream(8, 8, &cancel).unwrap();
        let mut chunks = Vec::new();
        let mut cancelled = false;
        while let Some(item) = futures::StreamExt::next(&mut stream).await {
            match item {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => {
                    assert!(e.is_cancelled());
                    cancelled = true;
                }
            }
        }
        drop(stream);

        assert!(cancelled);
        assert!(chunks[0].is_prompt);
        assert!(chunks.iter().all(|c| !c.is_complete));
        // 4 prompt tokens plus 7 fed tokens if the batch had run to the end
        assert!(cursor.n_past() < 11);
    }
}
