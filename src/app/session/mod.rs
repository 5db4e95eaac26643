pub mod cursors;

pub use cursors::{CursorManager, CursorRetention};

use crate::core::Cancellable;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Editing,
    Predicting,
    AwaitingAccept,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The caret moved forward. `text` is the buffer content before the caret.
    CaretForward { text: String, at_end: bool },
    CaretBackward,
    Edited,
    ModelChanged,
    Fragment { id: u64, text: String },
    Finished { id: u64 },
    Cancelled { id: u64 },
    Failed { id: u64, message: String },
}

/// Side effects requested by [`Session::handle`]. Offsets and lengths count chars.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    StartPrediction { id: u64, prompt: String, cancel: Cancellable },
    CancelPrediction(Cancellable),
    /// Append `text` to the displayed candidate.
    ShowCandidate(String),
    CommitCandidate { offset: usize, text: String },
    DiscardCandidate { offset: usize, len: usize },
    InvalidateCursor,
}

/// Editor-side prediction state, free of any presentation concerns.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    prediction_id: u64,
    candidate_offset: usize,
    candidate: String,
    cancel: Option<Cancellable>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Editing,
            prediction_id: 0,
            candidate_offset: 0,
            candidate: String::new(),
            cancel: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn candidate_offset(&self) -> usize {
        self.candidate_offset
    }

    pub fn prediction_id(&self) -> u64 {
        self.prediction_id
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionCommand> {
        use SessionEvent::*;
        use SessionState::*;

        match (self.state, event) {
            (Editing, CaretForward { text, at_end: true }) => {
                self.prediction_id += 1;
                let cancel = Cancellable::new();
                self.cancel = Some(cancel.clone());
                self.candidate_offset = text.chars().count();
                self.candidate.clear();
                self.state = Predicting;
                debug!("starting prediction {} at {}", self.prediction_id, self.candidate_offset);
                vec![SessionCommand::StartPrediction {
                    id: self.prediction_id,
                    prompt: text,
                    cancel,
                }]
            }
            (AwaitingAccept, CaretForward { .. }) => {
                self.state = Editing;
                let text = std::mem::take(&mut self.candidate);
                vec![SessionCommand::CommitCandidate {
                    offset: self.candidate_offset,
                    text,
                }]
            }
            (Predicting, CaretBackward | Edited | ModelChanged) => {
                let mut commands = Vec::new();
                if let Some(cancel) = self.cancel.take() {
                    commands.push(SessionCommand::CancelPrediction(cancel));
                }
                commands.extend(self.reject());
                commands
            }
            (AwaitingAccept, CaretBackward | Edited | ModelChanged) => self.reject(),
            (Editing, Edited | ModelChanged) => vec![SessionCommand::InvalidateCursor],
            (Predicting, Fragment { id, text }) if id == self.prediction_id => {
                self.candidate.push_str(&text);
                vec![SessionCommand::ShowCandidate(text)]
            }
            (Predicting, Finished { id }) if id == self.prediction_id => {
                self.cancel = None;
                if self.candidate.is_empty() {
                    self.state = Editing;
                } else {
                    self.state = AwaitingAccept;
                }
                Vec::new()
            }
            (Predicting, Cancelled { id }) if id == self.prediction_id => {
                self.cancel = None;
                self.reject()
            }
            (Predicting, Failed { id, message }) if id == self.prediction_id => {
                warn!("prediction {} failed: {}", id, message);
                self.cancel = None;
                self.reject()
            }
            (state, event) => {
                debug!("ignoring {:?} while {:?}", event, state);
                Vec::new()
            }
        }
    }

    fn reject(&mut self) -> Vec<SessionCommand> {
        self.state = SessionState::Editing;
        let len = self.candidate.chars().count();
        self.candidate.clear();

        let mut commands = Vec::new();
        if len > 0 {
            commands.push(SessionCommand::DiscardCandidate {
                offset: self.candidate_offset,
                len,
            });
        }
        commands.push(SessionCommand::InvalidateCursor);
        commands
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the prediction asked for by a `StartPrediction` command and reports
/// its progress back as session events.
pub async fn drive_prediction(
    manager: &CursorManager,
    id: u64,
    prompt: String,
    cancel: Cancellable,
    n_tokens: usize,
    batch_size: usize,
    events: UnboundedSender<SessionEvent>,
) {
    let fragments = events.clone();
    let result = manager
        .predict(&prompt, n_tokens, batch_size, &cancel, move |chunk| {
            let _ = fragments.send(SessionEvent::Fragment { id, text: chunk.text });
        })
        .await;

    let event = match result {
        Ok(_) => SessionEvent::Finished { id },
        Err(e) if e.is_cancelled() => SessionEvent::Cancelled { id },
        Err(e) => SessionEvent::Failed {
            id,
            message: e.to_string(),
        },
    };
    let _ = events.send(event);
}
