use std::fmt;

use serde_json::json;
use thumbgen_contracts::events::EventWriter;

use crate::cancel::CancelToken;
use crate::error::GenerationError;

/// Lifecycle of a single generation call. Stages only move forward;
/// `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationStage {
    Idle,
    Encoding,
    AwaitingModelResponse,
    Parsing,
    Assembling,
    Done,
    Failed,
}

impl GenerationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Encoding => "encoding",
            Self::AwaitingModelResponse => "awaiting_model_response",
            Self::Parsing => "parsing",
            Self::Assembling => "assembling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn order(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Encoding => 1,
            Self::AwaitingModelResponse => 2,
            Self::Parsing => 3,
            Self::Assembling => 4,
            Self::Done | Self::Failed => 5,
        }
    }
}

impl fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct StageTracker<'a> {
    stage: GenerationStage,
    history: Vec<GenerationStage>,
    cancel: &'a CancelToken,
    events: Option<&'a EventWriter>,
}

impl<'a> StageTracker<'a> {
    pub fn new(cancel: &'a CancelToken, events: Option<&'a EventWriter>) -> Self {
        Self {
            stage: GenerationStage::Idle,
            history: vec![GenerationStage::Idle],
            cancel,
            events,
        }
    }

    pub fn stage(&self) -> GenerationStage {
        self.stage
    }

    pub fn history(&self) -> &[GenerationStage] {
        &self.history
    }

    /// Errors with `Cancelled` if the token fired while in the current stage.
    pub fn checkpoint(&self) -> Result<(), GenerationError> {
        if self.cancel.is_cancelled() {
            return Err(GenerationError::Cancelled { stage: self.stage });
        }
        Ok(())
    }

    pub fn advance(&mut self, next: GenerationStage) -> Result<(), GenerationError> {
        self.checkpoint()?;
        if self.stage.is_terminal()
            || next == GenerationStage::Failed
            || next.order() <= self.stage.order()
        {
            return Err(GenerationError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.transition(next)
    }

    /// Moves to `Failed` and returns the stage the failure happened in.
    /// Event log errors are ignored here since a failure is already being reported.
    pub fn fail(&mut self) -> GenerationStage {
        let failed_in = self.stage;
        if self.stage != GenerationStage::Failed {
            let _ = self.transition(GenerationStage::Failed);
        }
        failed_in
    }

    fn transition(&mut self, next: GenerationStage) -> Result<(), GenerationError> {
        let previous = self.stage;
        self.stage = next;
        self.history.push(next);
        if let Some(events) = self.events {
            events
                .emit_value(
                    "stage_changed",
                    json!({ "from": previous.as_str(), "to": next.as_str() }),
                )
                .map_err(|err| GenerationError::EventLog(format!("{err:#}")))?;
        }
        Ok(())
    }
}
