//! Per-request run state, stage timings, and the final report.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxrag_core::error::PipelineError;
use voxrag_core::temp::TempResourceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Rejected,
    Transcribing,
    NoSpeech,
    Transcribed,
    TranscriptionFailed,
    Retrieving,
    Generating,
    GenerationFailed,
    Generated,
    Synthesizing,
    SynthesisFailed,
    Completed,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Created, Transcribing | Retrieving | Synthesizing | Rejected)
                | (Transcribing, NoSpeech | Transcribed | TranscriptionFailed)
                | (Transcribed, Retrieving | Completed)
                | (Retrieving, Generating)
                | (Generating, Generated | GenerationFailed)
                | (Generated, Synthesizing | Completed)
                | (Synthesizing, Completed | SynthesisFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        use RunState::*;
        matches!(
            self,
            Rejected | NoSpeech | TranscriptionFailed | GenerationFailed | SynthesisFailed | Completed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcription,
    Retrieval,
    Generation,
    Synthesis,
}

/// Milliseconds spent per stage. Stages that did not run stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_ms: Option<u64>,
    pub total_ms: u64,
}

/// Responses decide their own HTTP status when they succeed.
pub trait ResponseStatus {
    fn http_status(&self) -> u16 {
        200
    }
}

/// One request moving through the pipeline.
pub struct PipelineRun {
    id: Uuid,
    state: RunState,
    history: Vec<RunState>,
    timings: StageTimings,
    errors: Vec<String>,
    temps: TempResourceManager,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(temp_dir: &Path) -> Self {
        let id = Uuid::new_v4();
        let run_tag = id.simple().to_string();
        debug!(run_id = %id, "run_created");
        Self {
            id,
            state: RunState::Created,
            history: vec![RunState::Created],
            timings: StageTimings::default(),
            errors: Vec::new(),
            temps: TempResourceManager::new(temp_dir, &run_tag),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn temps(&self) -> &TempResourceManager {
        &self.temps
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_advance_to(next) {
            let err = PipelineError::Internal(format!(
                "invalid run transition {:?} -> {next:?}",
                self.state
            ));
            self.errors.push(err.to_string());
            return Err(err);
        }
        debug!(run_id = %self.id, from = ?self.state, to = ?next, "run_transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to a failure state and hand the error back for returning.
    pub fn fail(&mut self, terminal: RunState, err: PipelineError) -> PipelineError {
        warn!(run_id = %self.id, state = ?self.state, code = err.code(), error = %err, "stage_failed");
        self.errors.push(err.to_string());
        if let Err(transition) = self.advance(terminal) {
            warn!(run_id = %self.id, error = %transition, "failure_transition_rejected");
        }
        err
    }

    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        let ms = Some(elapsed.as_millis() as u64);
        match stage {
            Stage::Transcription => self.timings.transcription_ms = ms,
            Stage::Retrieval => self.timings.retrieval_ms = ms,
            Stage::Generation => self.timings.generation_ms = ms,
            Stage::Synthesis => self.timings.synthesis_ms = ms,
        }
    }

    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Drain every temp file and seal the run into a report.
    pub async fn finish<T>(mut self, result: Result<T, PipelineError>) -> RunReport<T> {
        let cleaned_files = self.temps.drain().await;
        self.timings.total_ms = self.started.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            // errors raised with `?` never passed through `fail`
            let message = e.to_string();
            if !self.errors.contains(&message) {
                self.errors.push(message);
            }
        }
        info!(
            run_id = %self.id,
            state = ?self.state,
            cleaned_files,
            total_ms = self.timings.total_ms,
            ok = result.is_ok(),
            "run_finished"
        );
        RunReport {
            run_id: self.id,
            state: self.state,
            history: std::mem::take(&mut self.history),
            timings: self.timings,
            errors: std::mem::take(&mut self.errors),
            cleaned_files,
            started_at: self.started_at,
            result,
        }
    }
}

/// Everything the caller needs after a run: outcome, path taken, and cost.
#[derive(Debug)]
pub struct RunReport<T> {
    pub run_id: Uuid,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub timings: StageTimings,
    pub errors: Vec<String>,
    pub cleaned_files: usize,
    pub started_at: DateTime<Utc>,
    pub result: Result<T, PipelineError>,
}

impl<T: ResponseStatus> RunReport<T> {
    pub fn http_status(&self) -> u16 {
        match &self.result {
            Ok(body) => body.http_status(),
            Err(e) => e.http_status(),
        }
    }
}

impl<T> RunReport<T> {
    pub fn visited(&self, state: RunState) -> bool {
        self.history.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_round_trip_path_is_valid() {
        use RunState::*;
        let path = [
            Created,
            Transcribing,
            Transcribed,
            Retrieving,
            Generating,
            Generated,
            Synthesizing,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        use RunState::*;
        assert!(!Transcribing.can_advance_to(Retrieving));
        assert!(!NoSpeech.can_advance_to(Retrieving));
        assert!(!Retrieving.can_advance_to(Synthesizing));
        assert!(!GenerationFailed.can_advance_to(Synthesizing));
        assert!(!Completed.can_advance_to(Created));
        assert!(!Created.can_advance_to(Generating));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use RunState::*;
        let all = [
            Created,
            Rejected,
            Transcribing,
            NoSpeech,
            Transcribed,
            TranscriptionFailed,
            Retrieving,
            Generating,
            GenerationFailed,
            Generated,
            Synthesizing,
            SynthesisFailed,
            Completed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|to| !from.can_advance_to(*to)), "{from:?} has an exit");
        }
    }

    #[tokio::test]
    async fn test_invalid_advance_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = PipelineRun::new(dir.path());
        let err = run.advance(RunState::Generating).unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert_eq!(run.state(), RunState::Created);
    }

    #[tokio::test]
    async fn test_finish_drains_and_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = PipelineRun::new(dir.path());
        run.temps().write("upload", "wav", b"x").await.unwrap();
        run.advance(RunState::Retrieving).unwrap();
        run.advance(RunState::Generating).unwrap();
        let err = run.fail(
            RunState::GenerationFailed,
            PipelineError::ProviderRateLimited {
                service: "completion".into(),
            },
        );
        let report: RunReport<()> = run.finish(Err(err)).await;
        assert_eq!(report.state, RunState::GenerationFailed);
        assert_eq!(report.cleaned_files, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.visited(RunState::Generating));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_timings_serialize_camel_case() {
        let timings = StageTimings {
            retrieval_ms: Some(12),
            total_ms: 40,
            ..StageTimings::default()
        };
        let json = serde_json::to_value(timings).unwrap();
        assert_eq!(json["retrievalMs"], 12);
        assert_eq!(json["totalMs"], 40);
        assert!(json.get("synthesisMs").is_none());
    }
}
