//! Pipeline orchestrator: one entry point per request variant.
//!
//! Every entry point creates a [`PipelineRun`], drives the stages it needs,
//! and always finishes the run, so temp files are drained on success, on
//! error, and on early stops like no-speech.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use voxrag_core::config::Config;
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::types::{
    CancellationReason, GenerationOptions, SearchOptions, TranscriptionResult,
    TranscriptionStatus, VoiceOptions,
};
use voxrag_media::ingest::{AudioInput, ingest};
use voxrag_media::normalize::FormatNormalizer;
use voxrag_media::stt::{Transcriber, recognizer_from_config};
use voxrag_media::tts::{AzureSpeechSynthesizer, SpeechSynthesizer};
use voxrag_providers::{AnswerGenerator, AzureSearchBackend, ChatCompletionGenerator, Retriever};

use crate::prompt::{PromptLimits, build_rag_prompt};
use crate::response::{
    QueryTiming, SynthesisResponse, TextAnswer, TranscriptionResponse, VoiceAnswer, VoiceOutcome,
};
use crate::run::{PipelineRun, RunReport, RunState, Stage};

/// Tunables shared by every run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub search: SearchOptions,
    pub generation: GenerationOptions,
    pub prompt: PromptLimits,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            temp_dir: voxrag_core::temp::default_temp_dir(),
            max_upload_bytes: 25 * 1024 * 1024,
            search: SearchOptions::default(),
            generation: GenerationOptions::default(),
            prompt: PromptLimits::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let search = config.search_options();
        Self {
            temp_dir: config.temp_dir(),
            max_upload_bytes: config.max_upload_bytes(),
            prompt: PromptLimits {
                max_documents: search.top_k,
                max_context_chars: config.max_context_chars(),
            },
            search,
            generation: config.generation_options(),
        }
    }
}

/// What the answer stage produced.
struct Answered {
    text: String,
    documents_found: usize,
    usage: Option<voxrag_core::types::TokenUsage>,
    model: Option<String>,
}

#[derive(Clone)]
pub struct Pipeline {
    transcriber: Transcriber,
    retriever: Retriever,
    generator: Arc<dyn AnswerGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        transcriber: Transcriber,
        retriever: Retriever,
        generator: Arc<dyn AnswerGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcriber,
            retriever,
            generator,
            synthesizer,
            settings,
        }
    }

    /// Wire the production backends from configuration.
    ///
    /// A missing search configuration leaves retrieval disabled; every other
    /// backend is required.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transcriber = Transcriber::new(
            FormatNormalizer::from_config(config),
            recognizer_from_config(config)?,
        );
        let retriever = match AzureSearchBackend::from_config(config) {
            Ok(backend) => Retriever::new(Arc::new(backend)),
            Err(e) => {
                warn!(error = %e, "search not configured, answers will use general knowledge");
                Retriever::disabled()
            }
        };
        let generator = Arc::new(ChatCompletionGenerator::from_config(config)?);
        let synthesizer = Arc::new(AzureSpeechSynthesizer::from_config(config)?);
        Ok(Self::new(
            transcriber,
            retriever,
            generator,
            synthesizer,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn generator(&self) -> &Arc<dyn AnswerGenerator> {
        &self.generator
    }

    pub fn synthesizer(&self) -> &Arc<dyn SpeechSynthesizer> {
        &self.synthesizer
    }

    /// Spoken question in, spoken answer out.
    pub async fn voice_query(
        &self,
        input: AudioInput,
        voice: &VoiceOptions,
    ) -> RunReport<VoiceOutcome<VoiceAnswer>> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_voice(&mut run, input, Some(voice)).await;
        run.finish(result).await
    }

    /// Spoken question in, text answer out.
    pub async fn voice_to_text(&self, input: AudioInput) -> RunReport<VoiceOutcome<VoiceAnswer>> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_voice(&mut run, input, None).await;
        run.finish(result).await
    }

    pub async fn text_query(&self, question: &str) -> RunReport<TextAnswer> {
        let search = self.settings.search.clone();
        self.text_query_with(question, &search).await
    }

    /// Typed question with per-call search options.
    pub async fn text_query_with(
        &self,
        question: &str,
        search: &SearchOptions,
    ) -> RunReport<TextAnswer> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_text(&mut run, question, search).await;
        run.finish(result).await
    }

    /// Transcription only. Silence is a successful, empty transcript here.
    pub async fn transcribe(&self, input: AudioInput) -> RunReport<TranscriptionResponse> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_transcribe(&mut run, input).await;
        run.finish(result).await
    }

    pub async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> RunReport<SynthesisResponse> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_synthesis(&mut run, SynthesisInput::Text(text, voice)).await;
        run.finish(result).await
    }

    pub async fn synthesize_ssml(&self, ssml: &str) -> RunReport<SynthesisResponse> {
        let mut run = PipelineRun::new(&self.settings.temp_dir);
        let result = self.drive_synthesis(&mut run, SynthesisInput::Ssml(ssml)).await;
        run.finish(result).await
    }

    async fn drive_voice(
        &self,
        run: &mut PipelineRun,
        input: AudioInput,
        voice: Option<&VoiceOptions>,
    ) -> Result<VoiceOutcome<VoiceAnswer>> {
        let transcription = self.listen(run, input).await?;
        if transcription.status == TranscriptionStatus::NoSpeech {
            return Ok(VoiceOutcome::no_speech(&transcription));
        }

        let question = transcription.text.trim().to_string();
        info!(run_id = %run.id(), question = %question, "question_transcribed");
        let search = self.settings.search.clone();
        let answered = self.answer(run, &question, &search).await?;
        let answer = VoiceAnswer::new(question, answered.text, answered.documents_found);

        let Some(voice) = voice else {
            run.advance(RunState::Completed)?;
            return Ok(VoiceOutcome::Answered(answer));
        };

        run.advance(RunState::Synthesizing)?;
        let started = Instant::now();
        let rendered = self
            .synthesizer
            .synthesize(&answer.answer, voice, run.temps())
            .await;
        let speech = match rendered {
            Ok(speech) => speech,
            Err(e) => return Err(run.fail(RunState::SynthesisFailed, e)),
        };
        run.record(Stage::Synthesis, started.elapsed());
        run.advance(RunState::Completed)?;
        Ok(VoiceOutcome::Answered(answer.with_speech(speech)))
    }

    async fn drive_text(
        &self,
        run: &mut PipelineRun,
        question: &str,
        search: &SearchOptions,
    ) -> Result<TextAnswer> {
        let question = question.trim();
        if question.is_empty() {
            return Err(run.fail(
                RunState::Rejected,
                PipelineError::Input("Query text is required".into()),
            ));
        }
        let answered = self.answer(run, question, search).await?;
        run.advance(RunState::Completed)?;
        let timings = run.timings();
        Ok(TextAnswer {
            answer: answered.text,
            documents_found: answered.documents_found,
            timing: QueryTiming {
                search_time: timings.retrieval_ms.unwrap_or(0),
                completion_time: timings.generation_ms.unwrap_or(0),
                total_time: run.elapsed().as_millis() as u64,
            },
            usage: answered.usage,
            model: answered.model,
        })
    }

    async fn drive_transcribe(
        &self,
        run: &mut PipelineRun,
        input: AudioInput,
    ) -> Result<TranscriptionResponse> {
        let transcription = self.listen(run, input).await?;
        if run.state() == RunState::Transcribed {
            run.advance(RunState::Completed)?;
        }
        Ok(TranscriptionResponse::from(&transcription))
    }

    async fn drive_synthesis(
        &self,
        run: &mut PipelineRun,
        input: SynthesisInput<'_>,
    ) -> Result<SynthesisResponse> {
        let blank = match input {
            SynthesisInput::Text(text, _) => text.trim().is_empty(),
            SynthesisInput::Ssml(ssml) => ssml.trim().is_empty(),
        };
        if blank {
            return Err(run.fail(
                RunState::Rejected,
                PipelineError::Input("Text is required for speech synthesis".into()),
            ));
        }

        run.advance(RunState::Synthesizing)?;
        let started = Instant::now();
        let rendered = match input {
            SynthesisInput::Text(text, voice) => {
                self.synthesizer.synthesize(text, voice, run.temps()).await
            }
            SynthesisInput::Ssml(ssml) => self.synthesizer.synthesize_ssml(ssml, run.temps()).await,
        };
        let speech = match rendered {
            Ok(speech) => speech,
            Err(e) => return Err(run.fail(RunState::SynthesisFailed, e)),
        };
        run.record(Stage::Synthesis, started.elapsed());
        run.advance(RunState::Completed)?;
        Ok(SynthesisResponse::from(speech))
    }

    /// Ingest and transcribe. Leaves the run in `Transcribed` or `NoSpeech`.
    async fn listen(&self, run: &mut PipelineRun, input: AudioInput) -> Result<TranscriptionResult> {
        let ingested = ingest(input, run.temps(), self.settings.max_upload_bytes).await;
        let asset = match ingested {
            Ok(asset) => asset,
            Err(e) => return Err(run.fail(RunState::Rejected, e)),
        };

        run.advance(RunState::Transcribing)?;
        let started = Instant::now();
        let outcome = self.transcriber.transcribe(&asset, run.temps()).await;
        run.record(Stage::Transcription, started.elapsed());
        let transcription = match outcome {
            Ok(t) => t,
            Err(e) => return Err(run.fail(RunState::TranscriptionFailed, e)),
        };

        match transcription.status.clone() {
            TranscriptionStatus::Recognized if !transcription.is_blank() => {
                run.advance(RunState::Transcribed)?;
                Ok(transcription)
            }
            TranscriptionStatus::Recognized | TranscriptionStatus::NoSpeech => {
                info!(run_id = %run.id(), "no_speech_detected");
                run.advance(RunState::NoSpeech)?;
                Ok(TranscriptionResult::no_speech())
            }
            TranscriptionStatus::Canceled { reason, details } => {
                let err = cancellation_error(reason, &details, self.transcriber.recognizer_name());
                Err(run.fail(RunState::TranscriptionFailed, err))
            }
            TranscriptionStatus::Error { details } => Err(run.fail(
                RunState::TranscriptionFailed,
                PipelineError::Recognition(details),
            )),
        }
    }

    /// Retrieve, assemble the prompt, generate. Leaves the run in `Generated`.
    async fn answer(
        &self,
        run: &mut PipelineRun,
        question: &str,
        search: &SearchOptions,
    ) -> Result<Answered> {
        run.advance(RunState::Retrieving)?;
        let started = Instant::now();
        let documents = self.retriever.retrieve(question, search).await;
        run.record(Stage::Retrieval, started.elapsed());

        let limits = PromptLimits {
            max_documents: search.top_k,
            ..self.settings.prompt
        };
        let prompt = build_rag_prompt(question, &documents, &limits);
        info!(
            run_id = %run.id(),
            documents = documents.len(),
            documents_used = prompt.documents_used,
            fallback = prompt.fallback,
            "prompt_built"
        );

        run.advance(RunState::Generating)?;
        let outcome = self
            .generator
            .generate(&prompt.text, &self.settings.generation)
            .await;
        let generated = match outcome {
            Ok(answer) => answer,
            Err(e) => return Err(run.fail(RunState::GenerationFailed, e)),
        };
        run.record(Stage::Generation, generated.duration);
        run.advance(RunState::Generated)?;

        Ok(Answered {
            text: generated.text,
            documents_found: documents.len(),
            usage: generated.usage,
            model: generated.model,
        })
    }
}

#[derive(Clone, Copy)]
enum SynthesisInput<'a> {
    Text(&'a str, &'a VoiceOptions),
    Ssml(&'a str),
}

fn cancellation_error(reason: CancellationReason, details: &str, service: &str) -> PipelineError {
    let service = service.to_string();
    match reason {
        CancellationReason::Auth => PipelineError::ProviderAuth { service },
        CancellationReason::Quota => PipelineError::ProviderRateLimited { service },
        CancellationReason::Network => PipelineError::ProviderTimeout { service },
        CancellationReason::Other => PipelineError::Recognition(details.to_string()),
    }
}
