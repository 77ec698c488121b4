use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use voxrag_core::config::{Config, LoggingConfig};
use voxrag_core::types::{SearchOptions, VoiceOptions};
use voxrag_media::ingest::AudioInput;
use voxrag_media::tts::{AzureSpeechSynthesizer, SpeechSynthesizer, popular_voices};
use voxrag_pipeline::{Pipeline, ResponseStatus, RunReport};

#[derive(Parser)]
#[command(
    name = "voxrag",
    about = "Ask questions of your documents by voice: speech in, grounded answer out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Wrap output with run metadata (state, timings, cleanup)
    #[arg(long, global = true)]
    report: bool,
}

#[derive(clap::Args, Clone, Default)]
struct VoiceArgs {
    /// Voice name, e.g. en-US-JennyNeural
    #[arg(long)]
    voice: Option<String>,
    /// Speaking rate (x-slow..x-fast or a percentage)
    #[arg(long)]
    rate: Option<String>,
    /// Pitch (x-low..x-high or a percentage)
    #[arg(long)]
    pitch: Option<String>,
    /// Volume (silent..x-loud or a percentage)
    #[arg(long)]
    volume: Option<String>,
}

impl From<VoiceArgs> for VoiceOptions {
    fn from(args: VoiceArgs) -> Self {
        Self {
            voice: args.voice,
            rate: args.rate,
            pitch: args.pitch,
            volume: args.volume,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a typed question against the document index
    Ask {
        question: String,

        /// Number of documents to retrieve
        #[arg(long)]
        top_k: Option<usize>,

        /// OData filter applied to the search
        #[arg(long)]
        filter: Option<String>,
    },

    /// Ask a spoken question and get a spoken answer
    Voice {
        /// Recorded question (wav, mp3, m4a, ogg, webm, ...)
        file: PathBuf,

        /// Write the spoken answer here
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        voice: VoiceArgs,
    },

    /// Ask a spoken question and get a text answer
    VoiceText { file: PathBuf },

    /// Transcribe an audio file
    Transcribe { file: PathBuf },

    /// Synthesize speech from text or an SSML document
    Speak {
        /// Text to speak
        #[arg(required_unless_present = "ssml", conflicts_with = "ssml")]
        text: Option<String>,

        /// Path to an SSML document
        #[arg(long)]
        ssml: Option<PathBuf>,

        /// Write the audio here
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        voice: VoiceArgs,
    },

    /// List available synthesis voices
    Voices {
        /// Include every locale, not just English neural voices
        #[arg(long)]
        all: bool,
    },

    /// Check connectivity to search, completion, and synthesis
    Health,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration with secrets masked
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let mut directives = vec![level];
    if let Some(l) = logging {
        directives.extend(l.filters.iter().cloned());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives.join(",")));
    let json = logging.is_some_and(|l| l.format.eq_ignore_ascii_case("json"));
    let to_stdout = logging.is_some_and(|l| l.output.eq_ignore_ascii_case("stdout"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, to_stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Read a user's audio file into memory so the run never deletes the original.
async fn read_audio(path: &Path) -> anyhow::Result<AudioInput> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Cannot read audio file {}", path.display()))?;
    Ok(AudioInput::Bytes {
        data,
        filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
        mimetype: None,
    })
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a run's response body and translate its status into an exit code.
fn emit<T: serde::Serialize + ResponseStatus>(
    report: &RunReport<T>,
    with_report: bool,
) -> anyhow::Result<ExitCode> {
    let body = report.body();
    if with_report {
        print_json(&json!({
            "runId": report.run_id,
            "state": report.state,
            "history": report.history,
            "status": report.http_status(),
            "timings": report.timings,
            "cleanedFiles": report.cleaned_files,
            "errors": report.errors,
            "startedAt": report.started_at,
            "response": body,
        }))?;
    } else {
        print_json(&body)?;
    }
    Ok(if report.http_status() == 200 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn write_audio(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Cannot write audio to {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "audio_written");
    Ok(())
}

/// Replace every `api_key` value with a mask.
fn mask_secrets(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key == "api_key" && v.is_string() {
                    *v = json!("********");
                } else {
                    mask_secrets(v);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_logging(config.logging.as_ref(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "config_loaded");

    match cli.command {
        Commands::Ask {
            question,
            top_k,
            filter,
        } => {
            let pipeline = Pipeline::from_config(&config)?;
            let defaults = pipeline.settings().search.clone();
            let search = SearchOptions {
                top_k: top_k.unwrap_or(defaults.top_k),
                filter: filter.or(defaults.filter.clone()),
                ..defaults
            };
            let report = pipeline.text_query_with(&question, &search).await;
            emit(&report, cli.report)
        }
        Commands::Voice { file, out, voice } => {
            let pipeline = Pipeline::from_config(&config)?;
            let input = read_audio(&file).await?;
            let report = pipeline.voice_query(input, &voice.into()).await;
            if let (Some(out), Ok(outcome)) = (&out, &report.result) {
                if let Some(speech) = outcome.answered().and_then(|a| a.speech.as_ref()) {
                    write_audio(out, &speech.bytes).await?;
                }
            }
            emit(&report, cli.report)
        }
        Commands::VoiceText { file } => {
            let pipeline = Pipeline::from_config(&config)?;
            let report = pipeline.voice_to_text(read_audio(&file).await?).await;
            emit(&report, cli.report)
        }
        Commands::Transcribe { file } => {
            let pipeline = Pipeline::from_config(&config)?;
            let report = pipeline.transcribe(read_audio(&file).await?).await;
            emit(&report, cli.report)
        }
        Commands::Speak {
            text,
            ssml,
            out,
            voice,
        } => {
            let pipeline = Pipeline::from_config(&config)?;
            let report = match ssml {
                Some(path) => {
                    let document = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Cannot read SSML from {}", path.display()))?;
                    pipeline.synthesize_ssml(&document).await
                }
                None => {
                    let text = text.unwrap_or_default();
                    pipeline.synthesize(&text, &voice.into()).await
                }
            };
            if let (Some(out), Ok(speech)) = (&out, &report.result) {
                write_audio(out, &speech.bytes).await?;
            }
            emit(&report, cli.report)
        }
        Commands::Voices { all } => {
            let synthesizer = AzureSpeechSynthesizer::from_config(&config)?;
            let voices = synthesizer.list_voices().await?;
            let voices = if all { voices } else { popular_voices(&voices) };
            print_json(&json!({
                "defaultVoice": synthesizer.default_voice(),
                "count": voices.len(),
                "voices": voices,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            let pipeline = Pipeline::from_config(&config)?;
            let (search, completion, voices) = tokio::join!(
                pipeline.retriever().index_health(),
                pipeline.generator().health_check(),
                pipeline.synthesizer().list_voices(),
            );
            let synthesis = match voices {
                Ok(v) => json!({ "healthy": true, "voices": v.len() }),
                Err(e) => json!({ "healthy": false, "error": e.to_string() }),
            };
            let healthy = search.healthy && completion.healthy && synthesis["healthy"] == true;
            print_json(&json!({
                "status": if healthy { "healthy" } else { "degraded" },
                "search": search,
                "completion": completion,
                "synthesis": synthesis,
            }))?;
            Ok(if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let mut value = serde_json::to_value(&config)?;
                mask_secrets(&mut value);
                print_json(&value)?;
                Ok(ExitCode::SUCCESS)
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(mut value) => {
                    mask_secrets(&mut value);
                    print_json(&value)?;
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    tracing::warn!(key = %key, "config key not set");
                    Ok(ExitCode::FAILURE)
                }
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    tracing::warn!("{w}");
                }
                for e in &errors {
                    tracing::error!("{e}");
                }
                print_json(&json!({
                    "path": config_path.display().to_string(),
                    "valid": errors.is_empty(),
                    "warnings": warnings,
                    "errors": errors,
                }))?;
                Ok(if errors.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_voice_options() {
        let cli = Cli::try_parse_from([
            "voxrag", "voice", "q.wav", "--out", "a.mp3", "--voice", "en-US-GuyNeural", "--rate",
            "fast",
        ])
        .unwrap();
        match cli.command {
            Commands::Voice { file, out, voice } => {
                assert_eq!(file, PathBuf::from("q.wav"));
                assert_eq!(out, Some(PathBuf::from("a.mp3")));
                let options = VoiceOptions::from(voice);
                assert_eq!(options.voice.as_deref(), Some("en-US-GuyNeural"));
                assert_eq!(options.rate_or_default(), "fast");
                assert_eq!(options.pitch_or_default(), "medium");
            }
            _ => panic!("expected voice command"),
        }
    }

    #[test]
    fn test_speak_requires_text_or_ssml() {
        assert!(Cli::try_parse_from(["voxrag", "speak"]).is_err());
        assert!(Cli::try_parse_from(["voxrag", "speak", "--ssml", "doc.xml"]).is_ok());
        assert!(Cli::try_parse_from(["voxrag", "speak", "hi", "--ssml", "doc.xml"]).is_err());
    }

    #[test]
    fn test_mask_secrets_nested() {
        let mut value = json!({
            "speech": { "api_key": "secret", "region": "eastus" },
            "completion": { "api_key_env": "AZURE_OPENAI_API_KEY" },
        });
        mask_secrets(&mut value);
        assert_eq!(value["speech"]["api_key"], "********");
        assert_eq!(value["speech"]["region"], "eastus");
        assert_eq!(value["completion"]["api_key_env"], "AZURE_OPENAI_API_KEY");
    }
}
