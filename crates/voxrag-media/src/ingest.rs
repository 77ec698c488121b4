//! Turning caller-supplied audio into a tracked [`AudioAsset`].

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncReadExt;
use tracing::debug;

use voxrag_core::error::{PipelineError, Result};
use voxrag_core::temp::TempResourceManager;
use voxrag_core::types::{AudioAsset, AudioFormat, SUPPORTED_EXTENSIONS};

/// Audio as it arrives from a caller.
#[derive(Debug, Clone)]
pub enum AudioInput {
    /// A file already on disk that the run now owns and will delete.
    Upload {
        path: PathBuf,
        mimetype: Option<String>,
    },
    /// In-memory bytes, e.g. read from a user file the run must not touch.
    Bytes {
        data: Vec<u8>,
        filename: Option<String>,
        mimetype: Option<String>,
    },
    /// Base64 text, with an optional format hint such as "mp3" or "audio/webm".
    Base64 {
        data: String,
        format: Option<String>,
    },
}

const SNIFF_LEN: usize = 16;

/// Validate `input` and register it with `temps`.
///
/// Uploads are adopted before validation so a rejected upload is still
/// removed when the run drains.
pub async fn ingest(
    input: AudioInput,
    temps: &TempResourceManager,
    max_bytes: u64,
) -> Result<AudioAsset> {
    match input {
        AudioInput::Upload { path, mimetype } => {
            temps.adopt(&path);
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| PipelineError::Input(format!("Cannot read uploaded audio: {e}")))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            check_allowed(&name, mimetype.as_deref())?;
            check_size(meta.len(), max_bytes)?;

            let mut header = [0u8; SNIFF_LEN];
            let mut file = tokio::fs::File::open(&path).await?;
            let n = file.read(&mut header).await?;
            let format = AudioFormat::detect(&header[..n], &path, mimetype.as_deref());
            debug!(path = %path.display(), ?format, size = meta.len(), "audio_ingested");
            Ok(AudioAsset {
                path,
                mimetype,
                size_bytes: meta.len(),
                format,
            })
        }
        AudioInput::Bytes {
            data,
            filename,
            mimetype,
        } => {
            let name = filename.unwrap_or_default();
            check_allowed(&name, mimetype.as_deref())?;
            store(&data, &name, mimetype, temps, max_bytes).await
        }
        AudioInput::Base64 { data, format } => {
            let bytes = BASE64
                .decode(strip_data_url(&data).trim())
                .map_err(|e| PipelineError::Input(format!("Invalid base64 audio: {e}")))?;
            let (name, mimetype) = match format {
                Some(f) if f.contains('/') => (String::new(), Some(f)),
                Some(f) => (format!("audio.{}", f.trim_start_matches('.')), None),
                None => (String::new(), None),
            };
            store(&bytes, &name, mimetype, temps, max_bytes).await
        }
    }
}

async fn store(
    data: &[u8],
    name: &str,
    mimetype: Option<String>,
    temps: &TempResourceManager,
    max_bytes: u64,
) -> Result<AudioAsset> {
    check_size(data.len() as u64, max_bytes)?;
    let hinted = std::path::Path::new(name);
    let format = AudioFormat::detect(&data[..data.len().min(SNIFF_LEN)], hinted, mimetype.as_deref());
    let path = temps.write("upload", format.extension(), data).await?;
    debug!(path = %path.display(), ?format, size = data.len(), "audio_ingested");
    Ok(AudioAsset {
        path,
        mimetype,
        size_bytes: data.len() as u64,
        format,
    })
}

/// Accept when either the mimetype is `audio/*` or the extension is known.
/// Inputs with neither hint are accepted and left to content sniffing.
fn check_allowed(name: &str, mimetype: Option<&str>) -> Result<()> {
    let ext = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let mime_ok = mimetype.is_some_and(|m| m.trim().to_ascii_lowercase().starts_with("audio/"));
    let ext_ok = ext
        .as_deref()
        .is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e));
    if mime_ok || ext_ok || (mimetype.is_none() && ext.is_none()) {
        return Ok(());
    }
    Err(PipelineError::Input(format!(
        "Unsupported audio format. Received: {} (.{}). Supported formats: WAV, MP3, M4A, AAC, OGG, FLAC, WebM, AMR, 3GP",
        mimetype.unwrap_or("unknown"),
        ext.unwrap_or_default()
    )))
}

fn check_size(size: u64, max_bytes: u64) -> Result<()> {
    if size == 0 {
        return Err(PipelineError::Input("Audio file is empty".into()));
    }
    if size > max_bytes {
        return Err(PipelineError::Input(format!(
            "Audio file must be smaller than {}MB",
            max_bytes / (1024 * 1024)
        )));
    }
    Ok(())
}

fn strip_data_url(data: &str) -> &str {
    match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    }
}
