//! Conversion of any accepted container into 16 kHz mono 16-bit PCM WAV.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use voxrag_core::config::Config;
use voxrag_core::error::{PipelineError, Result};
use voxrag_core::temp::TempResourceManager;
use voxrag_core::types::{AudioAsset, AudioFormat};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Header sample rates the in-process resampler accepts.
pub const MIN_SOURCE_SAMPLE_RATE: u32 = 1_000;
pub const MAX_SOURCE_SAMPLE_RATE: u32 = 384_000;

/// The one WAV layout the recognizers accept.
pub fn canonical_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

pub fn is_canonical_spec(spec: &hound::WavSpec) -> bool {
    *spec == canonical_spec()
}

/// Produces the canonical waveform for a run.
#[derive(Debug, Clone)]
pub struct FormatNormalizer {
    ffmpeg_path: String,
    timeout: Duration,
}

impl FormatNormalizer {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ffmpeg_path(), config.conversion_timeout())
    }

    /// Return a canonical copy of `asset`, or `asset` itself if it already is one.
    ///
    /// A new output is allocated from `temps`; on any failure it is released
    /// before the error is returned.
    pub async fn normalize(
        &self,
        asset: &AudioAsset,
        temps: &TempResourceManager,
    ) -> Result<AudioAsset> {
        if asset.format == AudioFormat::Unknown {
            return Err(PipelineError::Conversion(format!(
                "Unsupported audio format for {}",
                asset.path.display()
            )));
        }

        let wav_spec = if asset.format == AudioFormat::Wav {
            read_spec(asset.path.clone()).await
        } else {
            None
        };
        if wav_spec.as_ref().is_some_and(is_canonical_spec) {
            debug!(path = %asset.path.display(), "audio_already_canonical");
            return Ok(asset.clone());
        }

        let output = temps.allocate("normalized", "wav")?;
        let converted = match wav_spec {
            Some(spec) => {
                debug!(
                    channels = spec.channels,
                    sample_rate = spec.sample_rate,
                    bits = spec.bits_per_sample,
                    "wav_resample"
                );
                convert_wav_blocking(asset.path.clone(), output.clone()).await
            }
            None => self.convert_with_ffmpeg(&asset.path, &output).await,
        };

        let verified = match converted {
            Ok(()) => verify_output(&output).await,
            Err(e) => Err(e),
        };
        match verified {
            Ok(size_bytes) => {
                info!(
                    from = ?asset.format,
                    input_bytes = asset.size_bytes,
                    output_bytes = size_bytes,
                    "audio_normalized"
                );
                Ok(AudioAsset {
                    path: output,
                    mimetype: Some("audio/wav".into()),
                    size_bytes,
                    format: AudioFormat::Wav,
                })
            }
            Err(e) => {
                if let Err(release_err) = temps.release(&output).await {
                    warn!(error = %release_err, "normalized_release_failed");
                }
                Err(e)
            }
        }
    }

    async fn convert_with_ffmpeg(&self, input: &Path, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .arg("-nostdin")
            .arg("-hide_banner")
            .args(["-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le", "-f", "wav"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(ffmpeg = %self.ffmpeg_path, input = %input.display(), "ffmpeg_convert");

        let child = command.spawn().map_err(|e| {
            PipelineError::Conversion(format!("Failed to start {}: {e}", self.ffmpeg_path))
        })?;

        let out = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PipelineError::Conversion(format!(
                    "Audio conversion timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::Conversion(format!("ffmpeg did not complete: {e}")))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(PipelineError::Conversion(format!(
                "ffmpeg exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

async fn read_spec(path: PathBuf) -> Option<hound::WavSpec> {
    tokio::task::spawn_blocking(move || hound::WavReader::open(&path).ok().map(|r| r.spec()))
        .await
        .ok()
        .flatten()
}

async fn convert_wav_blocking(input: PathBuf, output: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || convert_wav(&input, &output))
        .await
        .map_err(|e| PipelineError::Internal(format!("WAV conversion task failed: {e}")))?
}

/// Confirm the output decodes as canonical WAV and return its size.
async fn verify_output(path: &Path) -> Result<u64> {
    let spec = read_spec(path.to_path_buf()).await.ok_or_else(|| {
        PipelineError::Conversion("Converted audio is not a readable WAV file".into())
    })?;
    if !is_canonical_spec(&spec) {
        return Err(PipelineError::Conversion(format!(
            "Converted audio has unexpected layout: {} ch, {} Hz, {} bit",
            spec.channels, spec.sample_rate, spec.bits_per_sample
        )));
    }
    Ok(tokio::fs::metadata(path).await?.len())
}

/// Decode any PCM WAV into 16 kHz mono i16 samples.
pub fn decode_wav_mono_16k<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Vec<i16>> {
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(PipelineError::Conversion("WAV declares zero channels".into()));
    }
    if !(MIN_SOURCE_SAMPLE_RATE..=MAX_SOURCE_SAMPLE_RATE).contains(&spec.sample_rate) {
        return Err(PipelineError::Conversion(format!(
            "Unsupported WAV sample rate: {} Hz",
            spec.sample_rate
        )));
    }
    let interleaved = read_samples_i16(reader)?;
    let mono = downmix(&interleaved, spec.channels);
    Ok(resample(&mono, spec.sample_rate, TARGET_SAMPLE_RATE))
}

fn convert_wav(input: &Path, output: &Path) -> Result<()> {
    let reader = hound::WavReader::open(input)
        .map_err(|e| PipelineError::Conversion(format!("Failed to parse WAV file: {e}")))?;
    let samples = decode_wav_mono_16k(reader)?;
    let mut writer = hound::WavWriter::create(output, canonical_spec())
        .map_err(|e| PipelineError::Conversion(format!("Failed to create WAV output: {e}")))?;
    for s in samples {
        writer
            .write_sample(s)
            .map_err(|e| PipelineError::Conversion(format!("Failed to write WAV sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| PipelineError::Conversion(format!("Failed to finalize WAV output: {e}")))
}

fn read_samples_i16<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Vec<i16>> {
    let spec = reader.spec();
    let decode_err = |e: hound::Error| PipelineError::Conversion(format!("Failed to read WAV samples: {e}"));
    match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(decode_err),
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| scale_to_i16(v, bits)))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(decode_err)
        }
    }
}

fn scale_to_i16(sample: i32, bits: u16) -> i16 {
    match bits {
        16 => sample as i16,
        b if b > 16 => (sample >> (b - 16)) as i16,
        b => (sample << (16 - b)) as i16,
    }
}

/// Average interleaved channels into one.
fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels == 1 {
        return samples.to_vec();
    }
    let n = channels as usize;
    samples
        .chunks_exact(n)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / n as i32) as i16)
        .collect()
}

/// Simple linear interpolation resampling.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[i16]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn asset(path: &Path, format: AudioFormat) -> AudioAsset {
        AudioAsset {
            path: path.to_path_buf(),
            mimetype: None,
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            format,
        }
    }

    fn normalizer() -> FormatNormalizer {
        FormatNormalizer::new("ffmpeg", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_canonical_input_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.wav");
        write_wav(&input, canonical_spec(), &[1, 2, 3, 4]);
        let temps = TempResourceManager::new(dir.path().join("scratch"), "norm1");

        let out = normalizer()
            .normalize(&asset(&input, AudioFormat::Wav), &temps)
            .await
            .unwrap();
        assert_eq!(out.path, input);
        assert_eq!(temps.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_stereo_44k_becomes_canonical_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&input, spec, &vec![1000i16; 44_100 * 2]);
        let temps = TempResourceManager::new(dir.path(), "norm2");

        let first = normalizer()
            .normalize(&asset(&input, AudioFormat::Wav), &temps)
            .await
            .unwrap();
        assert_ne!(first.path, input);
        assert!(temps.is_tracked(&first.path));

        let reader = hound::WavReader::open(&first.path).unwrap();
        assert!(is_canonical_spec(&reader.spec()));
        let len = reader.len();
        assert!((15_900..=16_100).contains(&len), "got {len} samples");

        let second = normalizer().normalize(&first, &temps).await.unwrap();
        assert_eq!(second.path, first.path);
        assert_eq!(temps.tracked_count(), 1);
        temps.drain().await;
    }

    #[tokio::test]
    async fn test_float_24bit_layouts_decode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&input, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(0.5f32).unwrap();
        }
        writer.finalize().unwrap();

        let samples = decode_wav_mono_16k(hound::WavReader::open(&input).unwrap()).unwrap();
        assert_eq!(samples.len(), 160);
        assert!(samples.iter().all(|&s| (16_000..=16_500).contains(&s)));

        assert_eq!(scale_to_i16(0x7F_FFFF, 24), i16::MAX);
        assert_eq!(scale_to_i16(-128, 8), i16::MIN);
    }

    #[tokio::test]
    async fn test_unknown_format_is_conversion_error_without_temp() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mystery.bin");
        std::fs::write(&input, b"????").unwrap();
        let temps = TempResourceManager::new(dir.path(), "norm3");

        let err = normalizer()
            .normalize(&asset(&input, AudioFormat::Unknown), &temps)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
        assert_eq!(err.http_status(), 422);
        assert_eq!(temps.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_conversion_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.mp3");
        std::fs::write(&input, b"ID3\x04\0\0garbage").unwrap();
        let scratch = dir.path().join("scratch");
        let temps = TempResourceManager::new(&scratch, "norm4");

        let missing = FormatNormalizer::new("/nonexistent/bin/ffmpeg", Duration::from_secs(5));
        let err = missing
            .normalize(&asset(&input, AudioFormat::Mp3), &temps)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conversion(_)));
        assert_eq!(temps.tracked_count(), 0);
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    /// 16-bit mono PCM with whatever rate the header claims.
    fn raw_wav(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[tokio::test]
    async fn test_implausible_header_rates_are_conversion_errors() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let temps = TempResourceManager::new(&scratch, "norm5");

        for rate in [0u32, 1, 999, 384_001] {
            let input = dir.path().join(format!("rate-{rate}.wav"));
            std::fs::write(&input, raw_wav(rate, &[0i16; 2000])).unwrap();

            let err = normalizer()
                .normalize(&asset(&input, AudioFormat::Wav), &temps)
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::Conversion(_)), "rate {rate}: {err:?}");
            assert_eq!(err.http_status(), 422);
            assert_eq!(temps.tracked_count(), 0);
        }
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_sample_rate_bounds_are_inclusive() {
        for rate in [MIN_SOURCE_SAMPLE_RATE, MAX_SOURCE_SAMPLE_RATE] {
            let bytes = raw_wav(rate, &[100i16; 400]);
            let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).unwrap();
            let samples = decode_wav_mono_16k(reader).unwrap();
            let expected = (400.0 * TARGET_SAMPLE_RATE as f64 / rate as f64).ceil() as usize;
            assert_eq!(samples.len(), expected);
        }
    }

    fn ffmpeg_available() -> bool {
        std::process::Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    #[tokio::test]
    async fn test_ffmpeg_encodings_become_canonical() {
        if !ffmpeg_available() {
            eprintln!("Skipping: ffmpeg not on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let temps = TempResourceManager::new(dir.path().join("scratch"), "norm6");

        for (ext, format) in [
            ("mp3", AudioFormat::Mp3),
            ("ogg", AudioFormat::Ogg),
            ("flac", AudioFormat::Flac),
            ("webm", AudioFormat::Webm),
            ("m4a", AudioFormat::M4a),
        ] {
            let input = dir.path().join(format!("tone.{ext}"));
            let status = std::process::Command::new("ffmpeg")
                .args(["-nostdin", "-loglevel", "error", "-y", "-f", "lavfi"])
                .args(["-i", "sine=frequency=440:sample_rate=44100:duration=1"])
                .args(["-ac", "2"])
                .arg(&input)
                .status()
                .unwrap();
            if !status.success() {
                eprintln!("Skipping {ext}: ffmpeg build lacks an encoder");
                continue;
            }

            let first = normalizer()
                .normalize(&asset(&input, format), &temps)
                .await
                .unwrap();
            assert_ne!(first.path, input);
            assert_eq!(first.format, AudioFormat::Wav);
            let reader = hound::WavReader::open(&first.path).unwrap();
            assert!(is_canonical_spec(&reader.spec()), "{ext}: {:?}", reader.spec());
            assert!(reader.len() > 15_000, "{ext}: {} samples", reader.len());

            let tracked = temps.tracked_count();
            let second = normalizer().normalize(&first, &temps).await.unwrap();
            assert_eq!(second.path, first.path);
            assert_eq!(temps.tracked_count(), tracked);
        }
        temps.drain().await;
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 200, 300, 400], 2), vec![150, 350]);
        assert_eq!(downmix(&[-100, 100, 30, 60, 90, 0], 3), vec![10, 30]);
    }

    #[test]
    fn test_resample_edges() {
        assert!(resample(&[], 8000, 16000).is_empty());
        assert_eq!(resample(&[100], 16000, 8000), vec![100]);
        let up = resample(&[0, 1000, 2000], 8000, 16000);
        assert_eq!(up.len(), 6);
        assert_eq!(up[2], 1000);
    }
}
