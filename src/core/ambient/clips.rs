use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use thiserror::Error;

use super::AmbientError;
use crate::core::media::{DecodedClip, CLIP_SAMPLE_RATE};
use crate::core::rooms::display_name_for_url;

const MAX_CLIP_SECONDS: u32 = 120;
const PEAK_CEILING: f32 = 0.92;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("unsupported or invalid audio format: {0}")]
    Format(#[source] SymphoniaError),
    #[error("file has no playable audio track")]
    NoTrack,
    #[error("no decoder for the audio track: {0}")]
    Codec(#[source] SymphoniaError),
    #[error("audio stream failed: {0}")]
    Stream(#[source] SymphoniaError),
    #[error("clip is longer than {max_seconds} seconds")]
    TooLong { max_seconds: u32 },
    #[error("no decodable audio found")]
    Empty,
    #[error("decoder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Reads ambient clips from the assets directory and decodes them to mono
/// 48 kHz.
#[derive(Debug, Clone)]
pub struct ClipLoader {
    assets_dir: PathBuf,
}

impl ClipLoader {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    pub async fn load(&self, url: &str) -> Result<DecodedClip, AmbientError> {
        let path = self.assets_dir.join(url);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| AmbientError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let extension = extension_hint(url);
        let decoded = tokio::task::spawn_blocking(move || decode_clip(bytes, extension))
            .await
            .map_err(ClipError::from)
            .and_then(|decoded| decoded)
            .map_err(|source| AmbientError::Decode {
                url: url.to_string(),
                source,
            })?;

        Ok(DecodedClip {
            label: display_name_for_url(url),
            samples: decoded,
        })
    }
}

/// Container hint for the formats the room assets ship in.
fn extension_hint(url: &str) -> Option<&'static str> {
    let ext = Path::new(url).extension()?.to_str()?.to_ascii_lowercase();
    ["mp3", "wav", "ogg"]
        .into_iter()
        .find(|known| *known == ext)
}

/// Downmixed samples at the file's own rate.
struct MonoClip {
    samples: Vec<f32>,
    rate: u32,
}

/// Mono, engine rate, peak at or below [`PEAK_CEILING`].
fn decode_clip(bytes: Vec<u8>, extension: Option<&str>) -> Result<Vec<f32>, ClipError> {
    let mono = decode_mono(bytes, extension)?;
    let mut samples = resample_linear(&mono.samples, mono.rate, CLIP_SAMPLE_RATE);
    apply_peak_ceiling(&mut samples);
    Ok(samples)
}

fn decode_mono(bytes: Vec<u8>, extension: Option<&str>) -> Result<MonoClip, ClipError> {
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut format = get_probe()
        .format(&hint, stream, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(ClipError::Format)?
        .format;

    let track = format
        .default_track()
        .filter(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(ClipError::NoTrack)?;
    let track_id = track.id;
    let mut rate = track.codec_params.sample_rate.unwrap_or(CLIP_SAMPLE_RATE);
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(ClipError::Codec)?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(ClipError::Stream(err)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let audio = match decoder.decode(&packet) {
            Ok(audio) => audio,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            // A corrupt packet only costs its own samples.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(ClipError::Stream(err)),
        };

        let spec = *audio.spec();
        rate = spec.rate;
        let channels = spec.channels.count().max(1);
        let mut interleaved = SampleBuffer::<f32>::new(audio.capacity() as u64, spec);
        interleaved.copy_interleaved_ref(audio);
        samples.extend(
            interleaved
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );

        if samples.len() as u64 > u64::from(rate) * u64::from(MAX_CLIP_SECONDS) {
            return Err(ClipError::TooLong {
                max_seconds: MAX_CLIP_SECONDS,
            });
        }
    }

    if samples.is_empty() {
        return Err(ClipError::Empty);
    }
    Ok(MonoClip { samples, rate })
}

/// Output frame `n` interpolates the input at `n * from / to`.
fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if input.len() < 2 || from == to || from == 0 || to == 0 {
        return input.to_vec();
    }

    let step = f64::from(from) / f64::from(to);
    let frames = ((input.len() - 1) as f64 / step).floor() as usize + 1;
    (0..frames)
        .map(|n| {
            let position = n as f64 * step;
            let idx = position as usize;
            let frac = (position - idx as f64) as f32;
            match input.get(idx + 1) {
                Some(&next) => input[idx] + (next - input[idx]) * frac,
                None => input[idx],
            }
        })
        .collect()
}

fn apply_peak_ceiling(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0_f32, |max, s| max.max(s.abs()));
    if peak <= PEAK_CEILING {
        return;
    }
    let gain = PEAK_CEILING / peak;
    samples.iter_mut().for_each(|s| *s *= gain);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 16-bit PCM mono WAV of a constant value.
    pub(crate) fn wav_bytes(sample_rate: u32, frames: usize, value: i16) -> Vec<u8> {
        let data_len = (frames * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for _ in 0..frames {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    #[test]
    fn resample_linear_downsamples() {
        let input = vec![0.0_f32; 48_000];
        let output = resample_linear(&input, 48_000, 24_000);
        assert_eq!(output.len(), 24_000);
    }

    #[test]
    fn resample_linear_interpolates_between_frames() {
        let output = resample_linear(&[0.0, 1.0, 0.0], 24_000, 48_000);
        assert_eq!(output, vec![0.0, 0.5, 1.0, 0.5, 0.0]);
        assert_eq!(resample_linear(&[0.3], 24_000, 48_000), vec![0.3]);
    }

    #[test]
    fn extension_hint_restricts_supported_types() {
        assert_eq!(extension_hint("sounds/owl.WAV"), Some("wav"));
        assert_eq!(extension_hint("sounds/owl.ogg"), Some("ogg"));
        assert_eq!(extension_hint("sounds/owl.flac"), None);
        assert_eq!(extension_hint("sounds/owl"), None);
    }

    #[test]
    fn loud_clips_are_pulled_under_the_ceiling() {
        let mut loud = vec![0.5, -1.0, 0.25];
        apply_peak_ceiling(&mut loud);
        assert!((loud[1] + PEAK_CEILING).abs() < 1e-6);

        let mut quiet = vec![0.1, -0.2];
        apply_peak_ceiling(&mut quiet);
        assert_eq!(quiet, vec![0.1, -0.2]);
    }

    #[test]
    fn decodes_wav_and_upsamples_to_48k() {
        let samples = decode_clip(wav_bytes(24_000, 24_000, 8_000), Some("wav")).expect("decodes");
        assert!((47_990..=48_000).contains(&samples.len()));
        assert!(samples.iter().all(|s| (*s - 8_000.0 / 32_768.0).abs() < 1e-3));
    }

    #[test]
    fn decode_failures_are_typed() {
        let garbage = decode_clip(b"definitely not audio".to_vec(), Some("wav"));
        assert!(matches!(garbage, Err(ClipError::Format(_))));

        let too_long = decode_clip(wav_bytes(8_000, 8_000 * 121, 100), Some("wav"));
        assert!(matches!(
            too_long,
            Err(ClipError::TooLong { max_seconds: 120 })
        ));
    }

    #[tokio::test]
    async fn loader_reads_relative_to_assets_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("sounds")).expect("mkdir");
        std::fs::write(
            dir.path().join("sounds/owl.wav"),
            wav_bytes(48_000, 4_800, 1_000),
        )
        .expect("write wav");
        std::fs::write(dir.path().join("sounds/broken.wav"), b"RIFF junk").expect("write junk");

        let loader = ClipLoader::new(dir.path());
        let clip = loader.load("sounds/owl.wav").await.expect("clip");
        assert_eq!(clip.label, "owl");
        assert_eq!(clip.samples.len(), 4_800);

        let missing = loader.load("sounds/none.wav").await.expect_err("missing");
        assert!(matches!(missing, AmbientError::Read { .. }));

        let broken = loader.load("sounds/broken.wav").await.expect_err("broken");
        assert!(matches!(broken, AmbientError::Decode { .. }));
    }
}
