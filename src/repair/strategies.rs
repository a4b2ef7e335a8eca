//! Repair strategies and their building blocks.
//!
//! Text handling (sub-splitting, simplification) and minimal PCM WAV
//! inspection/concatenation live here. The audio handling is deliberately
//! tiny: repairs only ever stitch together artifacts one synthesis engine
//! produced in one run, so a canonical 16-bit PCM reader covers the need.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::phase::PhaseLabel;
use crate::pipeline_config::RepairSection;

/// Recovery strategies in the order the loop tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    /// Split the chunk text at secondary boundaries and synthesize the
    /// parts separately.
    SubSplit,
    /// Retry the chunk on an alternate engine.
    EngineSwitch,
    /// Ask the external rewriter for a cleaner rendition of the text.
    TextRewrite,
    /// Strip non-essential annotations and retry.
    Simplify,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::SubSplit => "sub_split",
            RepairStrategy::EngineSwitch => "engine_switch",
            RepairStrategy::TextRewrite => "text_rewrite",
            RepairStrategy::Simplify => "simplify",
        }
    }

    /// Strategy order for a configuration; rewrite only participates when
    /// an external rewriter is configured.
    pub fn ordered(config: &RepairSection) -> Vec<RepairStrategy> {
        let mut strategies = vec![RepairStrategy::SubSplit, RepairStrategy::EngineSwitch];
        if config.rewrite_command.is_some() {
            strategies.push(RepairStrategy::TextRewrite);
        }
        strategies.push(RepairStrategy::Simplify);
        strategies
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Manifest written per repaired chunk under
/// `.pipeline/repairs/<phase>/<chunk_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairManifest {
    pub file_id: String,
    pub phase: PhaseLabel,
    pub chunk_id: u32,
    pub strategy: RepairStrategy,
    pub original_artifact: Option<String>,
    pub replacement_artifact: String,
    pub confidence: f64,
    /// Whether confidence cleared the threshold and the state document now
    /// references the replacement.
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

impl RepairManifest {
    pub fn path(meta_dir: &Path, phase: PhaseLabel, chunk_id: u32) -> PathBuf {
        meta_dir
            .join("repairs")
            .join(phase.as_str())
            .join(format!("{}.json", chunk_id))
    }

    pub fn save(&self, meta_dir: &Path) -> Result<PathBuf, PipelineError> {
        let path = Self::path(meta_dir, self.phase, self.chunk_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| PipelineError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        std::fs::write(&path, json).map_err(|source| PipelineError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Text handling
// ---------------------------------------------------------------------------

/// Split text at secondary boundaries: sentence enders first, then
/// clause punctuation, then commas, then a whitespace midpoint. Returns at
/// most `max_parts` non-empty parts.
pub fn split_at_boundaries(text: &str, max_parts: usize) -> Vec<String> {
    if max_parts <= 1 {
        return vec![text.trim().to_string()];
    }

    for separators in [&['.', '!', '?'][..], &[';', ':'][..], &[','][..]] {
        let parts = split_keeping_separator(text, separators);
        if parts.len() > 1 {
            return merge_to_limit(parts, max_parts);
        }
    }

    // No punctuation: split at the whitespace nearest the midpoint.
    let mid = text.len() / 2;
    let split_at = text
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .map(|(i, _)| i)
        .min_by_key(|i| i.abs_diff(mid));
    match split_at {
        Some(i) => vec![
            text[..i].trim().to_string(),
            text[i..].trim().to_string(),
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect(),
        None => vec![text.trim().to_string()],
    }
}

fn split_keeping_separator(text: &str, separators: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if separators.contains(&c) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    parts
}

/// Merge adjacent parts until at most `max_parts` remain, keeping sizes
/// roughly even.
fn merge_to_limit(parts: Vec<String>, max_parts: usize) -> Vec<String> {
    if parts.len() <= max_parts {
        return parts;
    }
    let total: usize = parts.iter().map(String::len).sum();
    let target = total / max_parts + 1;
    let mut merged: Vec<String> = Vec::with_capacity(max_parts);
    let mut current = String::new();
    for part in parts {
        if !current.is_empty() && current.len() + part.len() > target && merged.len() + 1 < max_parts
        {
            merged.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&part);
    }
    if !current.is_empty() {
        merged.push(current);
    }
    merged
}

/// Strip non-essential annotations: footnote markers like `[12]`, bracketed
/// editorial content, and collapsed whitespace.
pub fn simplify_text(text: &str) -> String {
    let no_brackets = regex::Regex::new(r"\[[^\]]*\]")
        .map(|re| re.replace_all(text, "").into_owned())
        .unwrap_or_else(|_| text.to_string());
    let collapsed = regex::Regex::new(r"\s+")
        .map(|re| re.replace_all(&no_brackets, " ").into_owned())
        .unwrap_or(no_brackets);
    collapsed.trim().to_string()
}

// ---------------------------------------------------------------------------
// Minimal PCM WAV handling
// ---------------------------------------------------------------------------

/// Format of a canonical PCM WAV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Parsed WAV: format plus raw sample payload.
pub struct WavAudio {
    pub format: WavFormat,
    pub data: Vec<u8>,
}

impl WavAudio {
    pub fn duration_seconds(&self) -> f64 {
        let bytes_per_second = self.format.sample_rate as u64
            * self.format.channels as u64
            * (self.format.bits_per_sample as u64 / 8);
        if bytes_per_second == 0 {
            return 0.0;
        }
        self.data.len() as f64 / bytes_per_second as f64
    }

    /// Root-mean-square amplitude of 16-bit samples, normalized to 0..1.
    /// The cheapest possible "is there speech in here" check.
    pub fn rms(&self) -> f64 {
        if self.format.bits_per_sample != 16 || self.data.len() < 2 {
            return 0.0;
        }
        let mut sum = 0f64;
        let mut count = 0u64;
        for sample in self.data.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]) as f64 / i16::MAX as f64;
            sum += value * value;
            count += 1;
        }
        if count == 0 { 0.0 } else { (sum / count as f64).sqrt() }
    }
}

fn wav_error(path: &Path, reason: &str) -> PipelineError {
    PipelineError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, reason.to_string()),
    }
}

/// Parse a RIFF/WAVE file, walking chunks for `fmt ` and `data`.
pub fn read_wav(path: &Path) -> Result<WavAudio, PipelineError> {
    let bytes = std::fs::read(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(wav_error(path, "not a RIFF/WAVE file"));
    }

    let mut format: Option<WavFormat> = None;
    let mut data: Option<Vec<u8>> = None;
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body_end = (body_start + size).min(bytes.len());
        match id {
            b"fmt " if size >= 16 => {
                let body = &bytes[body_start..body_end];
                format = Some(WavFormat {
                    channels: u16::from_le_bytes([body[2], body[3]]),
                    sample_rate: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    bits_per_sample: u16::from_le_bytes([body[14], body[15]]),
                });
            }
            b"data" => {
                data = Some(bytes[body_start..body_end].to_vec());
            }
            _ => {}
        }
        // Chunks are word-aligned.
        offset = body_start + size + (size & 1);
    }

    match (format, data) {
        (Some(format), Some(data)) => Ok(WavAudio { format, data }),
        _ => Err(wav_error(path, "missing fmt or data chunk")),
    }
}

/// Write a canonical PCM WAV file.
pub fn write_wav(path: &Path, format: WavFormat, data: &[u8]) -> Result<(), PipelineError> {
    let byte_rate =
        format.sample_rate * format.channels as u32 * (format.bits_per_sample as u32 / 8);
    let block_align = format.channels * (format.bits_per_sample / 8);

    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);

    std::fs::write(path, out).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Concatenate PCM WAV files with a constant silence gap between them.
/// All inputs must share one format.
pub fn concat_wav(
    inputs: &[PathBuf],
    silence_ms: u32,
    output: &Path,
) -> Result<(), PipelineError> {
    let Some(first) = inputs.first() else {
        return Err(wav_error(output, "no inputs to concatenate"));
    };
    let first_audio = read_wav(first)?;
    let format = first_audio.format;

    let silence_bytes = (format.sample_rate as u64
        * format.channels as u64
        * (format.bits_per_sample as u64 / 8)
        * silence_ms as u64
        / 1000) as usize;
    // Keep sample alignment.
    let align = (format.channels * (format.bits_per_sample / 8)) as usize;
    let silence_bytes = if align > 0 {
        silence_bytes - silence_bytes % align
    } else {
        silence_bytes
    };

    let mut data = first_audio.data;
    for input in &inputs[1..] {
        let audio = read_wav(input)?;
        if audio.format != format {
            return Err(wav_error(input, "sample format mismatch"));
        }
        data.extend(std::iter::repeat_n(0u8, silence_bytes));
        data.extend_from_slice(&audio.data);
    }
    write_wav(output, format, &data)
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Characters per second of typical narration; turns text length into an
/// expected duration for the duration-ratio score.
pub const NARRATION_CHARS_PER_SECOND: f64 = 15.0;

/// Score a replacement artifact.
///
/// Duration score decays linearly with the deviation of actual duration
/// from expectation; the validation score is the caller's signal from the
/// phase's own metrics (or the RMS fallback). Weights come from `[repair]`.
pub fn confidence_score(
    config: &RepairSection,
    expected_seconds: f64,
    actual_seconds: f64,
    validation_score: f64,
) -> f64 {
    let duration_score = if expected_seconds <= 0.0 {
        0.0
    } else {
        let ratio = actual_seconds / expected_seconds;
        (1.0 - (ratio - 1.0).abs()).clamp(0.0, 1.0)
    };
    let total_weight = config.duration_weight + config.validation_weight;
    if total_weight <= 0.0 {
        return 0.0;
    }
    ((config.duration_weight * duration_score + config.validation_weight * validation_score)
        / total_weight)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FORMAT: WavFormat = WavFormat {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
    };

    fn tone(seconds: f64, amplitude: i16) -> Vec<u8> {
        let samples = (seconds * FORMAT.sample_rate as f64) as usize;
        let mut data = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let value = if i % 2 == 0 { amplitude } else { -amplitude };
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_split_prefers_sentence_boundaries() {
        let text = "First sentence. Second one! Third? Fourth.";
        let parts = split_at_boundaries(text, 8);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "First sentence.");
        assert_eq!(parts[2], "Third?");
    }

    #[test]
    fn test_split_falls_back_to_clause_punctuation() {
        let text = "a clause; another clause: final clause";
        let parts = split_at_boundaries(text, 8);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn test_split_without_punctuation_uses_midpoint() {
        let text = "word word word word word word";
        let parts = split_at_boundaries(text, 4);
        assert_eq!(parts.len(), 2);
        assert!(!parts[0].is_empty());
        assert!(!parts[1].is_empty());
    }

    #[test]
    fn test_split_respects_max_parts() {
        let text = "a. b. c. d. e. f. g. h. i. j.";
        let parts = split_at_boundaries(text, 3);
        assert!(parts.len() <= 3);
        // Nothing is lost in the merge.
        let rejoined = parts.join(" ");
        assert!(rejoined.contains("a.") && rejoined.contains("j."));
    }

    #[test]
    fn test_simplify_strips_annotations() {
        let text = "The whale[12] swam  [editor: check]  away.";
        assert_eq!(simplify_text(text), "The whale swam away.");
    }

    #[test]
    fn test_wav_round_trip_and_duration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let data = tone(2.0, 1000);
        write_wav(&path, FORMAT, &data).unwrap();

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.format, FORMAT);
        assert!((audio.duration_seconds() - 2.0).abs() < 0.01);
        assert!(audio.rms() > 0.0);
    }

    #[test]
    fn test_concat_inserts_silence() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        let out = dir.path().join("out.wav");
        write_wav(&a, FORMAT, &tone(1.0, 1000)).unwrap();
        write_wav(&b, FORMAT, &tone(1.0, 1000)).unwrap();

        concat_wav(&[a, b], 500, &out).unwrap();
        let audio = read_wav(&out).unwrap();
        assert!((audio.duration_seconds() - 2.5).abs() < 0.01);
    }

    #[test]
    fn test_concat_rejects_format_mismatch() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        write_wav(&a, FORMAT, &tone(0.5, 1000)).unwrap();
        let other = WavFormat {
            sample_rate: 22050,
            ..FORMAT
        };
        write_wav(&b, other, &tone(0.5, 1000)).unwrap();
        assert!(concat_wav(&[a, b], 100, &dir.path().join("out.wav")).is_err());
    }

    #[test]
    fn test_read_wav_rejects_non_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not.wav");
        std::fs::write(&path, b"definitely not audio").unwrap();
        assert!(read_wav(&path).is_err());
    }

    #[test]
    fn test_confidence_scores() {
        let config = RepairSection::default();
        // Perfect duration and validation.
        let perfect = confidence_score(&config, 10.0, 10.0, 1.0);
        assert!((perfect - 1.0).abs() < 1e-9);
        // Strong deviation drags the score down.
        let off = confidence_score(&config, 10.0, 3.0, 1.0);
        assert!(off < 0.7);
        // Zero expectation scores zero on the duration term.
        let unknown = confidence_score(&config, 0.0, 5.0, 1.0);
        assert!((unknown - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_order_includes_rewrite_only_when_configured() {
        let mut config = RepairSection::default();
        assert_eq!(
            RepairStrategy::ordered(&config),
            vec![
                RepairStrategy::SubSplit,
                RepairStrategy::EngineSwitch,
                RepairStrategy::Simplify
            ]
        );
        config.rewrite_command = Some("bw-rewrite".into());
        assert!(RepairStrategy::ordered(&config).contains(&RepairStrategy::TextRewrite));
    }

    #[test]
    fn test_manifest_save_path() {
        let dir = tempdir().unwrap();
        let manifest = RepairManifest {
            file_id: "f1".into(),
            phase: PhaseLabel::Synthesize,
            chunk_id: 7,
            strategy: RepairStrategy::SubSplit,
            original_artifact: Some("synthesize/c7.wav".into()),
            replacement_artifact: ".pipeline/repairs/synthesize/7.wav".into(),
            confidence: 0.92,
            applied: true,
            created_at: Utc::now(),
        };
        let path = manifest.save(dir.path()).unwrap();
        assert!(path.ends_with("repairs/phase4/7.json"));
        let loaded: RepairManifest =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded.strategy, RepairStrategy::SubSplit);
        assert!(loaded.applied);
    }
}
