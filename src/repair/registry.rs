//! Durable chunk failure registry.
//!
//! `failures.json` under `.pipeline/` holds one entry per line, appended
//! with O_APPEND semantics so the orchestrator and batch workers can record
//! failures concurrently. Readers fold the lines into the nested
//! `file_id -> phase -> chunk_id -> [FailureRecord]` map; duplicates are
//! collapsed by attempt number.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::phase::PhaseLabel;
use crate::state::FailureRecord;

/// One appended line of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub file_id: String,
    pub chunk_id: u32,
    #[serde(flatten)]
    pub record: FailureRecord,
}

/// Folded view: `file_id -> phase -> chunk_id -> failures`.
pub type RegistryMap = BTreeMap<String, BTreeMap<String, BTreeMap<u32, Vec<FailureRecord>>>>;

pub struct FailureRegistry {
    path: PathBuf,
}

impl FailureRegistry {
    pub fn new(meta_dir: &Path) -> Self {
        Self {
            path: meta_dir.join("failures.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one failure entry as a single line.
    pub fn append(&self, entry: &RegistryEntry) -> Result<(), PipelineError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| PipelineError::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| PipelineError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| PipelineError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Fold all lines into the nested map, deduplicating by attempt.
    pub fn load(&self) -> Result<RegistryMap, PipelineError> {
        let mut map: RegistryMap = BTreeMap::new();
        if !self.path.exists() {
            return Ok(map);
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| PipelineError::Io {
                path: self.path.clone(),
                source,
            })?;
        for line in content.lines() {
            let Ok(entry) = serde_json::from_str::<RegistryEntry>(line) else {
                continue;
            };
            let failures = map
                .entry(entry.file_id.clone())
                .or_default()
                .entry(entry.record.phase.as_str().to_string())
                .or_default()
                .entry(entry.chunk_id)
                .or_default();
            if !failures.iter().any(|f| f.attempt == entry.record.attempt) {
                failures.push(entry.record);
            }
        }
        for phases in map.values_mut() {
            for chunks in phases.values_mut() {
                for failures in chunks.values_mut() {
                    failures.sort_by_key(|f| f.attempt);
                }
            }
        }
        Ok(map)
    }

    /// Chunk ids with at least one recorded failure for `file_id`/`phase`.
    pub fn failed_chunks(
        &self,
        file_id: &str,
        phase: PhaseLabel,
    ) -> Result<Vec<u32>, PipelineError> {
        let map = self.load()?;
        Ok(map
            .get(file_id)
            .and_then(|phases| phases.get(phase.as_str()))
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn record(attempt: u32) -> FailureRecord {
        FailureRecord {
            category: "chunk_failure".into(),
            phase: PhaseLabel::Synthesize,
            attempt,
            timestamp: Utc::now(),
            message: "synthesis produced 0 samples".into(),
            engine: Some("styletts2".into()),
            parameters: BTreeMap::new(),
            log_excerpt: None,
        }
    }

    #[test]
    fn test_append_and_fold() {
        let dir = tempdir().unwrap();
        let registry = FailureRegistry::new(dir.path());
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 7,
                record: record(1),
            })
            .unwrap();
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 7,
                record: record(2),
            })
            .unwrap();
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 9,
                record: record(1),
            })
            .unwrap();

        let map = registry.load().unwrap();
        let chunks = &map["f1"]["phase4"];
        assert_eq!(chunks[&7].len(), 2);
        assert_eq!(chunks[&9].len(), 1);
        assert_eq!(chunks[&7][0].attempt, 1);
        assert_eq!(chunks[&7][1].attempt, 2);
    }

    #[test]
    fn test_duplicate_attempts_are_collapsed() {
        let dir = tempdir().unwrap();
        let registry = FailureRegistry::new(dir.path());
        for _ in 0..3 {
            registry
                .append(&RegistryEntry {
                    file_id: "f1".into(),
                    chunk_id: 4,
                    record: record(1),
                })
                .unwrap();
        }
        let map = registry.load().unwrap();
        assert_eq!(map["f1"]["phase4"][&4].len(), 1);
    }

    #[test]
    fn test_failed_chunks_filters_by_file_and_phase() {
        let dir = tempdir().unwrap();
        let registry = FailureRegistry::new(dir.path());
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 2,
                record: record(1),
            })
            .unwrap();
        let mut other = record(1);
        other.phase = PhaseLabel::Enhance;
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 5,
                record: other,
            })
            .unwrap();

        assert_eq!(
            registry.failed_chunks("f1", PhaseLabel::Synthesize).unwrap(),
            vec![2]
        );
        assert_eq!(
            registry.failed_chunks("f1", PhaseLabel::Enhance).unwrap(),
            vec![5]
        );
        assert!(
            registry
                .failed_chunks("f2", PhaseLabel::Synthesize)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_load_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let registry = FailureRegistry::new(dir.path());
        registry
            .append(&RegistryEntry {
                file_id: "f1".into(),
                chunk_id: 1,
                record: record(1),
            })
            .unwrap();
        let mut content = std::fs::read_to_string(registry.path()).unwrap();
        content.push_str("half a lin");
        std::fs::write(registry.path(), content).unwrap();

        let map = registry.load().unwrap();
        assert_eq!(map.len(), 1);
    }
}
