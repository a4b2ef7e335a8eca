//! Schema validation and canonicalization of the state document.
//!
//! Validation has two strengths:
//! - structural: always on, cheap. Types, required fields, enum membership
//!   (via serde), phase-label keys, chunk-id base and density.
//! - strict: opt-in. Numeric ranges and inter-field consistency.
//!
//! `canonicalize` normalizes earlier schema versions to the current layout.
//! It is idempotent, and lossless for fields the current schema knows;
//! unrecognized legacy fields move under `legacy` instead of being dropped.

use std::str::FromStr;

use serde_json::{Map, Value, json};

use crate::phase::{PhaseLabel, phase_spec};
use crate::state::model::{PipelineState, PhaseStatus, SCHEMA_VERSION};

/// A validation failure, with a path-ish location and a reason.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaViolation {
    pub location: String,
    pub reason: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.reason)
    }
}

/// Structural validation of a parsed document.
///
/// Serde has already enforced types and enum membership by the time we have
/// a `PipelineState`; this layer checks the rules serde cannot express.
pub fn validate_structural(state: &PipelineState) -> Result<(), Vec<SchemaViolation>> {
    let mut violations = Vec::new();

    if state.schema_version != SCHEMA_VERSION {
        violations.push(SchemaViolation {
            location: "schema_version".into(),
            reason: format!(
                "expected {}, found {} (canonicalize before validating)",
                SCHEMA_VERSION, state.schema_version
            ),
        });
    }

    if state.file_id.is_empty() {
        violations.push(SchemaViolation {
            location: "file_id".into(),
            reason: "must not be empty".into(),
        });
    }

    for key in state.phases.keys() {
        if PhaseLabel::from_str(key).is_err() {
            violations.push(SchemaViolation {
                location: format!("phases.{}", key),
                reason: "unknown phase label".into(),
            });
        }
    }

    for (key, block) in &state.phases {
        let Ok(label) = PhaseLabel::from_str(key) else {
            continue;
        };
        let spec = phase_spec(label);

        if !spec.chunked && !block.chunks.is_empty() {
            violations.push(SchemaViolation {
                location: format!("phases.{}.chunks", key),
                reason: "phase is not chunked".into(),
            });
            continue;
        }

        // Chunk ids must start at the phase's declared base and be dense;
        // ascending order is a property of the map itself.
        if let Some(first) = block.chunks.keys().next() {
            if *first != spec.chunk_base {
                violations.push(SchemaViolation {
                    location: format!("phases.{}.chunks", key),
                    reason: format!(
                        "first chunk id {} does not match declared base {}",
                        first, spec.chunk_base
                    ),
                });
            }
            for (expected, actual) in block.chunks.keys().enumerate() {
                let expected = spec.chunk_base + expected as u32;
                if *actual != expected {
                    violations.push(SchemaViolation {
                        location: format!("phases.{}.chunks.{}", key, actual),
                        reason: format!("chunk ids not dense, expected {}", expected),
                    });
                    break;
                }
            }
        }
    }

    for (key, entry) in &state.overrides {
        if entry.key() != *key {
            violations.push(SchemaViolation {
                location: format!("overrides.{}", key),
                reason: format!("key does not match entry ({})", entry.key()),
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Strict validation: numeric ranges and inter-field consistency on top of
/// the structural rules.
pub fn validate_strict(state: &PipelineState) -> Result<(), Vec<SchemaViolation>> {
    validate_structural(state)?;
    let mut violations = Vec::new();

    for (key, block) in &state.phases {
        for (id, chunk) in &block.chunks {
            if let Some(d) = chunk.duration_seconds
                && !(d.is_finite() && d >= 0.0)
            {
                violations.push(SchemaViolation {
                    location: format!("phases.{}.chunks.{}.duration_seconds", key, id),
                    reason: format!("out of range: {}", d),
                });
            }
            for (name, value) in &chunk.metrics {
                if !value.is_finite() {
                    violations.push(SchemaViolation {
                        location: format!("phases.{}.chunks.{}.metrics.{}", key, id, name),
                        reason: "not finite".into(),
                    });
                }
            }
        }

        // Every chunk usable but the block marked failed is inconsistent.
        if !block.chunks.is_empty()
            && block.chunks.values().all(|c| c.status.is_usable())
            && block.status == PhaseStatus::Failed
        {
            violations.push(SchemaViolation {
                location: format!("phases.{}.status", key),
                reason: "failed although every chunk succeeded".into(),
            });
        }

        // A successful chunked phase must reference an artifact per chunk.
        if block.status == PhaseStatus::Success {
            for (id, chunk) in &block.chunks {
                if !chunk.status.is_usable() {
                    violations.push(SchemaViolation {
                        location: format!("phases.{}.chunks.{}", key, id),
                        reason: "phase is success but chunk is not".into(),
                    });
                } else if chunk.effective_artifact_path().is_none() {
                    violations.push(SchemaViolation {
                        location: format!("phases.{}.chunks.{}", key, id),
                        reason: "successful chunk has no artifact path".into(),
                    });
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Normalize any supported on-disk layout to the current schema version.
///
/// Handled migrations from version 1:
/// - top-level `source_path`/`source_hash`/`source_size` -> `source` object
/// - per-phase `chunks` arrays -> maps keyed by chunk id (positional,
///   starting at the phase's declared base)
/// - top-level `overrides` arrays -> maps keyed by `<phase>.<parameter>`
/// - unrecognized top-level fields -> parked under `legacy`
pub fn canonicalize(doc: Value) -> Value {
    let Value::Object(mut root) = doc else {
        return doc;
    };

    let version = root
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    if version >= SCHEMA_VERSION as u64 {
        return Value::Object(root);
    }

    // source_path/source_hash/source_size -> source object
    if !root.contains_key("source") {
        let path = root.remove("source_path");
        let hash = root.remove("source_hash");
        let size = root.remove("source_size");
        let mime = root.remove("source_mime");
        root.insert(
            "source".into(),
            json!({
                "path": path.unwrap_or(Value::String(String::new())),
                "hash": hash.unwrap_or(Value::String(String::new())),
                "mime": mime.unwrap_or(Value::String("application/octet-stream".into())),
                "size_bytes": size.unwrap_or(Value::from(0)),
            }),
        );
    }

    // Flat chunk arrays -> keyed maps.
    if let Some(Value::Object(phases)) = root.get_mut("phases") {
        for (key, block) in phases.iter_mut() {
            let Some(obj) = block.as_object_mut() else {
                continue;
            };
            match obj.remove("chunks") {
                Some(Value::Array(chunks)) => {
                    let base = PhaseLabel::from_str(key)
                        .map(|l| phase_spec(l).chunk_base)
                        .unwrap_or(0);
                    let mut map = Map::new();
                    for (i, mut chunk) in chunks.into_iter().enumerate() {
                        // A v1 chunk may carry its own id field; positional
                        // assignment wins only when it does not.
                        let id = chunk
                            .get("chunk_id")
                            .and_then(Value::as_u64)
                            .unwrap_or(base as u64 + i as u64);
                        if let Some(c) = chunk.as_object_mut() {
                            c.remove("chunk_id");
                        }
                        map.insert(id.to_string(), chunk);
                    }
                    obj.insert("chunks".into(), Value::Object(map));
                }
                Some(chunks) => {
                    obj.insert("chunks".into(), chunks);
                }
                None => {}
            }
        }
    }

    // Override arrays -> keyed maps.
    match root.remove("overrides") {
        Some(Value::Array(entries)) => {
            let mut map = Map::new();
            for entry in entries {
                let phase = entry
                    .get("target_phase")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let parameter = entry
                    .get("parameter")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                map.insert(format!("{}.{}", phase, parameter), entry);
            }
            root.insert("overrides".into(), Value::Object(map));
        }
        Some(overrides) => {
            root.insert("overrides".into(), overrides);
        }
        None => {}
    }

    // Park anything the current schema does not know under `legacy`.
    const KNOWN: &[&str] = &[
        "schema_version",
        "file_id",
        "source",
        "phases",
        "overrides",
        "runtime",
        "batch_runs",
        "legacy",
    ];
    let unknown: Vec<String> = root
        .keys()
        .filter(|k| !KNOWN.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        let mut parked = Map::new();
        for key in &unknown {
            if let Some(value) = root.remove(key) {
                parked.insert(key.clone(), value);
            }
        }
        match root.get_mut("legacy") {
            Some(Value::Object(legacy)) => legacy.extend(parked),
            _ => {
                root.insert("legacy".into(), Value::Object(parked));
            }
        }
    }

    root.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    Value::Object(root)
}

/// RFC 7386-style merge patch: objects merge recursively, `null` deletes,
/// anything else replaces. Patches that set absolute values are idempotent.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let target_map = target.as_object_mut().unwrap_or_else(|| unreachable!());
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{ChunkRecord, ChunkStatus, PipelineState, SourceInfo};
    use proptest::prelude::*;

    fn base_state() -> PipelineState {
        PipelineState::new(
            "a1b2c3d4e5f60718",
            SourceInfo {
                path: "/books/b.epub".into(),
                hash: "h".into(),
                mime: "application/epub+zip".into(),
                size_bytes: 10,
            },
        )
    }

    #[test]
    fn test_structural_ok_for_fresh_state() {
        assert!(validate_structural(&base_state()).is_ok());
    }

    #[test]
    fn test_structural_rejects_wrong_chunk_base() {
        let mut state = base_state();
        // phase5 (enhance) is declared 1-based; a chunk 0 violates the base.
        state
            .phase_mut(PhaseLabel::Enhance)
            .chunks
            .insert(0, ChunkRecord::default());
        let violations = validate_structural(&state).unwrap_err();
        assert!(violations.iter().any(|v| v.reason.contains("base")));
    }

    #[test]
    fn test_structural_rejects_sparse_chunk_ids() {
        let mut state = base_state();
        let block = state.phase_mut(PhaseLabel::Synthesize);
        block.chunks.insert(0, ChunkRecord::default());
        block.chunks.insert(2, ChunkRecord::default());
        let violations = validate_structural(&state).unwrap_err();
        assert!(violations.iter().any(|v| v.reason.contains("dense")));
    }

    #[test]
    fn test_structural_rejects_chunks_on_unchunked_phase() {
        let mut state = base_state();
        state
            .phase_mut(PhaseLabel::Master)
            .chunks
            .insert(0, ChunkRecord::default());
        assert!(validate_structural(&state).is_err());
    }

    #[test]
    fn test_strict_rejects_success_with_failed_chunk() {
        let mut state = base_state();
        let block = state.phase_mut(PhaseLabel::Synthesize);
        block.status = PhaseStatus::Success;
        block.chunks.insert(
            0,
            ChunkRecord {
                status: ChunkStatus::Failed,
                ..Default::default()
            },
        );
        let violations = validate_strict(&state).unwrap_err();
        assert!(violations.iter().any(|v| v.reason.contains("chunk")));
    }

    #[test]
    fn test_strict_rejects_failed_block_with_all_chunks_usable() {
        let mut state = base_state();
        let block = state.phase_mut(PhaseLabel::Synthesize);
        block.status = PhaseStatus::Failed;
        block.chunks.insert(
            0,
            ChunkRecord {
                status: ChunkStatus::Success,
                artifact_path: Some("a.wav".into()),
                ..Default::default()
            },
        );
        assert!(validate_strict(&state).is_err());
    }

    #[test]
    fn test_strict_rejects_nonfinite_metric() {
        let mut state = base_state();
        let block = state.phase_mut(PhaseLabel::Synthesize);
        block
            .chunks
            .entry(0)
            .or_default()
            .metrics
            .insert("rtf".into(), f64::NAN);
        assert!(validate_strict(&state).is_err());
    }

    #[test]
    fn test_canonicalize_promotes_v1_layout() {
        let v1 = json!({
            "schema_version": 1,
            "file_id": "abc",
            "source_path": "/books/b.epub",
            "source_hash": "h",
            "source_size": 42,
            "narrator_notes": "keep the whale ominous",
            "phases": {
                "phase4": {
                    "status": "running",
                    "chunks": [
                        {"status": "success", "artifact_path": "c0.wav"},
                        {"status": "failed"}
                    ]
                }
            },
            "overrides": [
                {"target_phase": "phase4", "parameter": "engine", "value": "kokoro",
                 "source": "user"}
            ]
        });
        let canon = canonicalize(v1);

        assert_eq!(canon["schema_version"], SCHEMA_VERSION);
        assert_eq!(canon["source"]["path"], "/books/b.epub");
        assert_eq!(canon["source"]["size_bytes"], 42);
        assert_eq!(canon["phases"]["phase4"]["chunks"]["0"]["status"], "success");
        assert_eq!(canon["phases"]["phase4"]["chunks"]["1"]["status"], "failed");
        assert!(canon["overrides"]["phase4.engine"].is_object());
        // Unknown legacy fields are parked, not dropped.
        assert_eq!(canon["legacy"]["narrator_notes"], "keep the whale ominous");
    }

    #[test]
    fn test_canonicalize_respects_enhance_base() {
        let v1 = json!({
            "schema_version": 1,
            "file_id": "abc",
            "phases": {
                "phase5": {
                    "status": "running",
                    "chunks": [{"status": "success"}, {"status": "success"}]
                }
            }
        });
        let canon = canonicalize(v1);
        // 1-based positional assignment for the enhance phase.
        assert!(canon["phases"]["phase5"]["chunks"]["1"].is_object());
        assert!(canon["phases"]["phase5"]["chunks"]["2"].is_object());
        assert!(canon["phases"]["phase5"]["chunks"]["0"].is_null());
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let v1 = json!({
            "schema_version": 1,
            "file_id": "abc",
            "source_path": "p",
            "custom_marker": true,
            "phases": {"phase4": {"status": "pending", "chunks": [{"status": "pending"}]}}
        });
        let once = canonicalize(v1);
        let twice = canonicalize(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_canonicalize_current_version_untouched() {
        let state = base_state();
        let doc = serde_json::to_value(&state).unwrap();
        assert_eq!(canonicalize(doc.clone()), doc);
    }

    #[test]
    fn test_merge_patch_sets_and_deletes() {
        let mut doc = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut doc, &json!({"a": null, "b": {"c": 20}, "e": "new"}));
        assert_eq!(doc, json!({"b": {"c": 20, "d": 3}, "e": "new"}));
    }

    #[test]
    fn test_merge_patch_is_idempotent() {
        let mut doc = json!({"phases": {"phase4": {"status": "running"}}});
        let patch = json!({"phases": {"phase4": {"status": "success", "attempt": 2}}});
        merge_patch(&mut doc, &patch);
        let after_one = doc.clone();
        merge_patch(&mut doc, &patch);
        assert_eq!(doc, after_one);
    }

    proptest! {
        #[test]
        fn prop_canonicalize_idempotent(keys in proptest::collection::vec("[a-z_]{1,12}", 0..6)) {
            let mut root = Map::new();
            root.insert("schema_version".into(), Value::from(1));
            root.insert("file_id".into(), Value::String("abc".into()));
            for (i, key) in keys.iter().enumerate() {
                root.insert(key.clone(), Value::from(i as u64));
            }
            let once = canonicalize(Value::Object(root));
            let twice = canonicalize(once.clone());
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_patch_absolute_idempotent(a in 0u32..100, b in 0u32..100) {
            let mut doc = json!({"x": a});
            let patch = json!({"x": b, "y": {"z": a}});
            merge_patch(&mut doc, &patch);
            let after_one = doc.clone();
            merge_patch(&mut doc, &patch);
            prop_assert_eq!(doc, after_one);
        }
    }
}
