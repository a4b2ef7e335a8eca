//! Append-only structured telemetry log.
//!
//! One JSON record per line, appended to a daily file under
//! `.pipeline/telemetry/YYYYMMDD.log`. Files are never rewritten; the
//! advisor aggregates on read. Rotation is keyed off each record's own
//! timestamp rather than a process-wide clock, so tests can pin time and
//! concurrent appenders agree on the target file.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::errors::PipelineError;
use crate::phase::PhaseLabel;

/// Event discriminator of a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    PhaseStart,
    PhaseEnd,
    PhaseRetry,
    Failure,
    Recommendation,
    OverrideApplied,
    SafetyBlocked,
    RepairAttempt,
    RepairApplied,
    RunStart,
    RunEnd,
}

/// Host load sampled at event time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HostLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// One structured telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseLabel>,
    pub event: TelemetryEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub host_load: HostLoad,
}

impl TelemetryRecord {
    /// Record with the current wall clock and no host sample; the sink
    /// fills `host_load` on append.
    pub fn new(file_id: impl Into<String>, event: TelemetryEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            file_id: file_id.into(),
            phase: None,
            event,
            status: None,
            duration_ms: None,
            engine: None,
            metrics: BTreeMap::new(),
            detail: None,
            host_load: HostLoad::default(),
        }
    }

    pub fn with_phase(mut self, phase: PhaseLabel) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Daily-rotating telemetry sink.
///
/// Appends are O_APPEND writes of single lines, so concurrent batch workers
/// can share a sink directory without interleaving corruption.
pub struct TelemetrySink {
    dir: PathBuf,
    system: Mutex<System>,
}

impl TelemetrySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{}.log", timestamp.format("%Y%m%d")))
    }

    fn sample_host_load(&self) -> HostLoad {
        let Ok(mut system) = self.system.lock() else {
            return HostLoad::default();
        };
        system.refresh_cpu_usage();
        system.refresh_memory();
        let total = system.total_memory();
        let memory_percent = if total > 0 {
            (system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        HostLoad {
            cpu_percent: system.global_cpu_usage(),
            memory_percent,
        }
    }

    /// Sample host load and append the record as one line.
    pub fn append(&self, mut record: TelemetryRecord) -> Result<(), PipelineError> {
        record.host_load = self.sample_host_load();
        self.append_raw(&record)
    }

    /// Append without sampling; used when the caller already filled
    /// `host_load` or wants deterministic records in tests.
    pub fn append_raw(&self, record: &TelemetryRecord) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| PipelineError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.file_for(&record.timestamp);
        let mut line =
            serde_json::to_string(record).map_err(|e| PipelineError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| PipelineError::Io { path, source })
    }

    /// Read every record from the most recent `days` daily files, oldest
    /// first. Unparseable lines are skipped; the log is diagnostic data,
    /// not a source of truth.
    pub fn read_window(&self, days: usize) -> Result<Vec<TelemetryRecord>, PipelineError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|source| PipelineError::Io {
                path: self.dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
            .collect();
        files.sort();
        let keep = files.len().saturating_sub(days);
        let mut records = Vec::new();
        for file in &files[keep..] {
            let content = std::fs::read_to_string(file).map_err(|source| PipelineError::Io {
                path: file.clone(),
                source,
            })?;
            records.extend(
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str::<TelemetryRecord>(line).ok()),
            );
        }
        Ok(records)
    }
}
