//! Scalar event log for plotting training curves.
//!
//! Each record is one JSON line in `events.jsonl`, so a run directory can be
//! tailed while training or loaded into any plotting tool afterwards.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f32,
    pub wall_time: f64,
}

/// Seconds since the unix epoch, with microsecond resolution.
fn wall_time_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

pub struct EventWriter {
    log_dir: Option<PathBuf>,
    out: Option<BufWriter<File>>,
}

impl EventWriter {
    /// Opens `<log_dir>/events.jsonl`, defaulting to `runs/<timestamp>`.
    pub fn create(log_dir: Option<&Path>) -> anyhow::Result<Self> {
        let log_dir = match log_dir {
            Some(dir) => dir.to_path_buf(),
            None => Path::new("runs").join(chrono::Local::now().format("%b%d_%H-%M-%S").to_string()),
        };
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
        let path = log_dir.join(EVENTS_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        tracing::info!(path = %path.display(), "writing scalar events");
        Ok(Self {
            log_dir: Some(log_dir),
            out: Some(BufWriter::new(file)),
        })
    }

    /// A writer that drops every event.
    pub fn disabled() -> Self {
        Self {
            log_dir: None,
            out: None,
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> anyhow::Result<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let wall_time = wall_time_secs();
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time,
        };
        serde_json::to_writer(&mut *out, &event)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("failed to flush event log: {e}");
        }
    }
}

/// Reads every event from a run directory.
pub fn read_events(log_dir: &Path) -> anyhow::Result<Vec<ScalarEvent>> {
    let path = log_dir.join(EVENTS_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}
