//! Session persistence.
//!
//! Each run gets its own directory under the history root:
//! - `history.csv`: append-only, one row per history point
//! - `snapshot.json`: full state, written at open and then rewritten
//!   atomically on the save cadence
//! - `chart.svg`: bandwidth chart, rendered with the snapshot
//!
//! Rows are appended as soon as the store has them; the structured file is
//! never rewritten per point. File I/O runs on the blocking pool.

use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::plot::PlotRenderer;
use crate::state::SharedStore;
use crate::types::{HistoryPoint, Snapshot};

pub const CSV_HEADER: &str = "elapsed_seconds,download_mbps,upload_mbps";
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Contents of `snapshot.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub version: u32,
    pub session: String,
    pub started_at: String,
    pub saved_at: String,
    pub uptime_secs: f64,
    pub snapshot: Snapshot,
}

/// `<identity>_<YYYY-mm-dd_HH-MM-SS>`, with characters that are awkward in
/// file names replaced by `_`.
pub fn session_key(identity: &str, started: &DateTime<Local>) -> String {
    let clean: String = identity
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let clean = if clean.is_empty() { "Unknown".to_string() } else { clean };
    format!("{}_{}", clean, started.format("%Y-%m-%d_%H-%M-%S"))
}

pub struct SessionWriter {
    key: String,
    dir: PathBuf,
    started_at: DateTime<Local>,
    csv: File,
    // Bytes of `history.csv` that hold complete rows.
    csv_len: u64,
}

impl SessionWriter {
    /// Create the session directory, the CSV log with its header and an
    /// initial `snapshot.json` holding `initial`.
    pub fn create(
        root: &Path,
        identity: &str,
        started_at: DateTime<Local>,
        initial: &Snapshot,
    ) -> Result<Self, EngineError> {
        let key = session_key(identity, &started_at);
        let mut dir = root.join(&key);
        // Two runs in the same second on the same link get distinct dirs.
        let mut n = 1;
        while dir.exists() {
            dir = root.join(format!("{key}-{n}"));
            n += 1;
        }
        fs::create_dir_all(&dir).map_err(|source| EngineError::SessionDir {
            path: dir.clone(),
            source,
        })?;

        let csv_path = dir.join("history.csv");
        let open = || -> io::Result<(File, u64)> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&csv_path)?;
            file.write_all(format!("{CSV_HEADER}\n").as_bytes())?;
            let len = file.metadata()?.len();
            Ok((file, len))
        };
        let (csv, csv_len) = open().map_err(|source| EngineError::SessionFile {
            path: csv_path.clone(),
            source,
        })?;

        let mut writer = Self {
            key,
            dir,
            started_at,
            csv,
            csv_len,
        };
        writer
            .write_snapshot(initial, Duration::ZERO)
            .map_err(|source| EngineError::SessionFile {
                path: writer.snapshot_path(),
                source,
            })?;
        Ok(writer)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join("history.csv")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    /// Append rows and push them to the OS in one write. On failure the
    /// file is cut back to its last complete row, so a retry of the same
    /// points cannot duplicate them.
    pub fn append(&mut self, points: &[HistoryPoint]) -> io::Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut batch = String::with_capacity(points.len() * 24);
        for p in points {
            let _ = writeln!(
                batch,
                "{:.2},{:.3},{:.3}",
                p.elapsed_seconds, p.download_mbps, p.upload_mbps
            );
        }
        match self.csv.write_all(batch.as_bytes()) {
            Ok(()) => {
                self.csv_len += batch.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(t) = self.csv.set_len(self.csv_len) {
                    debug!(error = %t, "cannot truncate partial history rows");
                }
                Err(e)
            }
        }
    }

    /// Write `snapshot.json` via a temp file and rename, so readers only
    /// ever see a complete file.
    pub fn write_snapshot(&mut self, snapshot: &Snapshot, uptime: Duration) -> io::Result<PathBuf> {
        let file = SessionFile {
            version: SESSION_FORMAT_VERSION,
            session: self.key.clone(),
            started_at: self.started_at.to_rfc3339(),
            saved_at: Local::now().to_rfc3339(),
            uptime_secs: uptime.as_secs_f64(),
            snapshot: snapshot.clone(),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;
        let path = self.snapshot_path();
        let tmp = self.dir.join("snapshot.json.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        // Make the CSV durable alongside the snapshot.
        self.csv.sync_data()?;
        Ok(path)
    }
}

pub fn read_session_file(path: &Path) -> io::Result<SessionFile> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[derive(Debug, Clone, Copy)]
pub struct PersistenceConfig {
    /// Full snapshot + chart cadence.
    pub save_interval: Duration,
    /// How often new history points are drained into the CSV.
    pub poll_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What the persistence task did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistenceReport {
    pub rows_written: u64,
    pub full_writes: u64,
    pub failed_writes: u64,
    /// Points evicted from the store before they reached the CSV.
    pub missed_points: u64,
}

struct Persister {
    store: SharedStore,
    writer: SessionWriter,
    renderer: Arc<dyn PlotRenderer>,
    cursor: u64,
    report: PersistenceReport,
}

impl Persister {
    fn drain(&mut self) {
        let delta = self.store.history_since(self.cursor);
        if delta.missed > 0 {
            warn!(missed = delta.missed, "history points evicted before persisting");
            self.report.missed_points += delta.missed;
        }
        if delta.points.is_empty() {
            self.cursor = delta.cursor;
            return;
        }
        match self.writer.append(&delta.points) {
            Ok(()) => {
                self.cursor = delta.cursor;
                self.report.rows_written += delta.points.len() as u64;
            }
            // Cursor stays put so the rows are retried next cycle.
            Err(e) => warn!(error = %e, "appending history rows failed"),
        }
    }

    fn full_flush(&mut self) {
        self.drain();
        let snap = self.store.read();
        match self.writer.write_snapshot(&snap, self.store.elapsed()) {
            Ok(path) => {
                self.report.full_writes += 1;
                debug!(path = %path.display(), points = snap.history.len(), "snapshot saved");
            }
            Err(e) => {
                self.report.failed_writes += 1;
                warn!(error = %e, "writing snapshot failed");
            }
        }
        let title = format!("Network Speed Telemetry - {}", snap.link.name);
        if let Err(e) = self.renderer.render(&snap.history, &title, self.writer.dir()) {
            warn!(error = %e, "rendering chart failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Drain,
    Flush,
}

impl Persister {
    fn run(&mut self, step: Step) {
        match step {
            Step::Drain => self.drain(),
            Step::Flush => self.full_flush(),
        }
    }
}

// Hand the persister to the blocking pool for one step and take it back.
async fn on_blocking(mut p: Persister, step: Step) -> Result<Persister, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        p.run(step);
        p
    })
    .await
}

/// Run the persistence loop until `cancel` fires, then do one final flush.
pub fn spawn_persistence(
    store: SharedStore,
    writer: SessionWriter,
    renderer: Arc<dyn PlotRenderer>,
    cfg: PersistenceConfig,
    cancel: CancellationToken,
) -> JoinHandle<PersistenceReport> {
    tokio::spawn(async move {
        let mut p = Persister {
            store,
            writer,
            renderer,
            cursor: 0,
            report: PersistenceReport::default(),
        };
        info!(dir = %p.writer.dir().display(), "session opened");

        let mut poll = interval_at(Instant::now() + cfg.poll_interval, cfg.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut save = interval_at(Instant::now() + cfg.save_interval, cfg.save_interval);
        save.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last = p.report;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = save.tick() => Step::Flush,
                _ = poll.tick() => Step::Drain,
            };
            p = match on_blocking(p, step).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "persistence step panicked");
                    return last;
                }
            };
            last = p.report;
        }

        match on_blocking(p, Step::Flush).await {
            Ok(p) => {
                info!(
                    rows = p.report.rows_written,
                    snapshots = p.report.full_writes,
                    "session closed"
                );
                p.report
            }
            Err(e) => {
                warn!(error = %e, "final flush panicked");
                last
            }
        }
    })
}
