// sharewatch/src/ingest/accumulator.rs
//
// Mirrors the new tail of the external, rotating access log into a private
// append-only buffer and remembers how far it got.
//
// Files (all inside data_dir):
//   access_buffer.log     accepted-connection lines copied from the source
//   access_buffer.offset  decimal byte offset into the source log
//
// Guarantees:
//   - Only '\n'-terminated lines are consumed. A half-written tail line stays
//     in the source and is picked up whole on the next pass.
//   - The checkpoint is written after the lines are appended. A crash between
//     the two re-copies that batch on restart (at-least-once, not exactly-once).
//   - A source smaller than the checkpoint means rotation/truncation; reading
//     restarts at byte 0.
//   - Pruning rewrites the buffer through a temp file + rename while holding
//     the same lock the append pass takes, so neither sees a torn file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::ingest::record::RecordParser;
use crate::scheduler::{PeriodicTask, Shutdown};

const FLUSH_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulateOutcome {
    pub appended: usize,   // lines written to the buffer
    pub skipped:  usize,   // complete lines that were not accepted records
    pub offset:   u64,     // checkpoint after the pass
    pub rotated:  bool,
}

pub struct LogAccumulator {
    source:          PathBuf,
    buffer:          PathBuf,
    checkpoint:      PathBuf,
    parser:          RecordParser,
    retention:       Option<Duration>,
    save_interval:   std::time::Duration,
    cleanup_every:   std::time::Duration,
    cleanup_delay:   std::time::Duration,
    clock:           SharedClock,
    offset:          AtomicU64,
    buffer_lock:     Mutex<()>,
    shutdown:        Shutdown,
}

impl LogAccumulator {
    pub fn new(config: &Config, clock: SharedClock) -> Self {
        Self {
            source:        config.source_log_path.clone(),
            buffer:        config.buffer_path(),
            checkpoint:    config.checkpoint_path(),
            parser:        RecordParser::new(config.log_offset()),
            retention:     config.retention(),
            save_interval: config.save_interval(),
            cleanup_every: config.cleanup_interval(),
            cleanup_delay: config.cleanup_initial_delay(),
            clock,
            offset:        AtomicU64::new(0),
            buffer_lock:   Mutex::new(()),
            shutdown:      Shutdown::new(),
        }
    }

    pub fn buffer_path(&self) -> &Path { &self.buffer }

    pub fn offset(&self) -> u64 { self.offset.load(Ordering::Acquire) }

    // ── Checkpoint ────────────────────────────────────────────────────────────

    /// Read the persisted offset; absent or unreadable means start from 0.
    pub async fn load_checkpoint(&self) -> u64 {
        let offset = match tokio::fs::read_to_string(&self.checkpoint).await {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(v)  => v,
                Err(e) => {
                    warn!(path = %self.checkpoint.display(), "unreadable checkpoint ({}), starting at 0", e);
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %self.checkpoint.display(), "checkpoint read failed ({}), starting at 0", e);
                0
            }
        };
        self.offset.store(offset, Ordering::Release);
        info!(offset, "accumulator checkpoint loaded");
        offset
    }

    async fn persist_checkpoint(&self, offset: u64) -> Result<()> {
        let tmp = self.checkpoint.with_extension("offset.tmp");
        tokio::fs::write(&tmp, offset.to_string()).await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.checkpoint).await
            .with_context(|| format!("renaming into {}", self.checkpoint.display()))?;
        Ok(())
    }

    // ── Append pass ───────────────────────────────────────────────────────────

    pub async fn accumulate_new_lines(&self) -> Result<AccumulateOutcome> {
        let _guard = self.buffer_lock.lock().await;

        let mut src = File::open(&self.source).await
            .with_context(|| format!("opening source log {}", self.source.display()))?;
        let size = src.metadata().await?.len();

        let mut outcome = AccumulateOutcome { offset: self.offset(), ..Default::default() };
        if size < outcome.offset {
            warn!(size, checkpoint = outcome.offset, "source log shrank, assuming rotation");
            outcome.offset  = 0;
            outcome.rotated = true;
        }
        if size <= outcome.offset {
            if outcome.rotated { self.commit_offset(0).await; }
            debug!(size, "no new data in source log");
            return Ok(outcome);
        }

        src.seek(SeekFrom::Start(outcome.offset)).await?;
        let mut reader = BufReader::new(src);
        let mut out = OpenOptions::new().create(true).append(true).open(&self.buffer).await
            .with_context(|| format!("opening buffer {}", self.buffer.display()))?;

        let mut raw      = Vec::with_capacity(512);
        let mut batch    = String::with_capacity(FLUSH_BYTES);
        let mut consumed = 0u64;
        loop {
            raw.clear();
            let n = reader.read_until(b'\n', &mut raw).await?;
            if n == 0 || raw.last() != Some(&b'\n') { break; }
            consumed += n as u64;

            let text = String::from_utf8_lossy(&raw);
            let line = text.trim();
            if line.is_empty() { continue; }
            if self.parser.parse(line).is_none() {
                outcome.skipped += 1;
                continue;
            }
            batch.push_str(line);
            batch.push('\n');
            outcome.appended += 1;

            if batch.len() >= FLUSH_BYTES {
                out.write_all(batch.as_bytes()).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() { out.write_all(batch.as_bytes()).await?; }
        out.flush().await?;

        outcome.offset += consumed;
        self.commit_offset(outcome.offset).await;

        info!(
            appended = outcome.appended,
            skipped  = outcome.skipped,
            offset   = outcome.offset,
            "accumulated new access log lines"
        );
        Ok(outcome)
    }

    /// The in-memory offset always advances; a failed write is logged and the
    /// next successful pass persists the newer value.
    async fn commit_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
        if let Err(e) = self.persist_checkpoint(offset).await {
            error!(offset, "checkpoint write failed: {:#}", e);
        }
    }

    // ── Pruning ───────────────────────────────────────────────────────────────

    /// Drop buffer lines older than the retention window. Lines without a
    /// readable timestamp are kept. Returns how many lines were removed.
    pub async fn cleanup_old_lines(&self) -> Result<usize> {
        let Some(retention) = self.retention else { return Ok(0) };
        let _guard = self.buffer_lock.lock().await;

        let file = match File::open(&self.buffer).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("opening buffer {}", self.buffer.display())),
        };

        let cutoff  = self.clock.now() - retention;
        let tmp     = self.buffer.with_extension("log.tmp");
        let mut out = File::create(&tmp).await
            .with_context(|| format!("creating {}", tmp.display()))?;

        let mut lines   = BufReader::new(file).lines();
        let mut kept    = String::with_capacity(FLUSH_BYTES);
        let mut removed = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() { continue; }
            match self.parser.line_timestamp(&line) {
                Some(ts) if ts < cutoff => { removed += 1; continue; }
                _ => {}
            }
            kept.push_str(&line);
            kept.push('\n');
            if kept.len() >= FLUSH_BYTES {
                out.write_all(kept.as_bytes()).await?;
                kept.clear();
            }
        }
        out.write_all(kept.as_bytes()).await?;
        out.sync_all().await?;
        drop(out);

        tokio::fs::rename(&tmp, &self.buffer).await
            .with_context(|| format!("replacing buffer {}", self.buffer.display()))?;
        info!(removed, cutoff = %cutoff, "pruned access buffer");
        Ok(removed)
    }

    // ── Background tasks ──────────────────────────────────────────────────────

    /// Load the checkpoint, then accumulate every save interval.
    pub async fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.load_checkpoint().await;
        let this = Arc::clone(&self);
        PeriodicTask::new("accumulator", self.save_interval)
            .run_immediately()
            .spawn(self.shutdown.subscribe(), move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.accumulate_new_lines().await {
                        warn!("accumulation skipped: {:#}", e);
                    }
                }
            })
    }

    /// Prune after the initial delay, then every cleanup interval.
    pub fn start_cleanup_service(self: Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(&self);
        PeriodicTask::new("buffer-cleanup", self.cleanup_every)
            .with_initial_delay(self.cleanup_delay)
            .run_immediately()
            .spawn(self.shutdown.subscribe(), move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.cleanup_old_lines().await {
                        error!("buffer cleanup failed: {:#}", e);
                    }
                }
            })
    }

    /// Signal both background tasks to exit. Safe to call more than once.
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("accumulator stopping");
        }
    }
}
