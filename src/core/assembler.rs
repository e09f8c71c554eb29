//! Output assembly
//!
//! Workers finish segments in any order; the [`Assembler`] keeps a reorder buffer
//! and appends each segment to the output once all of its predecessors are
//! settled. It is owned by a single task, so the buffer needs no locking.
//!
//! The output is written to `<name>.part` and only renamed to its final name by
//! [`Assembler::commit`]. Failed or cancelled jobs keep the `.part` file on disk.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use super::error_handling::{AppResult, DownloadError};
use super::models::{partial_path_for, SegmentState, TimeRange};
use super::progress_tracker::ProgressState;
use crate::parsers::{Manifest, SegmentRef};
use crate::utils::file_utils::ensure_dir_exists;

/// Result of processing one scheduled segment
#[derive(Debug)]
pub enum SegmentOutcome {
    Ready(Bytes),
    /// Failed under the best-effort policy; leaves a gap in the output
    Skipped,
}

/// A processed segment tagged with its slot in the work list
#[derive(Debug)]
pub struct CompletedSegment {
    pub position: usize,
    pub outcome: SegmentOutcome,
}

/// Segments whose place on the playlist timeline intersects `range`.
///
/// Trimming is per segment: a segment straddling a boundary is kept whole.
pub fn select_segments(manifest: &Manifest, range: Option<&TimeRange>) -> Vec<SegmentRef> {
    let Some(range) = range.filter(|r| !r.is_unbounded()) else {
        return manifest.segments.clone();
    };

    let mut offset = 0.0;
    let mut selected = Vec::new();
    for segment in &manifest.segments {
        if range.overlaps(offset, segment.duration) {
            selected.push(segment.clone());
        }
        offset += segment.duration;
    }
    selected
}

pub struct Assembler {
    writer: BufWriter<File>,
    partial_path: PathBuf,
    output_path: PathBuf,
    progress: Arc<ProgressState>,
    total: usize,
    next_position: usize,
    pending: BTreeMap<usize, SegmentOutcome>,
    segments_written: usize,
    bytes_written: u64,
}

impl Assembler {
    /// Create (or truncate) `<output_path>.part` for `total` segments
    pub async fn create(
        output_path: PathBuf,
        total: usize,
        progress: Arc<ProgressState>,
    ) -> AppResult<Self> {
        if let Some(parent) = output_path.parent() {
            ensure_dir_exists(parent).await?;
        }
        let partial_path = partial_path_for(&output_path);
        let file = File::create(&partial_path)
            .await
            .map_err(|e| DownloadError::output(&partial_path, e))?;

        debug!("Assembling {} segments into {:?}", total, partial_path);
        Ok(Self {
            writer: BufWriter::new(file),
            partial_path,
            output_path,
            progress,
            total,
            next_position: 0,
            pending: BTreeMap::new(),
            segments_written: 0,
            bytes_written: 0,
        })
    }

    pub fn segments_written(&self) -> usize {
        self.segments_written
    }

    /// Slots before this position are written or skipped
    pub fn settled(&self) -> usize {
        self.next_position
    }

    /// Completions waiting for a predecessor
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Every slot has been written or skipped
    pub fn is_complete(&self) -> bool {
        self.next_position >= self.total
    }

    /// Buffer one completion and flush every segment that is now in order
    pub async fn accept(&mut self, completed: CompletedSegment) -> AppResult<()> {
        if completed.position < self.next_position || completed.position >= self.total {
            debug!("Ignoring out-of-range completion {}", completed.position);
            return Ok(());
        }
        self.pending.insert(completed.position, completed.outcome);

        while let Some(outcome) = self.pending.remove(&self.next_position) {
            match outcome {
                SegmentOutcome::Ready(data) => {
                    self.writer
                        .write_all(&data)
                        .await
                        .map_err(|e| DownloadError::output(&self.partial_path, e))?;
                    self.segments_written += 1;
                    self.bytes_written += data.len() as u64;
                    self.progress
                        .record_written(self.next_position, data.len() as u64);
                }
                SegmentOutcome::Skipped => {
                    self.progress.mark(self.next_position, SegmentState::Skipped);
                }
            }
            self.next_position += 1;
        }
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.writer
            .flush()
            .await
            .map_err(|e| DownloadError::output(&self.partial_path, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| DownloadError::output(&self.partial_path, e))
    }

    /// Flush and move the `.part` file to the final output path
    pub async fn commit(mut self) -> AppResult<PathBuf> {
        self.flush().await?;
        drop(self.writer);

        if tokio::fs::try_exists(&self.output_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&self.output_path)
                .await
                .map_err(|e| DownloadError::output(&self.output_path, e))?;
        }
        tokio::fs::rename(&self.partial_path, &self.output_path)
            .await
            .map_err(|e| DownloadError::output(&self.output_path, e))?;

        info!(
            "Wrote {} segments ({} bytes) to {:?}",
            self.segments_written, self.bytes_written, self.output_path
        );
        Ok(self.output_path)
    }

    /// Flush what was written and leave the `.part` file for inspection
    pub async fn abandon(mut self) -> PathBuf {
        if let Err(err) = self.flush().await {
            tracing::warn!("Failed to flush partial output: {}", err);
        }
        info!(
            "Keeping incomplete output {:?} ({} segments)",
            self.partial_path, self.segments_written
        );
        self.partial_path
    }
}

/// Single-writer loop: drain completions into the assembler until the channel
/// closes or a write fails. Each slot that settles hands one permit back to
/// `window`, letting workers claim further segments. A write failure closes
/// `window` so no worker waits on it.
pub async fn run_assembler(
    mut assembler: Assembler,
    mut rx: mpsc::Receiver<CompletedSegment>,
    window: Arc<Semaphore>,
) -> (Assembler, AppResult<()>) {
    while let Some(completed) = rx.recv().await {
        let before = assembler.settled();
        let accepted = assembler.accept(completed).await;
        window.add_permits(assembler.settled() - before);
        if let Err(err) = accepted {
            window.close();
            return (assembler, Err(err));
        }
    }
    (assembler, Ok(()))
}
