// boreas_sim/src/diagnostics.rs
//
// One-way diagnostics channel. The runner pushes an owned snapshot after
// every RECORD; consumers (live plotters, progress printers) read on their
// own schedule and can never touch the ensemble. Emission is non-blocking:
// a slow or absent consumer costs dropped snapshots, never a stalled cycle.

use boreas_core::types::{ObsIndex, StepIndex};
use nalgebra::DVector;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forecast,
    Analysis,
}

/// Owned copy of the per-step diagnostics, safe to ship across threads.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub k: StepIndex,
    pub ko: Option<ObsIndex>,
    pub t: f64,
    pub phase: Phase,
    pub ensemble_mean: DVector<f64>,
    pub spread: f64,
    pub rmse: f64,
}

pub trait DiagnosticsSink: Send + Sync {
    /// Must not block; dropping the snapshot is acceptable.
    fn emit(&self, snapshot: StepSnapshot);
}

/// Discards everything. The default for batch runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn emit(&self, _snapshot: StepSnapshot) {}
}

/// Bounded channel sink. `try_send` keeps the producer non-blocking; when
/// the buffer is full or the consumer hung up, the snapshot is dropped.
pub struct ChannelSink {
    tx: SyncSender<StepSnapshot>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<StepSnapshot>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        (ChannelSink { tx }, rx)
    }
}

impl DiagnosticsSink for ChannelSink {
    fn emit(&self, snapshot: StepSnapshot) {
        match self.tx.try_send(snapshot) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
