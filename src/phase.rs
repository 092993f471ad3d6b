//! Phase coordination between photo processing and cloud uploads.
//!
//! The system is in exactly one of two phases. During PROCESSING the worker
//! pool runs and the upload drainer waits; after a full batch of photos the
//! phases flip, the drainer empties the queue, and processing resumes. The
//! alternation gives the remote client a quiet window to refresh itself and
//! keeps network retries from contending with image I/O.
//!
//! Workers claim a slot with [`PhaseCoordinator::begin_photo`] before taking
//! a job and report every finished photo (success or error) through
//! `on_processed`; a claim that found no job is released with
//! `cancel_photo`. The claim count is what makes the phases truly exclusive:
//! a switch to UPLOADING only signals the drainer once no claim is
//! outstanding, so the drainer is never inside an upload while a worker has
//! a photo mid-pipeline or an `on_processed` report still pending. The
//! drainer gates on `should_upload` and hands the system back with
//! `on_uploads_complete`.

use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::sync::FlagEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Processing,
    Uploading,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Processing => "processing",
            Phase::Uploading => "uploading",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub in_batch: usize,
    pub in_flight: usize,
    pub batch_size: usize,
    pub batches_done: usize,
}

struct Inner {
    phase: Phase,
    in_batch: usize,
    /// Claims taken by workers that have not yet reported back.
    in_flight: usize,
    batches_done: usize,
}

pub struct PhaseCoordinator {
    inner: Mutex<Inner>,
    batch_size: usize,
    processing_allowed: FlagEvent,
    uploading_allowed: FlagEvent,
}

impl PhaseCoordinator {
    pub fn new(batch_size: usize) -> Self {
        info!(batch_size, "phase coordinator starting in PROCESSING");
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Processing,
                in_batch: 0,
                in_flight: 0,
                batches_done: 0,
            }),
            batch_size: batch_size.max(1),
            processing_allowed: FlagEvent::new(true),
            uploading_allowed: FlagEvent::new(false),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn status(&self) -> PhaseStatus {
        let inner = self.inner.lock().unwrap();
        PhaseStatus {
            phase: inner.phase,
            in_batch: inner.in_batch,
            in_flight: inner.in_flight,
            batch_size: self.batch_size,
            batches_done: inner.batches_done,
        }
    }

    /// Block until processing is allowed or `timeout` elapses. A true
    /// return registers the caller as in-flight: it must be paired with
    /// exactly one `on_processed` (photo finished, success or error) or
    /// `cancel_photo` (no job was available).
    ///
    /// The phase re-check happens under the state lock, so a claim can
    /// never slip in behind a concurrent switch to UPLOADING.
    pub fn begin_photo(&self, timeout: Duration) -> bool {
        if !self.processing_allowed.wait_timeout(timeout) {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Processing {
            return false;
        }
        inner.in_flight += 1;
        true
    }

    /// Release a claim that never turned into a photo.
    pub fn cancel_photo(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        self.signal_uploading_if_quiet(&inner);
    }

    /// Record one finished photo (success or error both count) and release
    /// the claim. Flips to UPLOADING once the batch is full; the drainer is
    /// only woken when no other photo is still in flight.
    pub fn on_processed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_batch += 1;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.phase == Phase::Processing && inner.in_batch >= self.batch_size {
            self.switch_to_uploading_locked(&mut inner, "batch limit reached");
        }
        self.signal_uploading_if_quiet(&inner);
    }

    /// Force the switch to UPLOADING when work has dried up with a partial
    /// batch. Returns true if a flush actually happened. The drainer signal
    /// still waits for outstanding claims to settle.
    pub fn flush_if_idle(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase != Phase::Processing || inner.in_batch == 0 {
            return false;
        }
        info!(
            in_batch = inner.in_batch,
            batch_size = self.batch_size,
            "flushing partial batch to upload phase"
        );
        self.switch_to_uploading_locked(&mut inner, "idle flush");
        self.signal_uploading_if_quiet(&inner);
        true
    }

    /// Must be called with the state lock held.
    fn switch_to_uploading_locked(&self, inner: &mut Inner, reason: &str) {
        if inner.phase == Phase::Uploading {
            return;
        }
        inner.phase = Phase::Uploading;
        self.processing_allowed.clear();
        info!(
            in_batch = inner.in_batch,
            in_flight = inner.in_flight,
            reason,
            "=== PHASE SWITCH: PROCESSING -> UPLOADING ==="
        );
    }

    /// Wake the drainer only when uploading is the active phase and every
    /// claim has been resolved.
    fn signal_uploading_if_quiet(&self, inner: &Inner) {
        if inner.phase == Phase::Uploading && inner.in_flight == 0 {
            self.uploading_allowed.set();
        }
    }

    /// Block until uploading is allowed or `timeout` elapses.
    pub fn should_upload(&self, timeout: Duration) -> bool {
        self.uploading_allowed.wait_timeout(timeout)
    }

    /// The drainer finished: reset the batch and resume processing.
    pub fn on_uploads_complete(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.batches_done += 1;
            inner.in_batch = 0;
            inner.phase = Phase::Processing;
            info!(batch = inner.batches_done, "=== PHASE SWITCH: UPLOADING -> PROCESSING ===");
        }
        self.uploading_allowed.clear();
        self.processing_allowed.set();
    }
}
