//! Request completion and run finalization.
//!
//! A run is moved by several requests that complete independently, possibly
//! on different threads and in any order. Each completion hands its buffers
//! back to the run and drops the pending count; whichever completion brings
//! the count to zero runs the terminal action, exactly once.

use crate::error::ErrorKind;
use crate::io::{IoRequest, Payload};
use crate::run::{CompressedRun, Direction, RunOutcome, RunState};
use crate::stride::fail_targets;
use crate::{Error, Result};
use std::sync::atomic::Ordering;

impl IoRequest {
    /// Report the end of the transfer. Consumes the request.
    pub fn end_io(self, status: Result<()>) {
        let ok = status.is_ok();
        let sector = self.sector();
        match self.payload {
            Payload::Cache(segments) => {
                if let Err(e) = &status {
                    tracing::warn!(sector, pages = segments.len(), error = %e, "read failed");
                }
                for seg in segments {
                    if ok {
                        seg.page.set_uptodate();
                    } else {
                        seg.page.set_error();
                    }
                    seg.page.unlock();
                }
            }
            Payload::Run { run, mut pages } => {
                for (_, buf) in &mut pages {
                    buf.mark_io(ok);
                }
                run.complete_unit(pages, status);
            }
        }
    }
}

impl CompressedRun {
    /// Return a completed unit's buffers and drop the pending count.
    pub(crate) fn complete_unit(&self, pages: Vec<(usize, crate::PageBuf)>, status: Result<()>) {
        {
            let mut slots = self.slots.lock();
            for (slot, buf) in pages {
                if let Some(entry) = slots.get_mut(slot) {
                    *entry = Some(buf);
                }
            }
        }
        if let Err(e) = status {
            tracing::warn!(ino = self.ino(), start = self.start_index(), error = %e, "run unit failed");
            self.record_failure(e.kind());
        }

        match self.pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
            Ok(1) => self.finish(),
            Ok(remaining) => {
                tracing::trace!(start = self.start_index(), pending = remaining - 1, "run unit complete");
            }
            Err(_) => {
                tracing::error!(start = self.start_index(), "completion without an issued unit");
            }
        }
    }

    /// Fail a run before any of its units was issued.
    ///
    /// Used when buffers or requests cannot be allocated; the terminal
    /// action runs immediately so claimed pages are released.
    pub fn abort(&self, err: &Error) {
        self.record_failure(err.kind());
        if self.pending.load(Ordering::Acquire) == 0 && self.state() == RunState::Created {
            self.finish();
        } else {
            tracing::error!(start = self.start_index(), error = %err, "abort after issuing I/O");
        }
    }

    fn record_failure(&self, kind: ErrorKind) {
        self.failure.lock().get_or_insert(kind);
    }

    fn finish(&self) {
        self.set_state(RunState::Complete);
        let failure = *self.failure.lock();

        let outcome = match (self.direction(), failure) {
            (Direction::Read, Some(kind)) => {
                fail_targets(self);
                RunOutcome::Failed(kind)
            }
            (Direction::Write, Some(kind)) => RunOutcome::Failed(kind),
            (Direction::Read, None) => match self.compressor.decompress_stride(self) {
                Ok(pages) => RunOutcome::Decompressed { pages },
                Err(e) => RunOutcome::Failed(e.kind()),
            },
            (Direction::Write, None) => RunOutcome::Written,
        };

        self.slots.lock().iter_mut().for_each(|slot| *slot = None);
        tracing::debug!(ino = self.ino(), start = self.start_index(), ?outcome, "run finished");
        self.publish(outcome);
    }
}
