//! Progress/Download Bridge (§4.D).
//!
//! Wraps a cancellable download in progress: the download itself is the
//! model-family factory's concern (out of scope, §1), but the Worker owns
//! pumping its fractional progress into a [`ProgressStream`] and tying its
//! cancellation to the Launching Guard's flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kiln_common::WorkerError;

use crate::progress::ProgressStream;

/// Shared between the Launching Guard entry and whatever drives the actual
/// byte-level download — both observe the same cancellation flag.
#[derive(Clone)]
pub struct DownloaderHandle {
    cancel: CancellationToken,
    /// Progress as a fixed-point permille (0-1000), so it can live in an
    /// `AtomicU64` without a lock.
    progress_permille: Arc<AtomicU64>,
    done: Arc<AtomicBool>,
}

impl DownloaderHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress_permille: Arc::new(AtomicU64::new(0)),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the download. Safe to call at any time the Launching Guard
    /// entry exists (§5 cancellation semantics).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Called by the downloading side to report fractional progress
    /// (0.0-1.0) within the download stage.
    pub fn report_progress(&self, fraction: f64) {
        let permille = (fraction.clamp(0.0, 1.0) * 1000.0) as u64;
        self.progress_permille.store(permille, Ordering::Relaxed);
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn fraction(&self) -> f64 {
        self.progress_permille.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Surface a cancellation as the spec's synthesized error.
    pub fn raise_cancelled(&self) -> WorkerError {
        WorkerError::Cancelled("Launch cancelled".to_string())
    }
}

/// Cooperative polling loop: while the handle is not done, read fractional
/// progress and forward it into `stream`; sleep 1s; on done, push `1.0`
/// labeled "Start to load model" (§4.D).
pub async fn pump_download_progress(handle: &DownloaderHandle, stream: &mut ProgressStream) {
    loop {
        if handle.is_cancelled() {
            return;
        }
        if handle.is_done() {
            stream.set_progress(1.0, Some("Start to load model"));
            return;
        }
        stream.set_progress(handle.fraction(), None);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pump_stops_on_cancel() {
        let handle = DownloaderHandle::new(CancellationToken::new());
        let mut stream = ProgressStream::download_load();
        handle.cancel();
        pump_download_progress(&handle, &mut stream).await;
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn pump_reaches_done_label() {
        let handle = DownloaderHandle::new(CancellationToken::new());
        handle.mark_done();
        let mut stream = ProgressStream::download_load();
        pump_download_progress(&handle, &mut stream).await;
        assert_eq!(stream.label.as_deref(), Some("Start to load model"));
    }
}
