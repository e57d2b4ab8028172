//! Download progress as a lazy, finite stream.
//!
//! Backed by a watch channel: a slow consumer skips intermediate updates but
//! always observes the latest value, so the download never waits on it. The
//! stream ends when the download finishes and the reporter is dropped.

use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

impl ProgressUpdate {
    pub fn is_complete(&self) -> bool {
        self.bytes_downloaded == self.bytes_total
    }
}

#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn report(&self, bytes_downloaded: u64, bytes_total: u64) {
        self.tx.send_replace(ProgressUpdate {
            bytes_downloaded,
            bytes_total,
        });
    }

    /// Terminal update. Consumes the reporter so the stream ends after it.
    pub fn finish(self, bytes_total: u64) {
        self.report(bytes_total, bytes_total);
    }
}

/// Stream of progress updates. Not restartable once consumed.
pub struct DownloadProgress {
    inner: WatchStream<ProgressUpdate>,
}

impl Stream for DownloadProgress {
    type Item = ProgressUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub fn progress_channel() -> (ProgressReporter, DownloadProgress) {
    let (tx, rx) = watch::channel(ProgressUpdate::default());
    // Only changes are yielded; an unseen value is still delivered after the
    // reporter has gone.
    (
        ProgressReporter { tx },
        DownloadProgress {
            inner: WatchStream::from_changes(rx),
        },
    )
}
