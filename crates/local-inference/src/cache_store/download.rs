//! Single-file HTTP fetch with in-attempt resume.
//!
//! A dropped connection is retried from the bytes already written, using a
//! `Range` request. A server that ignores the range (answers 200) restarts the
//! file from zero.

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::progress::ProgressReporter;
use crate::error::{LifecycleError, Result};

pub const MAX_RESUME_ATTEMPTS: u32 = 3;

/// Running byte count across all files of one variant.
pub struct ByteCounter<'a> {
    pub done: u64,
    pub total: u64,
    pub reporter: Option<&'a ProgressReporter>,
}

impl ByteCounter<'_> {
    fn add(&mut self, n: u64) {
        self.done += n;
        self.publish();
    }

    fn sub(&mut self, n: u64) {
        self.done = self.done.saturating_sub(n);
        self.publish();
    }

    fn publish(&self) {
        if let Some(r) = self.reporter {
            r.report(self.done.min(self.total), self.total);
        }
    }
}

pub async fn fetch_file(
    client: &reqwest::Client,
    variant_id: &str,
    url: &str,
    dest: &Path,
    counter: &mut ByteCounter<'_>,
) -> Result<u64> {
    let mut attempt = 0;
    let mut written: u64 = 0;

    loop {
        let mut request = client.get(url);
        if written > 0 {
            request = request.header(RANGE, format!("bytes={}-", written));
        }

        let outcome = match request.send().await {
            Ok(resp) => stream_response(resp, variant_id, url, dest, &mut written, counter).await,
            Err(e) => Err(Interrupted(e.to_string())),
        };

        match outcome {
            Ok(()) => {
                debug!("Fetched {} ({} bytes)", url, written);
                return Ok(written);
            }
            Err(Interrupted(reason)) => {
                attempt += 1;
                if attempt > MAX_RESUME_ATTEMPTS {
                    return Err(LifecycleError::download(
                        variant_id,
                        format!("{} after {} attempts: {}", url, attempt, reason),
                    ));
                }
                warn!(
                    "Download of {} interrupted at {} bytes ({}), resuming (attempt {}/{})",
                    url, written, reason, attempt, MAX_RESUME_ATTEMPTS
                );
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(Fatal(err)) => return Err(err),
        }
    }
}

enum FetchError {
    /// Transport failure; worth resuming
    Interrupted(String),
    Fatal(LifecycleError),
}
use FetchError::{Fatal, Interrupted};

async fn stream_response(
    resp: reqwest::Response,
    variant_id: &str,
    url: &str,
    dest: &Path,
    written: &mut u64,
    counter: &mut ByteCounter<'_>,
) -> std::result::Result<(), FetchError> {
    let status = resp.status();
    let append = match status {
        StatusCode::PARTIAL_CONTENT if *written > 0 => true,
        s if s.is_success() => false,
        s => {
            let body = resp.text().await.unwrap_or_default();
            return Err(Fatal(LifecycleError::DownloadFailed {
                variant_id: variant_id.to_string(),
                reason: format!("{} returned {}: {}", url, s, body),
                status: Some(s.as_u16()),
            }));
        }
    };

    if !append && *written > 0 {
        debug!("{} ignored range request, restarting file", url);
        counter.sub(*written);
        *written = 0;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(dest)
        .await
        .map_err(|e| Fatal(LifecycleError::io(dest, e)))?;

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Interrupted(e.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Fatal(LifecycleError::io(dest, e)))?;
        *written += chunk.len() as u64;
        counter.add(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|e| Fatal(LifecycleError::io(dest, e)))?;
    file.sync_all()
        .await
        .map_err(|e| Fatal(LifecycleError::io(dest, e)))?;
    Ok(())
}
