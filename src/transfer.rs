//! Streaming range transfer.
//!
//! One attempt asks the server for `bytes=<offset>-`, reads the body fragment by
//! fragment, and appends batches of fragments to the chunk store. At most
//! `batch_threshold` fragments are ever held in memory.

use std::str::FromStr;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, Response, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{BoxError, DownloadError};
use crate::progress::{estimate, EtaBasis, ProgressSnapshot};
use crate::resume::range_header;
use crate::store::StoreHandle;

/// Parsed `Content-Range` of a partial response. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl FromStr for ContentRange {
    type Err = DownloadError;

    /// Accepts `bytes 400-999/1000` as well as the unit-less `400-999/1000`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || DownloadError::Protocol(format!("invalid Content-Range: {}", value));

        let trimmed = value.trim();
        let rest = match trimmed.split_once(char::is_whitespace) {
            Some((unit, rest)) if unit.eq_ignore_ascii_case("bytes") => rest.trim(),
            Some(_) => return Err(invalid()),
            None => trimmed,
        };

        let (range, total) = rest.split_once('/').ok_or_else(invalid)?;
        if total.trim() == "*" {
            return Err(DownloadError::Protocol(format!(
                "Content-Range does not state the total size: {}",
                value
            )));
        }
        let total: u64 = total.trim().parse().map_err(|_| invalid())?;

        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        if end < start || end >= total {
            return Err(invalid());
        }

        Ok(Self { start, end, total })
    }
}

/// In-memory state of one transfer attempt.
#[derive(Debug)]
pub struct TransferSession {
    pub file_id: String,
    pub resume_offset: u64,
    pub total_bytes: Option<u64>,
    /// Absolute count of bytes held, starting at `resume_offset`.
    pub bytes_transferred: u64,
    pub started_at: Instant,
    buffer: Vec<Bytes>,
    batch_threshold: usize,
    peak_pending: usize,
    flushes: usize,
}

impl TransferSession {
    pub fn new(
        file_id: impl Into<String>,
        resume_offset: u64,
        total_bytes: Option<u64>,
        batch_threshold: usize,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            resume_offset,
            total_bytes,
            bytes_transferred: resume_offset,
            started_at: Instant::now(),
            buffer: Vec::new(),
            batch_threshold: batch_threshold.max(1),
            peak_pending: 0,
            flushes: 0,
        }
    }

    /// Buffers a fragment. Returns true once the batch is full.
    pub fn push(&mut self, fragment: Bytes) -> bool {
        if !fragment.is_empty() {
            self.bytes_transferred += fragment.len() as u64;
            self.buffer.push(fragment);
            self.peak_pending = self.peak_pending.max(self.buffer.len());
        }
        self.buffer.len() >= self.batch_threshold
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Joins the buffered fragments into one block and clears the buffer.
    pub fn take_batch(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.iter().map(Bytes::len).sum();
        let mut block = Vec::with_capacity(len);
        for fragment in self.buffer.drain(..) {
            block.extend_from_slice(&fragment);
        }
        Some(block)
    }

    pub fn snapshot(&self, now: Instant, basis: EtaBasis) -> ProgressSnapshot {
        estimate(
            self.total_bytes.unwrap_or(0),
            self.bytes_transferred,
            self.resume_offset,
            now.saturating_duration_since(self.started_at),
            basis,
        )
    }

    pub fn outcome(&self) -> TransferOutcome {
        TransferOutcome {
            resume_offset: self.resume_offset,
            total_bytes: self.total_bytes.unwrap_or(self.bytes_transferred),
            bytes_transferred: self.bytes_transferred - self.resume_offset,
            flushes: self.flushes,
            peak_pending: self.peak_pending,
        }
    }

    async fn flush(&mut self, store: &StoreHandle) -> Result<(), DownloadError> {
        let fragments = self.buffer.len();
        if let Some(block) = self.take_batch() {
            let bytes = block.len();
            store.append_chunk(&self.file_id, block).await?;
            self.flushes += 1;
            debug!(file_id = %self.file_id, fragments, bytes, "batch flushed");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub resume_offset: u64,
    pub total_bytes: u64,
    /// Bytes received during this attempt only.
    pub bytes_transferred: u64,
    pub flushes: usize,
    pub peak_pending: usize,
}

pub struct TransferEngine {
    client: Client,
    batch_threshold: usize,
    eta_basis: EtaBasis,
}

impl TransferEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            batch_threshold: config.batch_threshold,
            eta_basis: config.eta_basis,
        }
    }

    /// Downloads `url` from `resume_offset` to the end into `store`.
    pub async fn run(
        &self,
        store: &StoreHandle,
        file_id: &str,
        url: &str,
        resume_offset: u64,
        cancel: &CancellationToken,
        on_progress: impl FnMut(ProgressSnapshot),
    ) -> Result<TransferOutcome, DownloadError> {
        let (range, response) = self.request(url, resume_offset, cancel).await?;
        info!(file_id, offset = resume_offset, total = range.total, "range accepted");

        let mut session = TransferSession::new(
            file_id,
            resume_offset,
            Some(range.total),
            self.batch_threshold,
        );
        self.pump(store, &mut session, response.bytes_stream(), cancel, on_progress)
            .await?;

        if session.bytes_transferred != range.total {
            return Err(DownloadError::transfer(format!(
                "stream ended after {} of {} bytes",
                session.bytes_transferred, range.total
            )));
        }

        let outcome = session.outcome();
        info!(
            file_id,
            bytes = outcome.bytes_transferred,
            flushes = outcome.flushes,
            "transfer finished"
        );
        Ok(outcome)
    }

    /// Sends the range request and validates the partial-content response.
    pub async fn request(
        &self,
        url: &str,
        resume_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<(ContentRange, Response), DownloadError> {
        let request = self
            .client
            .get(url)
            .header(header::RANGE, range_header(resume_offset));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response.map_err(DownloadError::transfer)?,
        };

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Protocol(format!(
                "expected 206 Partial Content, server answered {}",
                status
            )));
        }

        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                DownloadError::Protocol("response has no Content-Range header".to_string())
            })?;
        let range: ContentRange = content_range.parse()?;

        if range.start != resume_offset {
            return Err(DownloadError::Protocol(format!(
                "asked for bytes from {} but server sent {}",
                resume_offset, content_range
            )));
        }
        if range.end + 1 != range.total {
            return Err(DownloadError::Protocol(format!(
                "server sent a range that stops short of the end: {}",
                content_range
            )));
        }

        Ok((range, response))
    }

    /// Drains `stream` into the store in batches.
    ///
    /// Fragments still buffered when the stream fails or `cancel` fires are
    /// dropped; everything flushed before that stays in the store.
    pub async fn pump<S, E>(
        &self,
        store: &StoreHandle,
        session: &mut TransferSession,
        stream: S,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(ProgressSnapshot),
    ) -> Result<(), DownloadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(file_id = %session.file_id, discarded = session.pending(), "transfer cancelled");
                    return Err(DownloadError::Cancelled);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    // Checked before buffering so excess bytes never reach the store.
                    if let Some(total) = session.total_bytes {
                        let received = session.bytes_transferred + fragment.len() as u64;
                        if received > total {
                            debug!(file_id = %session.file_id, discarded = session.pending(), "transfer overran total");
                            return Err(DownloadError::Protocol(format!(
                                "server sent {} bytes of a {} byte file",
                                received, total
                            )));
                        }
                    }
                    if session.push(fragment) {
                        session.flush(store).await?;
                    }
                    on_progress(session.snapshot(Instant::now(), self.eta_basis));
                }
                Some(Err(err)) => {
                    let err = err.into();
                    warn!(
                        file_id = %session.file_id,
                        discarded = session.pending(),
                        error = %err,
                        "transfer interrupted"
                    );
                    return Err(DownloadError::TransferFailed(err));
                }
                None => {
                    session.flush(store).await?;
                    return Ok(());
                }
            }
        }
    }
}
