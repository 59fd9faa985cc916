//! One resumable download attempt, end to end.
//!
//! [`Downloader::download_file`] gates the start on the file's lifecycle,
//! resumes from whatever the chunk store already holds, streams the rest,
//! reassembles and delivers the file, then runs the display timers that move
//! it back to `Idle`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::DownloadError;
use crate::events::{DownloadEvent, EventSink};
use crate::lifecycle::{DisplayWindows, DownloadStatus, Lifecycle};
use crate::reassembly::{finalize, Delivery};
use crate::resume::resume_offset;
use crate::store::ChunkStore;
use crate::transfer::TransferEngine;
use crate::utils::get_filename_from_url;

type Lifecycles = Arc<Mutex<HashMap<String, Lifecycle>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub file_id: String,
    pub location: PathBuf,
    pub bytes: u64,
    /// Offset this attempt started from.
    pub resumed_from: u64,
    /// Bytes fetched by this attempt.
    pub transferred: u64,
}

pub struct Downloader<D> {
    store: Arc<ChunkStore>,
    engine: TransferEngine,
    delivery: D,
    events: EventSink,
    windows: DisplayWindows,
    lifecycles: Lifecycles,
}

impl<D: Delivery> Downloader<D> {
    pub fn new(store: Arc<ChunkStore>, delivery: D, events: EventSink, config: &EngineConfig) -> Self {
        Self {
            store,
            engine: TransferEngine::new(config),
            delivery,
            events,
            windows: DisplayWindows::from(config),
            lifecycles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current status of `file_id`, after letting display windows lapse.
    pub fn status(&self, file_id: &str) -> DownloadStatus {
        with_lifecycle(&self.lifecycles, self.windows, file_id, |lc, now| {
            lc.advance(now);
            lc.status().clone()
        })
    }

    /// Downloads `url`, resuming from previously stored chunks. `file_id`
    /// defaults to the file name taken from the URL.
    pub async fn download_file(
        &self,
        url: &str,
        file_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let file_name = get_filename_from_url(url)?;
        let file_id = file_id.map(str::to_string).unwrap_or_else(|| file_name.clone());

        self.update(&file_id, |lc, now| lc.begin(now))
            .map_err(|source| DownloadError::Lifecycle {
                file_id: file_id.clone(),
                source,
            })?;

        // Cancelled on every exit path, so the request never outlives the attempt.
        let attempt = cancel.child_token();
        let _teardown = attempt.clone().drop_guard();

        match self.attempt(url, &file_id, &file_name, &attempt).await {
            Ok(report) => {
                if let Err(err) = self.update(&file_id, |lc, now| lc.delivered(now)) {
                    warn!(file_id = %file_id, error = %err, "unexpected lifecycle state");
                }
                self.spawn_display_timers(file_id);
                Ok(report)
            }
            Err(err) => {
                warn!(file_id = %file_id, error = %err, resumable = err.is_resumable(), "download failed");
                let message = err.to_string();
                if let Err(lc_err) = self.update(&file_id, |lc, now| lc.fail(message.clone(), now)) {
                    warn!(file_id = %file_id, error = %lc_err, "unexpected lifecycle state");
                }
                self.events.emit(DownloadEvent::Error { file_id, message });
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        file_id: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, DownloadError> {
        let store = self.store.open().await?;
        let offset = resume_offset(&store, file_id).await?;
        info!(file_id, offset, url, "starting download");

        let outcome = self
            .engine
            .run(&store, file_id, url, offset, cancel, |progress| {
                self.update(file_id, |lc, _| {
                    lc.report_progress(progress.percent, progress.eta_seconds)
                });
                self.events.emit(DownloadEvent::Progress {
                    file_id: file_id.to_string(),
                    percent: progress.percent,
                    eta_seconds: progress.eta_seconds,
                });
            })
            .await?;

        if let Err(err) = self.update(file_id, |lc, now| lc.finalizing(now)) {
            warn!(file_id, error = %err, "unexpected lifecycle state");
        }
        self.events.emit(DownloadEvent::Waiting {
            file_id: file_id.to_string(),
        });

        let delivered = finalize(&store, file_id, file_name, &self.delivery).await?;

        Ok(DownloadReport {
            file_id: file_id.to_string(),
            location: delivered.location,
            bytes: delivered.bytes,
            resumed_from: outcome.resume_offset,
            transferred: outcome.bytes_transferred,
        })
    }

    fn update<T>(&self, file_id: &str, f: impl FnOnce(&mut Lifecycle, Instant) -> T) -> T {
        with_lifecycle(&self.lifecycles, self.windows, file_id, f)
    }

    /// Emits `Completed` once the waiting window lapses and `Idle` once the
    /// completion message expires.
    fn spawn_display_timers(&self, file_id: String) {
        let lifecycles = self.lifecycles.clone();
        let events = self.events.clone();
        let windows = self.windows;

        tokio::spawn(async move {
            tokio::time::sleep(windows.completion_delay).await;
            let status = with_lifecycle(&lifecycles, windows, &file_id, |lc, now| {
                lc.advance(now);
                lc.status().clone()
            });
            if status != DownloadStatus::Completed {
                return;
            }
            events.emit(DownloadEvent::Completed {
                file_id: file_id.clone(),
            });

            tokio::time::sleep(windows.message_expiry).await;
            let status = with_lifecycle(&lifecycles, windows, &file_id, |lc, now| {
                lc.advance(now);
                lc.status().clone()
            });
            if status == DownloadStatus::Idle {
                events.emit(DownloadEvent::Idle { file_id });
            }
        });
    }
}

fn with_lifecycle<T>(
    lifecycles: &Lifecycles,
    windows: DisplayWindows,
    file_id: &str,
    f: impl FnOnce(&mut Lifecycle, Instant) -> T,
) -> T {
    let now = Instant::now();
    let mut lifecycles = lifecycles.lock().unwrap_or_else(PoisonError::into_inner);
    let lifecycle = lifecycles
        .entry(file_id.to_string())
        .or_insert_with(|| Lifecycle::new(windows, now));
    f(lifecycle, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleError;
    use crate::reassembly::tests::MemoryDelivery;
    use crate::store::StoreHandle;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn partial(full: &[u8], start: usize) -> ResponseTemplate {
        ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", start, full.len() - 1, full.len()).as_str(),
            )
            .set_body_bytes(full[start..].to_vec())
    }

    struct Harness {
        downloader: Downloader<MemoryDelivery>,
        store: StoreHandle,
        events: UnboundedReceiver<DownloadEvent>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(ChunkStore::temporary());
        let handle = store.open().await.unwrap();
        let (sink, events) = EventSink::channel();
        let downloader = Downloader::new(
            store,
            MemoryDelivery::default(),
            sink,
            &EngineConfig::default(),
        );
        Harness {
            downloader,
            store: handle,
            events,
        }
    }

    fn drain(events: &mut UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
        let mut out = vec![];
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn delivered_bytes(h: &Harness) -> Vec<u8> {
        h.downloader.delivery.delivered.lock().unwrap()[0].bytes.clone()
    }

    #[tokio::test]
    async fn fresh_download_delivers_and_purges() {
        let server = MockServer::start().await;
        let full = body(1000);
        Mock::given(method("GET"))
            .and(path("/files/a.bin"))
            .and(header("range", "bytes=0-"))
            .respond_with(partial(&full, 0))
            .expect(1)
            .mount(&server)
            .await;
        let mut h = harness().await;

        let url = format!("{}/files/a.bin", server.uri());
        let report = h
            .downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.file_id, "a.bin");
        assert_eq!(report.bytes, 1000);
        assert_eq!(report.resumed_from, 0);
        assert_eq!(delivered_bytes(&h), full);
        assert_eq!(h.store.existing_length("a.bin").await.unwrap(), 0);
        assert_eq!(h.downloader.status("a.bin"), DownloadStatus::Waiting);

        let events = drain(&mut h.events);
        assert!(matches!(events.first(), Some(DownloadEvent::Progress { .. })));
        assert_eq!(
            events.last(),
            Some(&DownloadEvent::Waiting {
                file_id: "a.bin".into()
            })
        );
    }

    #[tokio::test]
    async fn resumes_from_stored_bytes() {
        let server = MockServer::start().await;
        let full = body(1000);
        Mock::given(method("GET"))
            .and(header("range", "bytes=400-"))
            .respond_with(partial(&full, 400))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness().await;
        h.store.append_chunk("f", full[..400].to_vec()).await.unwrap();

        let url = format!("{}/dl/f", server.uri());
        let report = h
            .downloader
            .download_file(&url, Some("f"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.resumed_from, 400);
        assert_eq!(report.transferred, 600);
        assert_eq!(report.bytes, 1000);
        assert_eq!(delivered_bytes(&h), full);
    }

    #[tokio::test]
    async fn protocol_error_leaves_store_untouched_and_allows_retry() {
        let server = MockServer::start().await;
        let full = body(1000);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(full.clone()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=400-"))
            .respond_with(partial(&full, 400))
            .mount(&server)
            .await;
        let mut h = harness().await;
        h.store.append_chunk("f", full[..400].to_vec()).await.unwrap();
        let url = format!("{}/f", server.uri());

        let err = h
            .downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Protocol(_)));
        assert!(err.is_resumable());
        assert_eq!(h.store.existing_length("f").await.unwrap(), 400);
        assert!(matches!(
            h.downloader.status("f"),
            DownloadStatus::Failed { .. }
        ));
        assert!(matches!(
            drain(&mut h.events).last(),
            Some(DownloadEvent::Error { file_id, .. }) if file_id == "f"
        ));

        let report = h
            .downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.resumed_from, 400);
        assert_eq!(delivered_bytes(&h), full);
    }

    #[tokio::test]
    async fn interrupted_attempts_reassemble_the_whole_file() {
        let server = MockServer::start().await;
        let full = body(1000);
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 0-999/1000")
                    .set_body_bytes(full[..300].to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=300-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 300-999/1000")
                    .set_body_bytes(full[300..750].to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=750-"))
            .respond_with(partial(&full, 750))
            .mount(&server)
            .await;
        let h = harness().await;
        let url = format!("{}/big.iso", server.uri());

        let mut offsets = vec![];
        for _ in 0..2 {
            let err = h
                .downloader
                .download_file(&url, None, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, DownloadError::TransferFailed(_)));
            offsets.push(h.store.existing_length("big.iso").await.unwrap());
        }
        assert_eq!(offsets, vec![300, 750]);

        let report = h
            .downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.resumed_from, 750);
        assert_eq!(delivered_bytes(&h), full);
        assert_eq!(h.store.existing_length("big.iso").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_start_is_refused_while_waiting() {
        let server = MockServer::start().await;
        let full = body(10);
        Mock::given(method("GET"))
            .respond_with(partial(&full, 0))
            .mount(&server)
            .await;
        let h = harness().await;
        let url = format!("{}/x.txt", server.uri());

        h.downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap();
        let err = h
            .downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloadError::Lifecycle {
                source: LifecycleError::Busy(DownloadStatus::Waiting),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_attempt_fails_without_writing() {
        let server = MockServer::start().await;
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .downloader
            .download_file(&format!("{}/c.bin", server.uri()), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(h.store.existing_length("c.bin").await.unwrap(), 0);
        assert!(h.downloader.status("c.bin") != DownloadStatus::Idle);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_starting() {
        let h = harness().await;
        let err = h
            .downloader
            .download_file("not a url", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn display_timers_return_file_to_idle() {
        let server = MockServer::start().await;
        let full = body(10);
        Mock::given(method("GET"))
            .respond_with(partial(&full, 0))
            .mount(&server)
            .await;
        let mut h = harness().await;
        let url = format!("{}/t.bin", server.uri());

        h.downloader
            .download_file(&url, None, &CancellationToken::new())
            .await
            .unwrap();
        drain(&mut h.events);

        tokio::time::pause();
        let delivered_at = Instant::now();

        let completed = h.events.recv().await.unwrap();
        assert_eq!(
            completed,
            DownloadEvent::Completed {
                file_id: "t.bin".into()
            }
        );
        assert!(delivered_at.elapsed() >= Duration::from_secs(10) - Duration::from_millis(100));
        assert_eq!(h.downloader.status("t.bin"), DownloadStatus::Completed);

        let idle = h.events.recv().await.unwrap();
        assert_eq!(
            idle,
            DownloadEvent::Idle {
                file_id: "t.bin".into()
            }
        );
        assert_eq!(h.downloader.status("t.bin"), DownloadStatus::Idle);
    }
}
