//! Events published to whatever is presenting downloads.

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Progress {
        file_id: String,
        percent: f64,
        eta_seconds: Option<f64>,
    },
    Waiting {
        file_id: String,
    },
    Completed {
        file_id: String,
    },
    Error {
        file_id: String,
        message: String,
    },
    Idle {
        file_id: String,
    },
}

/// Sending half of the event channel. A closed receiver is ignored.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Option<UnboundedSender<DownloadEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: DownloadEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&DownloadEvent::Progress {
            file_id: "a.bin".into(),
            percent: 50.0,
            eta_seconds: None,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"progress","file_id":"a.bin","percent":50.0,"eta_seconds":null}"#
        );
    }

    #[test]
    fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(DownloadEvent::Idle { file_id: "f".into() });
        EventSink::discard().emit(DownloadEvent::Idle { file_id: "f".into() });
    }
}
