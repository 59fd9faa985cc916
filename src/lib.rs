//! Resumable HTTP downloads backed by a durable chunk store.
//!
//! Bytes received for a file are persisted in batches under its file id. An
//! interrupted download asks only for the remaining range on the next attempt,
//! and the finished file is rebuilt from the stored chunks.

pub mod config;
pub mod downloader;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod progress;
pub mod reassembly;
pub mod resume;
pub mod store;
pub mod transfer;
pub mod utils;

pub use config::EngineConfig;
pub use downloader::{DownloadReport, Downloader};
pub use error::DownloadError;
pub use events::{DownloadEvent, EventSink};
pub use lifecycle::DownloadStatus;
pub use reassembly::{Delivery, DirectoryDelivery};
pub use store::{ChunkStore, StoreHandle};
