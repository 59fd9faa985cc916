use std::io;

use thiserror::Error;

use crate::lifecycle::LifecycleError;
use crate::store::StoreError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a single download attempt did not complete.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid source URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The server answered, but not with the partial content we asked for.
    #[error("{0}")]
    Protocol(String),

    #[error("transfer failed: {0}")]
    TransferFailed(#[source] BoxError),

    #[error("download cancelled")]
    Cancelled,

    #[error("failed to reassemble {file_id}: {source}")]
    ReassemblyFailed {
        file_id: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to deliver {file_name}: {source}")]
    Delivery {
        file_name: String,
        #[source]
        source: io::Error,
    },

    #[error("{file_id}: {source}")]
    Lifecycle {
        file_id: String,
        #[source]
        source: LifecycleError,
    },
}

impl DownloadError {
    pub(crate) fn transfer(err: impl Into<BoxError>) -> Self {
        DownloadError::TransferFailed(err.into())
    }

    /// Whether flushed chunks from this attempt can seed the next one.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            DownloadError::Protocol(_) | DownloadError::TransferFailed(_) | DownloadError::Cancelled
        )
    }
}
