//! Where the next transfer attempt for a file starts.

use crate::store::{StoreError, StoreHandle};

/// Byte offset to request from: everything already stored for `file_id`.
/// Stored chunks are trusted as-is.
pub async fn resume_offset(handle: &StoreHandle, file_id: &str) -> Result<u64, StoreError> {
    handle.existing_length(file_id).await
}

/// `Range` header value asking for everything from `offset` to the end.
pub fn range_header(offset: u64) -> String {
    format!("bytes={}-", offset)
}
