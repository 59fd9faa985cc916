//! Turning stored chunks back into the finished file.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::error::DownloadError;
use crate::store::StoreHandle;
use crate::utils::{get_unique_filepath, part_path, sanitize_filename};

/// The reassembled download, ready to hand off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_id: String,
    /// Suggested name, taken from the last segment of the source URL.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Where finished artifacts go.
pub trait Delivery {
    /// Returns the location the artifact ended up at.
    fn deliver(&self, artifact: &Artifact) -> impl Future<Output = io::Result<PathBuf>> + Send;
}

/// Writes artifacts into a directory, never overwriting an existing file.
#[derive(Debug, Clone)]
pub struct DirectoryDelivery {
    dir: PathBuf,
}

impl DirectoryDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Delivery for DirectoryDelivery {
    async fn deliver(&self, artifact: &Artifact) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let filepath = get_unique_filepath(&self.dir, &sanitize_filename(&artifact.file_name));
        let part_filepath = part_path(&filepath);

        write_then_rename(&part_filepath, &filepath, &artifact.bytes).await?;
        Ok(filepath)
    }
}

/// Stages `bytes` in `part` and moves it to `target`. The part file is
/// removed if either step fails.
async fn write_then_rename(part: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let staged = async {
        fs::write(part, bytes).await?;
        fs::rename(part, target).await?;
        Ok::<_, io::Error>(())
    };
    if let Err(err) = staged.await {
        let _ = fs::remove_file(part).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub location: PathBuf,
    pub bytes: u64,
}

/// Reads every chunk of `file_id` in order and joins them.
pub async fn reassemble(
    store: &StoreHandle,
    file_id: &str,
    file_name: &str,
) -> Result<Artifact, DownloadError> {
    let chunks = store
        .read_all_chunks(file_id)
        .await
        .map_err(|source| DownloadError::ReassemblyFailed {
            file_id: file_id.to_string(),
            source,
        })?;

    Ok(Artifact {
        file_id: file_id.to_string(),
        file_name: file_name.to_string(),
        bytes: chunks.concat(),
    })
}

/// Reassembles, delivers, then purges the record. Nothing is purged unless
/// delivery succeeded.
pub async fn finalize<D: Delivery>(
    store: &StoreHandle,
    file_id: &str,
    file_name: &str,
    delivery: &D,
) -> Result<Delivered, DownloadError> {
    let artifact = match reassemble(store, file_id, file_name).await {
        Ok(artifact) => artifact,
        Err(err) => {
            warn!(file_id, error = %err, "reassembly failed; keeping stored chunks");
            return Err(err);
        }
    };
    let bytes = artifact.bytes.len() as u64;

    let location = delivery
        .deliver(&artifact)
        .await
        .map_err(|source| DownloadError::Delivery {
            file_name: artifact.file_name.clone(),
            source,
        })?;

    store.delete_record(file_id).await?;
    info!(file_id, bytes, location = %location.display(), "artifact delivered");
    Ok(Delivered { location, bytes })
}
