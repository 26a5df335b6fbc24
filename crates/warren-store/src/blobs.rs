//! On-disk storage for attachment bytes.
//!
//! Download files live under `<root>/downloads/<friend>/<resource>` and are
//! appended to as ranged fetches complete, so interrupted downloads resume
//! from the current file size.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt};
use warren_protocol::{ByteRange, FriendId};

use crate::LocalResource;

pub struct BlobDirectory {
    root: PathBuf,
}

impl BlobDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn download_path(&self, friend_id: &FriendId, resource_id: &str) -> io::Result<PathBuf> {
        Ok(self
            .root
            .join("downloads")
            .join(safe_component(friend_id.as_str())?)
            .join(safe_component(resource_id)?))
    }

    /// Bytes of the resource already on disk; zero when nothing was fetched.
    pub async fn downloaded_size(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
    ) -> io::Result<u64> {
        let path = self.download_path(friend_id, resource_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Open the download file for appending, creating parents as needed.
    pub async fn open_download_for_append(
        &self,
        friend_id: &FriendId,
        resource_id: &str,
    ) -> io::Result<File> {
        let path = self.download_path(friend_id, resource_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
    }

    /// Open a local resource for serving, positioned at `range.start` and
    /// bounded by the inclusive `range.end` when present.
    pub async fn open_resource(
        &self,
        resource: &LocalResource,
        range: ByteRange,
    ) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut file = File::open(&resource.path).await?;
        file.seek(io::SeekFrom::Start(range.start)).await?;
        match range.end {
            Some(end) => {
                let len = end.saturating_sub(range.start).saturating_add(1);
                Ok(Box::new(tokio::io::AsyncReadExt::take(file, len)))
            }
            None => Ok(Box::new(file)),
        }
    }
}

/// Reject ids that would escape the blob directory when used as a path
/// component.
fn safe_component(id: &str) -> io::Result<&str> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsafe path component: {id:?}"),
        ));
    }
    Ok(id)
}
