//! The filesystem [`ByteSource`]/[`TransferSink`] that stand in for "the
//! final save-to-disk sink" spec.md leaves out of scope for the core
//! engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use file_transfer::{ByteSource, TransferSink};

/// Random-access read over a file opened once at transfer start.
pub struct FsSource {
    file: Mutex<tokio::fs::File>,
    size: u64,
}

impl FsSource {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

#[async_trait]
impl ByteSource for FsSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_slice(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Sequential writer under the configured download directory. `abort`
/// deletes the partial file; incoming frames only ever arrive in commit
/// order, so no seeking is needed.
pub struct FsSink {
    file: tokio::fs::File,
    path: PathBuf,
}

impl FsSink {
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self { file, path })
    }
}

#[async_trait]
impl TransferSink for FsSink {
    async fn write(&mut self, bytes: Bytes) -> std::io::Result<()> {
        self.file.write_all(&bytes).await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    async fn abort(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}

/// Build a destination path under `download_dir` for an offered file,
/// rejecting path separators in the advertised name so a hostile peer can't
/// write outside the configured directory.
pub fn destination_path(download_dir: &Path, name: &str) -> PathBuf {
    let safe_name = name
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("unnamed");
    download_dir.join(safe_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_path_strips_directory_components() {
        let dir = Path::new("/downloads");
        assert_eq!(destination_path(dir, "../../etc/passwd"), Path::new("/downloads/passwd"));
        assert_eq!(destination_path(dir, "report.pdf"), Path::new("/downloads/report.pdf"));
        assert_eq!(destination_path(dir, "a\\b\\c.bin"), Path::new("/downloads/c.bin"));
    }
}
