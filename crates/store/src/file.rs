//! File-backed [`UpdateStore`] implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use syncboard_common::{Error, Result, Timestamp};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::format::{self, FORMAT_VERSION};
use crate::UpdateStore;

struct State {
    closed: bool,
    /// Set once `load` hits a corrupt tail. While degraded, appends are
    /// refused — squashing is still allowed, since it rewrites the file
    /// from scratch and clears the corruption.
    degraded: bool,
}

/// A store backed by a single file on disk, surviving process restarts.
pub struct FileYStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl FileYStore {
    /// Open `path`, creating it (with a fresh header) if it doesn't exist.
    /// If it exists, its header version is checked against what this build
    /// understands.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => {
                let mut file = BufReader::new(File::open(&path).await.map_err(Error::Io)?);
                let version = format::read_header(&mut file).await?;
                if version != FORMAT_VERSION {
                    return Err(Error::StoreVersionMismatch { expected: FORMAT_VERSION, found: version });
                }
            }
            _ => {
                let mut file = File::create(&path).await.map_err(Error::Io)?;
                format::write_header(&mut file).await?;
                file.flush().await.map_err(Error::Io)?;
            }
        }
        Ok(Self { path, state: Mutex::new(State { closed: false, degraded: false }) })
    }

    async fn check_writable(&self) -> Result<()> {
        let state = self.state.lock().await;
        if state.closed || state.degraded {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateStore for FileYStore {
    async fn append(&self, update: &[u8], metadata: &[u8]) -> Result<()> {
        self.check_writable().await?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(Error::Io)?;
        format::write_record(&mut file, update, metadata, Timestamp::now()).await?;
        file.flush().await.map_err(Error::Io)
    }

    async fn load(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, Timestamp)>> {
        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(Error::StoreClosed);
            }
        }

        let mut file = BufReader::new(File::open(&self.path).await.map_err(Error::Io)?);
        let version = format::read_header(&mut file).await?;
        if version != FORMAT_VERSION {
            return Err(Error::StoreVersionMismatch { expected: FORMAT_VERSION, found: version });
        }

        let mut records = Vec::new();
        loop {
            match format::read_record(&mut file).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "update store tail is corrupt, entering degraded mode");
                    self.state.lock().await.degraded = true;
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn squash(&self, squashed: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(Error::StoreClosed);
            }
        }

        let tmp_path = self.path.with_extension("squash.tmp");
        {
            let mut tmp = File::create(&tmp_path).await.map_err(Error::Io)?;
            format::write_header(&mut tmp).await?;
            format::write_record(&mut tmp, squashed, b"", Timestamp::now()).await?;
            tmp.flush().await.map_err(Error::Io)?;
        }
        fs::rename(&tmp_path, &self.path).await.map_err(Error::Io)?;
        self.state.lock().await.degraded = false;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// A [`FileYStore`] rooted in a process-lifetime temporary file, useful for
/// tests and for rooms that opt out of durability. The backing file is
/// removed when this value is dropped.
pub struct TempFileYStore {
    inner: FileYStore,
    _guard: tempfile::TempPath,
}

impl TempFileYStore {
    pub async fn new() -> Result<Self> {
        let file = tempfile::NamedTempFile::new().map_err(Error::Io)?;
        let path = file.into_temp_path();
        let inner = FileYStore::open(path.to_path_buf()).await?;
        Ok(Self { inner, _guard: path })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

#[async_trait]
impl UpdateStore for TempFileYStore {
    async fn append(&self, update: &[u8], metadata: &[u8]) -> Result<()> {
        self.inner.append(update, metadata).await
    }

    async fn load(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, Timestamp)>> {
        self.inner.load().await
    }

    async fn squash(&self, squashed: &[u8]) -> Result<()> {
        self.inner.squash(squashed).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
