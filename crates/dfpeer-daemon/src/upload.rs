//! Upload sinks for UploadTask
//!
//! Pieces are written in index order. `FileSink` writes straight to a
//! local path; `HttpSink` buffers the body and PUTs it in one request.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dfpeer_core::{Error, Piece, Result};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Where UploadTask sends a task's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDestination {
    File(PathBuf),
    Http(String),
}

impl UploadDestination {
    pub async fn open(&self) -> Result<Box<dyn UploadSink>> {
        match self {
            UploadDestination::File(path) => Ok(Box::new(FileSink::create(path.clone()).await?)),
            UploadDestination::Http(url) => Ok(Box::new(HttpSink::new(url.clone()))),
        }
    }
}

#[async_trait]
pub trait UploadSink: Send {
    async fn write_piece(&mut self, piece: &Piece, data: Bytes) -> Result<()>;

    /// Flush everything; the upload counts as done only after this
    async fn finish(&mut self) -> Result<()>;
}

fn check_length(piece: &Piece, data: &Bytes) -> Result<()> {
    if data.len() as u64 != piece.length {
        return Err(Error::Internal(format!(
            "piece {} holds {} bytes, expected {}",
            piece.index,
            data.len(),
            piece.length
        )));
    }
    Ok(())
}

pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub async fn create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self { path, file })
    }
}

#[async_trait]
impl UploadSink for FileSink {
    async fn write_piece(&mut self, piece: &Piece, data: Bytes) -> Result<()> {
        check_length(piece, &data)?;
        self.file.seek(SeekFrom::Start(piece.offset)).await?;
        self.file.write_all(&data).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        debug!(path = ?self.path, "upload written");
        Ok(())
    }
}

pub struct HttpSink {
    url: String,
    client: reqwest::Client,
    body: BytesMut,
}

impl HttpSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            body: BytesMut::new(),
        }
    }
}

#[async_trait]
impl UploadSink for HttpSink {
    async fn write_piece(&mut self, piece: &Piece, data: Bytes) -> Result<()> {
        check_length(piece, &data)?;
        self.body.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let body = std::mem::take(&mut self.body).freeze();
        let size = body.len();
        self.client
            .put(&self.url)
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Unavailable(format!("upload to {} failed: {}", self.url, e)))?;
        debug!(url = %self.url, size, "upload sent");
        Ok(())
    }
}
