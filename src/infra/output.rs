//! Filesystem storage for rendered documents, keyed by task id.

use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

use crate::domain::identifiers::validate_task_id;

/// Errors that can occur while interacting with the output directory.
#[derive(Debug, Error)]
pub enum OutputStoreError {
    #[error("invalid output key `{0}`")]
    InvalidKey(String),
    #[error("output for task `{0}` not found")]
    NotFound(String),
    #[error("stored output is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A document that has been persisted and re-checked on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutput {
    pub path: PathBuf,
    pub size: u64,
}

/// Directory of rendered documents at `{root}/{task_id}.pdf`.
#[derive(Debug)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path_for(&self, task_id: &str) -> Result<PathBuf, OutputStoreError> {
        validate_task_id(task_id).map_err(|_| OutputStoreError::InvalidKey(task_id.to_string()))?;
        Ok(self.root.join(format!("{task_id}.pdf")))
    }

    /// Write the document. The file only appears under its final name once
    /// fully flushed.
    pub async fn write(&self, task_id: &str, bytes: &[u8]) -> Result<PathBuf, OutputStoreError> {
        let path = self.path_for(task_id)?;
        let staging = self.root.join(format!(".{task_id}.pdf.partial"));

        let mut file = fs::File::create(&staging).await?;
        if let Err(err) = write_all(&mut file, bytes).await {
            drop(file);
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        drop(file);

        fs::rename(&staging, &path).await?;
        Ok(path)
    }

    /// Confirm the stored document exists and has the expected, non-zero size.
    pub async fn verify(
        &self,
        task_id: &str,
        expected_len: u64,
    ) -> Result<StoredOutput, OutputStoreError> {
        let path = self.path_for(task_id)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OutputStoreError::NotFound(task_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let size = metadata.len();
        if !metadata.is_file() || size == 0 || size != expected_len {
            return Err(OutputStoreError::SizeMismatch {
                expected: expected_len,
                actual: size,
            });
        }

        Ok(StoredOutput { path, size })
    }

    pub async fn read(&self, task_id: &str) -> Result<Bytes, OutputStoreError> {
        let path = self.path_for(task_id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(OutputStoreError::NotFound(task_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove the stored document. Returns whether a file was deleted.
    pub async fn remove(&self, task_id: &str) -> Result<bool, OutputStoreError> {
        let path = self.path_for(task_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

async fn write_all(file: &mut fs::File, bytes: &[u8]) -> Result<(), std::io::Error> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
