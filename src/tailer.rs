//! Incremental transcript reader
//!
//! [`LogTailer`] remembers a byte offset into one file plus any unterminated
//! trailing bytes. Each [`LogTailer::poll`] reads exactly the bytes appended
//! since the previous call and hands back the complete lines among them.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::trace;

#[derive(Error, Debug)]
pub enum TailError {
    #[error("transcript I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file is now shorter than what was already consumed.
    #[error("transcript shrank to {len} bytes below read offset {offset}")]
    Truncated { offset: u64, len: u64 },
}

/// Where a freshly attached tailer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachFrom {
    /// Skip existing history.
    End,
    /// Read the whole file (new or replaced transcript).
    Start,
}

#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    /// Bytes after the last newline. Kept raw so a UTF-8 sequence split
    /// across two reads is decoded whole.
    partial: Vec<u8>,
}

async fn file_len(path: &Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Split complete lines off the front of `buffer`, leaving the remainder.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };

    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);

    complete
        .split(|b| *b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

impl LogTailer {
    /// Point a new tailer at `path`.
    ///
    /// With [`AttachFrom::End`] the offset is the current file length, or 0 if
    /// the file does not exist yet.
    pub async fn attach(path: impl Into<PathBuf>, from: AttachFrom) -> Self {
        let path = path.into();
        let offset = match from {
            AttachFrom::Start => 0,
            AttachFrom::End => file_len(&path).await.ok().flatten().unwrap_or(0),
        };
        trace!(path = %path.display(), offset, "tailer attached");
        Self {
            path,
            offset,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub async fn exists(&self) -> bool {
        matches!(file_len(&self.path).await, Ok(Some(_)))
    }

    /// Read `[offset, len)` and return the complete, non-blank lines in it.
    ///
    /// A missing file or no new bytes is an empty batch. A file shorter than
    /// the offset is [`TailError::Truncated`]; the tailer is left untouched so
    /// the caller decides how to recover.
    pub async fn poll(&mut self) -> Result<Vec<String>, TailError> {
        let Some(len) = file_len(&self.path).await? else {
            return Ok(Vec::new());
        };

        if len < self.offset {
            return Err(TailError::Truncated {
                offset: self.offset,
                len,
            });
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(self.offset)).await?;

        // Cap the read at the length observed above so the offset lands exactly on it.
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf).await?;

        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let lines = drain_lines(&mut self.partial);
        trace!(
            path = %self.path.display(),
            offset = self.offset,
            lines = lines.len(),
            "tailer read"
        );
        Ok(lines)
    }
}
