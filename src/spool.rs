//! Memory-first spill buffers for partial endpoint responses.
//!
//! Tasks run concurrently but their outputs are consumed in submission
//! order, so a finished partial must be parked somewhere until its turn.
//! Small bodies stay in memory; bodies beyond the threshold spill to an
//! unnamed temporary file in the configured scratch directory.

use bytes::Bytes;
use futures_util::Stream;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// In-memory bytes beyond this size spill to disk.
const SPILL_THRESHOLD: usize = 4 * 1024 * 1024;

pub struct Spool {
    tmpdir: PathBuf,
    inner: Inner,
    len: u64,
}

enum Inner {
    Mem(Vec<u8>),
    File(tokio::fs::File),
}

impl Spool {
    pub fn new(tmpdir: PathBuf) -> Self {
        Self {
            tmpdir,
            inner: Inner::Mem(Vec::new()),
            len: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.len += chunk.len() as u64;
        match &mut self.inner {
            Inner::Mem(buf) => {
                if buf.len() + chunk.len() > SPILL_THRESHOLD {
                    // The file is unnamed: unlinked at creation, reclaimed
                    // when the handle drops.
                    let std_file = tempfile::tempfile_in(&self.tmpdir)?;
                    let mut file = tokio::fs::File::from_std(std_file);
                    file.write_all(buf).await?;
                    file.write_all(chunk).await?;
                    self.inner = Inner::File(file);
                } else {
                    buf.extend_from_slice(chunk);
                }
            }
            Inner::File(file) => file.write_all(chunk).await?,
        }
        Ok(())
    }

    /// Read the whole buffer back into memory.
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self.inner {
            Inner::Mem(buf) => Ok(Bytes::from(buf)),
            Inner::File(mut file) => {
                file.seek(SeekFrom::Start(0)).await?;
                let mut buf = Vec::with_capacity(self.len as usize);
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Turn the buffer into a chunked byte stream.
    pub async fn into_stream(
        self,
    ) -> std::io::Result<impl Stream<Item = std::io::Result<Bytes>> + Send> {
        let stream: futures_util::stream::BoxStream<'static, std::io::Result<Bytes>> =
            match self.inner {
                Inner::Mem(buf) => {
                    if buf.is_empty() {
                        Box::pin(futures_util::stream::empty())
                    } else {
                        Box::pin(futures_util::stream::once(async move {
                            Ok(Bytes::from(buf))
                        }))
                    }
                }
                Inner::File(mut file) => {
                    file.seek(SeekFrom::Start(0)).await?;
                    Box::pin(ReaderStream::new(file))
                }
            };
        Ok(stream)
    }
}
