//! File contents handed to the client for upload.

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use std::fmt;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Downloaded or uploaded file bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// The bytes of a file to upload. Consumed by the upload.
pub enum FileSource {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl FileSource {
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        FileSource::Stream(Box::pin(stream))
    }

    /// Stream a local file from disk.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        if !file.metadata().await?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.as_ref().display()),
            ));
        }
        Ok(Self::stream(read_chunks(file)))
    }

    pub(crate) fn into_body(self) -> reqwest::Body {
        match self {
            FileSource::Bytes(bytes) => reqwest::Body::from(bytes),
            FileSource::Stream(stream) => reqwest::Body::wrap_stream(stream),
        }
    }
}

fn read_chunks(mut file: tokio::fs::File) -> impl Stream<Item = io::Result<Bytes>> + Send {
    async_stream::try_stream! {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Bytes(bytes) => write!(f, "FileSource::Bytes({} bytes)", bytes.len()),
            FileSource::Stream(_) => f.write_str("FileSource::Stream"),
        }
    }
}

impl From<Bytes> for FileSource {
    fn from(bytes: Bytes) -> Self {
        FileSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for FileSource {
    fn from(bytes: Vec<u8>) -> Self {
        FileSource::Bytes(bytes.into())
    }
}

impl From<String> for FileSource {
    fn from(s: String) -> Self {
        FileSource::Bytes(s.into())
    }
}

impl From<&'static str> for FileSource {
    fn from(s: &'static str) -> Self {
        FileSource::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for FileSource {
    fn from(bytes: &'static [u8]) -> Self {
        FileSource::Bytes(Bytes::from_static(bytes))
    }
}

/// Collect a byte stream into memory.
pub async fn collect(mut stream: ByteStream) -> io::Result<Bytes> {
    use futures::TryStreamExt;

    let mut buf = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn open_streams_file_contents() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data = vec![42u8; READ_CHUNK_SIZE + 10];
        tmp.write_all(&data).unwrap();

        let source = FileSource::open(tmp.path()).await.unwrap();
        let FileSource::Stream(stream) = source else {
            panic!("expected a stream");
        };
        assert_eq!(collect(stream).await.unwrap(), data);
    }

    #[tokio::test]
    async fn open_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSource::open(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
