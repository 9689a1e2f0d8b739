use bytes::Bytes;
use parcel_storage::{ByteStream, StorageError};

pub const UPLOAD_ID: &str = "upload0123456789";
pub const FILE_ID: &str = "file000123456789";

/// Body split into fixed-size chunks.
#[allow(dead_code)]
pub fn chunked_body(data: &[u8], chunk: usize) -> ByteStream {
    let chunks: Vec<_> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

/// Body that yields some bytes then fails.
#[allow(dead_code)]
pub fn failing_body(prefix: &'static str) -> ByteStream {
    Box::pin(futures::stream::iter(vec![
        Ok(Bytes::from_static(prefix.as_bytes())),
        Err(StorageError::io("client disconnected")),
    ]))
}
