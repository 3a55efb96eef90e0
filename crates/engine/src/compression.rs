//! Chunk compression.
//!
//! Chunks are gzip-compressed on first write. The compressed form is kept
//! only when it is smaller than the raw chunk; already-compressed content
//! (media, archives) is stored as-is.

use async_compression::tokio::write::{GzipDecoder, GzipEncoder};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

/// Bytes as they will be written to the blob store.
pub struct EncodedChunk {
    pub data: Bytes,
    pub compressed: bool,
}

/// Gzip `data`, falling back to the raw bytes unless compression saves space.
pub async fn gzip_if_smaller(data: &Bytes) -> std::io::Result<EncodedChunk> {
    let mut output = Vec::new();
    let mut encoder = GzipEncoder::with_quality(&mut output, async_compression::Level::Default);
    encoder.write_all(data).await?;
    encoder.shutdown().await?;

    if output.len() < data.len() {
        Ok(EncodedChunk {
            data: Bytes::from(output),
            compressed: true,
        })
    } else {
        Ok(EncodedChunk {
            data: data.clone(),
            compressed: false,
        })
    }
}

/// Inflate a gzip-compressed chunk.
pub async fn gunzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut output = Vec::new();
    let mut decoder = GzipDecoder::new(&mut output);
    decoder.write_all(data).await?;
    decoder.shutdown().await?;
    Ok(Bytes::from(output))
}
