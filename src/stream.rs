//! Byte-stream plumbing shared by the backends and the scanner.

use std::io;
use std::pin::Pin;

use async_compression::tokio::bufread::GzipDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// A readable byte stream handed out by a backend.
///
/// Dropping the stream releases whatever connection or file handle backs it.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Discard exactly `count` bytes from the front of `reader`.
///
/// Fails with [`io::ErrorKind::UnexpectedEof`] if the stream ends first.
pub async fn skip_bytes<R>(reader: &mut R, count: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if count == 0 {
        return Ok(());
    }
    let skipped = tokio::io::copy(&mut reader.take(count), &mut tokio::io::sink()).await?;
    if skipped < count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {} of {} skipped bytes", skipped, count),
        ));
    }
    Ok(())
}

/// Wrap a gzip-compressed stream in a streaming decoder.
///
/// Concatenated gzip members are decoded back to back.
pub fn gunzip(stream: ByteStream) -> ByteStream {
    let mut decoder = GzipDecoder::new(BufReader::new(stream));
    decoder.multiple_members(true);
    Box::pin(decoder)
}
