use bytes::Bytes;
use n0_error::e;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::body::BodySender;
use crate::error::ForwardError;

/// How a body copy ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyOutcome {
    /// The whole body was delivered.
    Complete(u64),
    /// The client went away. Holds the number of bytes delivered before that.
    Cancelled(u64),
}

/// Copies a response body from `reader` to the client through `buf`.
///
/// With `expected` set, exactly that many bytes are read and a premature end of the upstream body
/// is a [`ForwardError::ShortRead`]. Without it the copy runs until the reader signals end of
/// stream. `on_chunk` is called with the size of every chunk handed to the client.
pub(crate) async fn copy_body(
    reader: &mut (impl AsyncRead + Unpin),
    sender: &BodySender,
    buf: &mut [u8],
    expected: Option<u64>,
    on_chunk: impl FnMut(u64),
) -> Result<CopyOutcome, ForwardError> {
    match expected {
        Some(expected) => copy_exact(reader, sender, buf, expected, on_chunk).await,
        None => copy_to_end(reader, sender, buf, on_chunk).await,
    }
}

async fn copy_exact(
    reader: &mut (impl AsyncRead + Unpin),
    sender: &BodySender,
    buf: &mut [u8],
    expected: u64,
    mut on_chunk: impl FnMut(u64),
) -> Result<CopyOutcome, ForwardError> {
    let mut remaining = expected;
    while remaining > 0 {
        let len = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let Some(n) = read_chunk(reader, sender, &mut buf[..len]).await? else {
            return Ok(CopyOutcome::Cancelled(expected - remaining));
        };
        if n == 0 {
            return Err(e!(ForwardError::ShortRead {
                remaining,
                expected
            }));
        }
        if write_chunk(sender, &buf[..n]).await.is_err() {
            return Ok(CopyOutcome::Cancelled(expected - remaining));
        }
        remaining -= n as u64;
        on_chunk(n as u64);
    }
    Ok(CopyOutcome::Complete(expected))
}

async fn copy_to_end(
    reader: &mut (impl AsyncRead + Unpin),
    sender: &BodySender,
    buf: &mut [u8],
    mut on_chunk: impl FnMut(u64),
) -> Result<CopyOutcome, ForwardError> {
    let mut copied = 0u64;
    loop {
        let Some(n) = read_chunk(reader, sender, buf).await? else {
            return Ok(CopyOutcome::Cancelled(copied));
        };
        if n == 0 {
            return Ok(CopyOutcome::Complete(copied));
        }
        if write_chunk(sender, &buf[..n]).await.is_err() {
            return Ok(CopyOutcome::Cancelled(copied));
        }
        copied += n as u64;
        on_chunk(n as u64);
    }
}

/// Reads the next chunk, or returns `None` if the client disconnects while waiting.
async fn read_chunk(
    reader: &mut (impl AsyncRead + Unpin),
    sender: &BodySender,
    buf: &mut [u8],
) -> Result<Option<usize>, ForwardError> {
    tokio::select! {
        biased;
        _ = sender.closed() => Ok(None),
        res = reader.read(buf) => res
            .map(Some)
            .map_err(|source| e!(ForwardError::Read { source })),
    }
}

/// Hands a chunk to the client, failing if the client is gone afterwards.
async fn write_chunk(sender: &BodySender, chunk: &[u8]) -> Result<(), super::body::Disconnected> {
    sender.send(Bytes::copy_from_slice(chunk)).await?;
    if sender.is_closed() {
        return Err(super::body::Disconnected);
    }
    Ok(())
}
