//! Channel-backed response body handed to hyper.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use hyper::body::{Body, Frame};
use tokio::sync::mpsc;

/// Response body fed chunk by chunk from a copy task.
///
/// Dropping the body (hyper does this when the client goes away) closes the channel, which the
/// copy task observes through [`BodySender::is_closed`].
#[derive(Debug)]
pub struct ResponseBody {
    rx: Option<mpsc::Receiver<io::Result<Bytes>>>,
}

impl ResponseBody {
    /// Creates a body together with the sender that feeds it.
    ///
    /// The channel holds a single chunk, so every send waits for the previous chunk to be taken
    /// by hyper.
    pub(crate) fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(1);
        (BodySender { tx }, Self { rx: Some(rx) })
    }

    /// A body without any data.
    pub fn empty() -> Self {
        Self { rx: None }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.as_mut() {
            None => Poll::Ready(None),
            Some(rx) => rx
                .poll_recv(cx)
                .map(|chunk| chunk.map(|res| res.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }
}

/// Writing half of a [`ResponseBody`].
#[derive(Debug)]
pub(crate) struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// The client dropped the response body.
#[derive(Debug)]
pub(crate) struct Disconnected;

impl BodySender {
    /// Hands one chunk to the client connection.
    pub(crate) async fn send(&self, chunk: Bytes) -> Result<(), Disconnected> {
        self.tx.send(Ok(chunk)).await.map_err(|_| Disconnected)
    }

    /// Returns `true` once the client side is gone.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes when the client side is gone.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }

    /// Ends the body with an error, which makes hyper abort the response instead of finishing it.
    pub(crate) async fn abort(self, err: io::Error) {
        self.tx.send(Err(err)).await.ok();
    }
}
