use std::sync::Mutex;

use n0_future::task::AbortOnDropHandle;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, trace, warn};

use crate::protocol::{Event, Record, RequestId};

/// Receives lifecycle notifications for every proxied request.
///
/// The forwarder calls these synchronously, in order, from the task that handles the request:
/// `new_request` on admission, `sent` once the upstream request is dispatched, `length` if the
/// response announces a content length, `progress` for every copied chunk, and `end` exactly once
/// when the exchange is over, no matter how it ended.
pub trait Notifier: Send + Sync {
    fn new_request(&self, id: RequestId, client_ip: &str, method: &str, path: &str);
    fn sent(&self, id: RequestId);
    fn length(&self, id: RequestId, expected: u64);
    fn progress(&self, id: RequestId, delta: u64);
    fn end(&self, id: RequestId);
}

/// Notifier that discards everything. Used when no monitor is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn new_request(&self, _id: RequestId, _client_ip: &str, _method: &str, _path: &str) {}
    fn sent(&self, _id: RequestId) {}
    fn length(&self, _id: RequestId, _expected: u64) {}
    fn progress(&self, _id: RequestId, _delta: u64) {}
    fn end(&self, _id: RequestId) {}
}

/// Lines queued for the monitor before a notifier gives up on it.
pub const LINE_QUEUE_CAPACITY: usize = 4096;

/// Notifier that sends protocol lines to a byte sink, usually the stdin of the monitor process.
///
/// Lines are formatted and queued under one lock, so concurrent requests never interleave, and
/// written by a separate task. Notifying never waits on the sink: when the queue is full or the
/// writer has failed, the notifier detaches for good and every later notification is a no-op.
#[derive(derive_more::Debug)]
pub struct LineNotifier {
    #[debug("Mutex<Option<mpsc::Sender<String>>>")]
    queue: Mutex<Option<mpsc::Sender<String>>>,
}

impl LineNotifier {
    /// Creates a notifier and spawns the task writing its lines to `sink`.
    ///
    /// The task finishes once the notifier is detached and the queued lines are written, or when
    /// a write fails. The sink is dropped when it finishes.
    pub fn spawn<W>(sink: W, capacity: usize) -> (Self, AbortOnDropHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let writer = AbortOnDropHandle::new(tokio::spawn(write_lines(sink, rx)));
        let notifier = Self {
            queue: Mutex::new(Some(tx)),
        };
        (notifier, writer)
    }

    /// Returns `true` while lines are still being accepted.
    pub fn is_attached(&self) -> bool {
        self.queue.lock().map(|queue| queue.is_some()).unwrap_or(false)
    }

    /// Stops accepting lines. The writer closes the sink after the queued lines.
    pub fn detach(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.take();
        }
    }

    fn deliver(&self, id: RequestId, event: Event) {
        let Ok(mut guard) = self.queue.lock() else {
            return;
        };
        let Some(queue) = guard.as_ref() else {
            return;
        };
        let record = Record::new(id, event);
        match queue.try_send(format!("{record}\n")) {
            Ok(()) => trace!(%record, "queued"),
            Err(err) => {
                warn!("monitor is not taking updates, detaching: {err}");
                *guard = None;
            }
        }
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(mut sink: W, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let res = match sink.write_all(line.as_bytes()).await {
            Ok(()) => sink.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            warn!("monitor sink failed: {err:#}");
            return;
        }
    }
    debug!("monitor sink closed");
}

impl Notifier for LineNotifier {
    fn new_request(&self, id: RequestId, client_ip: &str, method: &str, path: &str) {
        self.deliver(
            id,
            Event::New {
                client_ip: client_ip.to_string(),
                method: method.to_string(),
                path: path.to_string(),
            },
        )
    }

    fn sent(&self, id: RequestId) {
        self.deliver(id, Event::Sent)
    }

    fn length(&self, id: RequestId, expected: u64) {
        self.deliver(id, Event::Length(expected))
    }

    fn progress(&self, id: RequestId, delta: u64) {
        self.deliver(id, Event::Progress(delta))
    }

    fn end(&self, id: RequestId) {
        self.deliver(id, Event::End)
    }
}
