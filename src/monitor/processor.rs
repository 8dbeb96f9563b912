use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::{Notify, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::state::{Applied, RequestTable};
use crate::{
    error::ProtocolError,
    protocol::{Event, Record, RecordLine, RequestId},
};

/// How long a finished request stays on screen.
pub const REMOVE_DELAY: Duration = Duration::from_millis(200);

/// Lines read ahead of the processor. A full queue pauses reading the input.
pub const UPDATE_QUEUE_CAPACITY: usize = 1024;

/// State shared between the update processor and the renderer.
#[derive(Debug, Clone)]
pub struct MonitorShared {
    pub(crate) table: Arc<Mutex<RequestTable>>,
    pub(crate) dirty: Arc<Notify>,
    pub(crate) stop: CancellationToken,
}

impl Default for MonitorShared {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorShared {
    /// Creates the shared state with a pending dirty signal, so the first screen is drawn at once.
    pub fn new() -> Self {
        let dirty = Arc::new(Notify::new());
        dirty.notify_one();
        Self {
            table: Default::default(),
            dirty,
            stop: CancellationToken::new(),
        }
    }

    pub fn table(&self) -> MutexGuard<'_, RequestTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` once the monitor is shutting down.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Applies protocol lines to the request table, one at a time and in arrival order.
///
/// Finished requests are removed [`REMOVE_DELAY`] after their `end` by feeding a `remove` record
/// back into the same queue. Those timers hold only a weak handle on the queue, so once the input
/// is closed and drained pending removals are dropped.
///
/// Records for requests that are not in the table are skipped before their fields are parsed, as
/// are records of an unknown kind. Any other malformed line stops the processor.
#[derive(Debug)]
pub struct UpdateProcessor {
    shared: MonitorShared,
    rx: mpsc::Receiver<String>,
    requeue: mpsc::WeakSender<String>,
}

impl UpdateProcessor {
    /// Creates a processor and the sender that feeds it lines.
    pub fn new(shared: MonitorShared) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        let requeue = tx.downgrade();
        (
            tx,
            Self {
                shared,
                rx,
                requeue,
            },
        )
    }

    /// Processes lines until the input is closed or a line is malformed.
    ///
    /// Either way the renderer is told to stop after one last repaint.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let res = self.process().await;
        self.shared.stop.cancel();
        self.shared.dirty.notify_one();
        res
    }

    async fn process(&mut self) -> Result<(), ProtocolError> {
        loop {
            let line = tokio::select! {
                biased;
                _ = self.shared.stop.cancelled() => {
                    debug!("monitor stopped, leaving queued updates");
                    return Ok(());
                }
                line = self.rx.recv() => line,
            };
            let Some(line) = line else {
                debug!("update queue drained");
                return Ok(());
            };
            let Some(record) = self.parse(&line)? else {
                continue;
            };
            trace!(%record, "apply");
            let applied = self.shared.table().apply(record);
            match applied {
                Applied::Ignored => continue,
                Applied::Ended(id) => self.schedule_remove(id),
                Applied::Changed => {}
            }
            self.shared.dirty.notify_one();
        }
    }

    /// Parses `line` if it concerns a request in the table, or admits a new one.
    fn parse(&self, line: &str) -> Result<Option<Record>, ProtocolError> {
        let invalid = |err: &ProtocolError| error!(%line, "invalid update: {err:#}");
        let record = RecordLine::split(line).inspect_err(invalid)?;
        if !record.is_new() && !self.shared.table().contains(record.id) {
            trace!(%line, "unknown request, skipped");
            return Ok(None);
        }
        let kind = record.kind;
        let record = record.into_record().inspect_err(invalid)?;
        if record.is_none() {
            debug!(kind, "unknown update kind, skipped");
        }
        Ok(record)
    }

    fn schedule_remove(&self, id: RequestId) {
        let requeue = self.requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REMOVE_DELAY).await;
            if let Some(tx) = requeue.upgrade() {
                tx.send(Record::new(id, Event::Remove).to_string()).await.ok();
            }
        });
    }
}

/// Reads lines from `input` into the processor queue until end of input.
pub async fn read_lines(
    input: impl AsyncRead + Unpin,
    tx: mpsc::Sender<String>,
) -> io::Result<()> {
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}
