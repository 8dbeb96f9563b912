//! Reverse proxy that removes a tracking query parameter from every request, with a live
//! per-request progress table drawn by a separate monitor process.

mod error;
mod forward;
mod launch;
pub mod monitor;
mod notify;
mod pool;
mod protocol;
mod rewrite;

pub use {
    error::{ForwardError, ProtocolError},
    forward::{CruftRemoverProxy, ForwardOpts, ResponseBody},
    launch::{LaunchedMonitor, MONITOR_SUBCOMMAND, MonitorLauncher},
    notify::{LINE_QUEUE_CAPACITY, LineNotifier, Notifier, NullNotifier},
    pool::{BUFFER_SIZE, BufferLease, BufferPool},
    protocol::{Event, Record, RecordLine, RequestId},
    rewrite::{DEFAULT_STRIP_PARAM, RequestRewriter, strip_query_param},
};
