//! Starts the monitor as a child process fed through its stdin.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt, anyerr};
use n0_future::task::AbortOnDropHandle;
use tokio::process::{Child, Command};
use tokio_util::time::FutureExt;
use tracing::{debug, warn};

use crate::notify::{LINE_QUEUE_CAPACITY, LineNotifier};

/// Subcommand that makes the binary run as the monitor.
pub const MONITOR_SUBCOMMAND: &str = "monitor";

/// How long shutdown waits for queued lines to reach the monitor.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches the monitor process.
///
/// By default the current executable is started again with the [`MONITOR_SUBCOMMAND`]. Its stdin
/// is a pipe the returned notifier writes to, stdout and stderr are inherited. Must be called
/// from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct MonitorLauncher {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl Default for MonitorLauncher {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![MONITOR_SUBCOMMAND.to_string()],
        }
    }
}

impl MonitorLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `program` with exactly `args` instead of the monitor subcommand of this executable.
    pub fn command(
        mut self,
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.program = Some(program.into());
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn launch(&self) -> Result<LaunchedMonitor> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().std_context("failed to locate current executable")?,
        };
        let mut child = Command::new(&program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .spawn()
            .std_context("failed to spawn monitor process")?;
        let Some(stdin) = child.stdin.take() else {
            child.start_kill().ok();
            return Err(anyerr!("monitor process has no stdin"));
        };
        debug!(pid = ?child.id(), program = %program.display(), "monitor launched");
        let (notifier, writer) = LineNotifier::spawn(stdin, LINE_QUEUE_CAPACITY);
        Ok(LaunchedMonitor {
            child,
            notifier: Arc::new(notifier),
            writer,
        })
    }
}

/// A running monitor process.
#[derive(Debug)]
pub struct LaunchedMonitor {
    child: Child,
    notifier: Arc<LineNotifier>,
    writer: AbortOnDropHandle<()>,
}

impl LaunchedMonitor {
    /// Notifier writing to the monitor's stdin.
    pub fn notifier(&self) -> Arc<LineNotifier> {
        self.notifier.clone()
    }

    /// Closes the monitor's input and waits for it to exit.
    ///
    /// Lines still queued are written first, unless the monitor stops reading them.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            mut child,
            notifier,
            writer,
        } = self;
        notifier.detach();
        if writer.timeout(DRAIN_TIMEOUT).await.is_err() {
            warn!("monitor did not take the remaining updates");
        }
        let status = child
            .wait()
            .await
            .std_context("failed to wait for monitor process")?;
        if !status.success() {
            warn!(%status, "monitor exited with failure");
        }
        Ok(())
    }
}
