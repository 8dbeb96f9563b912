use std::{
    fs::OpenOptions,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use crossterm::{ExecutableCommand, cursor};
use cruft_proxy::{
    CruftRemoverProxy, DEFAULT_STRIP_PARAM, ForwardOpts, MonitorLauncher, Notifier, NullNotifier,
    monitor::{self, DisplaySize, MonitorOpts},
};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Log file used while the monitor draws on the terminal, unless `--log-file` is given.
const DEFAULT_LOG_FILE: &str = "cruft-proxy.log";

#[derive(Parser)]
#[clap(version, about)]
enum Cli {
    /// Run the proxy, with the monitor in a child process.
    Proxy(ProxyArgs),
    /// Draw the live request table from updates read on stdin.
    Monitor {
        /// Fixed display width. The terminal size is used if unset.
        #[clap(long, requires = "height")]
        width: Option<u16>,
        /// Fixed display height. The terminal size is used if unset.
        #[clap(long, requires = "width")]
        height: Option<u16>,
    },
}

#[derive(Parser)]
struct ProxyArgs {
    /// Base URI of the upstream (e.g. "http://localhost:8080").
    #[clap(short, long, env = "CRUFT_PROXY_TARGET")]
    target: String,
    /// Address to accept client connections on.
    #[clap(short, long, env = "CRUFT_PROXY_LISTEN", default_value = "0.0.0.0:8887")]
    listen: SocketAddr,
    /// Query parameter removed from every request.
    #[clap(long, env = "CRUFT_PROXY_STRIP_PARAM", default_value = DEFAULT_STRIP_PARAM)]
    strip_param: String,
    /// Do not launch the monitor.
    #[clap(long)]
    no_monitor: bool,
    /// Seconds to wait when connecting to the upstream.
    #[clap(long, default_value_t = 10)]
    connect_timeout_secs: u64,
    /// Number of idle copy buffers kept for reuse.
    #[clap(long)]
    max_retained_buffers: Option<usize>,
    /// Append logs to this file instead of stderr.
    ///
    /// While the monitor shares the terminal, logs go to `cruft-proxy.log` unless this is set.
    #[clap(long, env = "CRUFT_PROXY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::Proxy(args) => cmd_proxy(args).await,
        Cli::Monitor { width, height } => {
            let guard = init_tracing("warn", None)?;
            let size = width.zip(height).map(|(w, h)| DisplaySize::new(w, h));
            let code = match cmd_monitor(size).await {
                Ok(()) => 0,
                Err(err) => {
                    error!("monitor failed: {err:#}");
                    1
                }
            };
            drop(guard);
            // Reading stdin occupies a blocking thread that would keep the runtime alive.
            std::process::exit(code)
        }
    }
}

/// Installs the log subscriber, writing to `file` if set and to stderr otherwise.
///
/// Logs are written from a background thread until the returned guard is dropped.
fn init_tracing(default_filter: &str, file: Option<&Path>) -> Result<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (writer, guard) = match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .std_context("failed to open log file")?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(file.is_none())
        .with_writer(writer)
        .init();
    Ok(guard)
}

/// Where the proxy logs to. Logs must stay off the terminal while the monitor draws on it.
fn log_file(explicit: Option<PathBuf>, monitor_launched: bool) -> Option<PathBuf> {
    explicit.or_else(|| monitor_launched.then(|| PathBuf::from(DEFAULT_LOG_FILE)))
}

async fn cmd_proxy(args: ProxyArgs) -> Result<()> {
    let launched = (!args.no_monitor).then(|| MonitorLauncher::new().launch());
    let log_path = log_file(args.log_file.clone(), matches!(launched, Some(Ok(_))));
    let _guard = init_tracing("info", log_path.as_deref())?;
    let monitor = match launched {
        Some(Ok(monitor)) => Some(monitor),
        Some(Err(err)) => {
            warn!("Failed to launch monitor, continuing without: {err:#}");
            None
        }
        None => None,
    };
    let notifier: Arc<dyn Notifier> = match monitor.as_ref() {
        Some(monitor) => monitor.notifier(),
        None => Arc::new(NullNotifier),
    };

    let mut opts = ForwardOpts::new(args.target)
        .strip_param(args.strip_param)
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs));
    if let Some(max) = args.max_retained_buffers {
        opts = opts.max_retained_buffers(max);
    }
    let proxy = CruftRemoverProxy::new(opts, notifier)?;
    let listener = TcpListener::bind(args.listen)
        .await
        .std_context("failed to bind listener")?;
    info!(addr = %listener.local_addr()?, "proxy listening");

    let res = tokio::select! {
        res = proxy.serve(listener) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };
    if let Some(monitor) = monitor {
        monitor.shutdown().await?;
    }
    res
}

async fn cmd_monitor(size: Option<DisplaySize>) -> Result<()> {
    let opts = MonitorOpts { size };
    let res = tokio::select! {
        res = monitor::run(tokio::io::stdin(), std::io::stdout(), opts) => res,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };
    std::io::stdout().execute(cursor::Show).ok();
    res
}
