//! The monitor process: reads the line protocol and draws the live request table.

use std::io::Write;

use n0_error::Result;
use n0_future::task::AbortOnDropHandle;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

pub use self::{
    processor::{
        MonitorShared, REMOVE_DELAY, UPDATE_QUEUE_CAPACITY, UpdateProcessor, read_lines,
    },
    render::{DisplaySize, Renderer},
    state::{OngoingRequest, RequestState, RequestTable},
};

pub mod processor;
pub mod render;
pub mod state;

/// Options for [`run`].
#[derive(Debug, Clone, Default)]
pub struct MonitorOpts {
    /// Fixed display size. When unset the terminal is queried before every repaint.
    pub size: Option<DisplaySize>,
}

impl MonitorOpts {
    /// Draws for a fixed display size instead of the terminal's.
    pub fn size(mut self, size: DisplaySize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Runs the monitor until `input` ends or carries an invalid line.
///
/// The table is drawn to `out`. An invalid line stops the monitor with an error.
pub async fn run(
    input: impl AsyncRead + Unpin + Send + 'static,
    out: impl Write,
    opts: MonitorOpts,
) -> Result<()> {
    let shared = MonitorShared::new();
    let (tx, processor) = UpdateProcessor::new(shared.clone());
    let _reader = AbortOnDropHandle::new(tokio::spawn(async move {
        if let Err(err) = read_lines(input, tx).await {
            warn!("Failed to read updates: {err:#}");
        }
    }));
    let (processed, rendered) = tokio::join!(
        processor.run(),
        Renderer::new().run(&shared, out, opts.size)
    );
    debug!("monitor finished");
    rendered?;
    processed?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use n0_tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn draws_until_input_ends() {
        let input: &'static [u8] =
            b"1 new 127.0.0.1 GET /a\n1 sent\n1 length 100\n1 progress 50\n2 new 10.1.1.1 HEAD /b\n";
        let mut out = Vec::new();
        run(input, &mut out, MonitorOpts::default().size(DisplaySize::new(120, 6)))
            .await
            .unwrap();
        let screen = String::from_utf8_lossy(&out);
        assert!(screen.contains("        1 | 127.0.0.1       | GET /a"));
        assert!(screen.contains("50 / 100 ["));
        assert!(screen.contains("        2 | 10.1.1.1        | HEAD /b"));
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_input_is_an_error() {
        let input: &'static [u8] = b"1 new 127.0.0.1 GET /a\nnot a record\n";
        let mut out = Vec::new();
        let res = run(input, &mut out, MonitorOpts::default().size(DisplaySize::new(80, 4))).await;
        assert!(res.is_err());
    }
}
