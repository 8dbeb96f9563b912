use std::time::Duration;

use crate::rewrite::DEFAULT_STRIP_PARAM;

/// Configuration for a [`CruftRemoverProxy`](super::CruftRemoverProxy).
///
/// Only the upstream base URI is required. Everything else has a usable default.
#[derive(Debug, Clone)]
pub struct ForwardOpts {
    /// Scheme, host and optional port of the upstream, e.g. `http://localhost:8080`.
    pub target_base_uri: String,
    /// Query parameter removed from every forwarded request.
    pub strip_param: String,
    /// Number of idle copy buffers kept around. `None` picks a default from the CPU count.
    pub max_retained_buffers: Option<usize>,
    /// Maximum time to wait when connecting to the upstream.
    pub connect_timeout: Duration,
}

impl ForwardOpts {
    pub fn new(target_base_uri: impl Into<String>) -> Self {
        Self {
            target_base_uri: target_base_uri.into(),
            strip_param: DEFAULT_STRIP_PARAM.to_string(),
            max_retained_buffers: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the query parameter to strip.
    pub fn strip_param(mut self, param: impl Into<String>) -> Self {
        self.strip_param = param.into();
        self
    }

    /// Sets the number of idle copy buffers kept for reuse.
    pub fn max_retained_buffers(mut self, max: usize) -> Self {
        self.max_retained_buffers = Some(max);
        self
    }

    /// Sets the upstream connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
