//! Reverse proxy that strips the tracking parameter and streams responses back.

use std::{
    convert::Infallible,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use http::{
    HeaderValue, Method, Request, Response, StatusCode,
    header::CONTENT_LENGTH,
};
use hyper::{
    body::{Body, Incoming},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use n0_error::{Result, StdResultExt, e};
use n0_future::TryStreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{Instrument, Span, debug, error_span, warn};

pub use self::{body::ResponseBody, opts::ForwardOpts};
use self::copy::{CopyOutcome, copy_body};
use crate::{
    error::ForwardError,
    notify::Notifier,
    pool::BufferPool,
    protocol::RequestId,
    rewrite::RequestRewriter,
};

mod body;
mod copy;
mod opts;

/// Reverse proxy relaying every request to one upstream, minus the tracking query parameter.
///
/// Each request gets a fresh [`RequestId`] and its lifecycle is reported to the configured
/// [`Notifier`]. Response bodies are streamed through pooled buffers, never buffered whole.
///
/// Cloning is cheap, all clones share the id counter, the HTTP client and the buffer pool.
#[derive(Clone, Debug)]
pub struct CruftRemoverProxy {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    rewriter: RequestRewriter,
    client: reqwest::Client,
    #[debug("Arc<dyn Notifier>")]
    notifier: Arc<dyn Notifier>,
    pool: BufferPool,
    next_id: AtomicU64,
}

impl CruftRemoverProxy {
    pub fn new(opts: ForwardOpts, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(opts.connect_timeout)
            .build()
            .std_context("failed to build HTTP client")?;
        let pool = opts
            .max_retained_buffers
            .map(BufferPool::new)
            .unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                rewriter: RequestRewriter::new(opts.target_base_uri, opts.strip_param),
                client,
                notifier,
                pool,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Accepts connections from the listener and serves each in a new task.
    ///
    /// Runs until accepting fails. Dropping the returned future cancels all connection tasks.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel_token = CancellationToken::new();
        let _cancel_guard = cancel_token.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(
                cancel_token
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        debug!(%client_addr, "accepted connection");
                        if let Err(err) = this.serve_connection(client_addr, stream).await {
                            warn!("Failed to serve connection: {err:#}");
                        }
                    })
                    .instrument(error_span!("conn", id)),
            );
            id += 1;
        }
    }

    async fn serve_connection(&self, client_addr: SocketAddr, stream: TcpStream) -> Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(|request: Request<Incoming>| {
            let this = self.clone();
            async move { Ok::<_, Infallible>(this.handle_request(client_addr, request).await) }
        });
        auto::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await?;
        Ok(())
    }

    /// Forwards one request and returns the response to send to the client.
    ///
    /// Never fails: faults before the upstream answered turn into an empty error response. The
    /// response body is fed by a background task that ends with the exchange.
    pub async fn handle_request<B>(
        &self,
        client_addr: SocketAddr,
        request: Request<B>,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        async {
            match self.forward(id, client_addr, request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("Failed to forward request: {err:#}");
                    error_response(err.response_status())
                }
            }
        }
        .instrument(error_span!("request", %id))
        .await
    }

    async fn forward<B>(
        &self,
        id: RequestId,
        client_addr: SocketAddr,
        request: Request<B>,
    ) -> Result<Response<ResponseBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let inner = &self.inner;
        let method = request.method().clone();
        let path = request
            .uri()
            .path_and_query()
            .map_or("/", |path| path.as_str());
        inner
            .notifier
            .new_request(id, &client_addr.ip().to_string(), method.as_str(), path);
        let guard = ExchangeGuard {
            id,
            notifier: inner.notifier.clone(),
        };

        let outbound = inner.rewriter.rewrite(&inner.client, request)?;
        debug!(%method, url = %outbound.url(), "forwarding to upstream");
        inner.notifier.sent(id);
        let response = inner
            .client
            .execute(outbound)
            .await
            .map_err(|source| e!(ForwardError::Upstream { source }))?;

        let status = response.status();
        debug!(%status, "response from upstream");
        let bodyless = method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let expected = match response.headers().get(CONTENT_LENGTH) {
            _ if bodyless => Some(0),
            Some(value) => Some(parse_content_length(value)?),
            None => None,
        };
        if let Some(expected) = expected {
            inner.notifier.length(id, expected);
        }

        let mut head = Response::builder().status(status);
        for (name, value) in response.headers() {
            head = head.header(name, value);
        }

        if bodyless {
            return head
                .body(ResponseBody::empty())
                .map_err(|source| e!(ForwardError::Response { source }));
        }

        let (sender, body) = ResponseBody::channel();
        let head = head
            .body(body)
            .map_err(|source| e!(ForwardError::Response { source }))?;

        let mut reader = StreamReader::new(Box::pin(
            response.bytes_stream().map_err(io::Error::other),
        ));
        let notifier = inner.notifier.clone();
        let pool = inner.pool.clone();
        tokio::spawn(
            async move {
                let _guard = guard;
                let res = {
                    let mut buf = pool.lease();
                    copy_body(&mut reader, &sender, &mut buf, expected, |n| {
                        notifier.progress(id, n)
                    })
                    .await
                };
                match res {
                    Ok(CopyOutcome::Complete(total)) => debug!(total, "response complete"),
                    Ok(CopyOutcome::Cancelled(total)) => {
                        debug!(total, "client disconnected, copy cancelled")
                    }
                    Err(err) => {
                        warn!("Failed to relay response body: {err:#}");
                        sender.abort(io::Error::other(err.to_string())).await;
                    }
                }
            }
            .instrument(Span::current()),
        );
        Ok(head)
    }
}

/// Reports the end of an exchange when dropped, whichever way the exchange ended.
struct ExchangeGuard {
    id: RequestId,
    notifier: Arc<dyn Notifier>,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        debug!("exchange finished");
        self.notifier.end(self.id);
    }
}

fn parse_content_length(value: &HeaderValue) -> Result<u64, ForwardError> {
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| {
            e!(ForwardError::InvalidContentLength {
                value: String::from_utf8_lossy(value.as_bytes()).into_owned()
            })
        })
}

fn error_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_parsing() {
        assert_eq!(
            parse_content_length(&HeaderValue::from_static("1000")).unwrap(),
            1000
        );
        assert_eq!(
            parse_content_length(&HeaderValue::from_static(" 42 ")).unwrap(),
            42
        );
        for bad in ["", "-1", "12a", "1,2"] {
            let err = parse_content_length(&HeaderValue::from_static(bad)).unwrap_err();
            assert!(matches!(err, ForwardError::InvalidContentLength { .. }));
        }
    }

    #[test]
    fn error_response_is_empty() {
        let response = error_response(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        assert!(response.body().is_end_stream());
    }
}
