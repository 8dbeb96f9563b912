use std::borrow::Cow;

use bytes::Bytes;
use http::{
    Request, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
};
use http_body_util::BodyExt;
use hyper::body::Body;
use n0_error::e;

use crate::error::ForwardError;

/// Query parameter removed from forwarded requests unless configured otherwise.
pub const DEFAULT_STRIP_PARAM: &str = "fbclid";

/// Rewrites inbound requests into requests against the configured upstream.
///
/// The rewritten request keeps method, path and every header of the inbound request. The
/// configured query parameter is dropped, and the body is streamed through when the inbound
/// request declares a content type.
#[derive(Debug, Clone)]
pub struct RequestRewriter {
    base_uri: String,
    strip_param: String,
}

impl RequestRewriter {
    pub fn new(base_uri: impl Into<String>, strip_param: impl Into<String>) -> Self {
        let mut base_uri = base_uri.into();
        while base_uri.ends_with('/') {
            base_uri.pop();
        }
        Self {
            base_uri,
            strip_param: strip_param.into(),
        }
    }

    /// Name of the query parameter this rewriter removes.
    pub fn strip_param(&self) -> &str {
        &self.strip_param
    }

    /// Builds the upstream URI for an inbound request target.
    pub fn destination(&self, uri: &Uri) -> String {
        let path = uri.path();
        match uri
            .query()
            .and_then(|query| strip_query_param(query, &self.strip_param))
        {
            Some(query) => format!("{}{path}?{query}", self.base_uri),
            None => format!("{}{path}", self.base_uri),
        }
    }

    /// Converts an inbound request into the request sent upstream.
    pub fn rewrite<B>(
        &self,
        client: &reqwest::Client,
        request: Request<B>,
    ) -> Result<reqwest::Request, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let destination = self.destination(&parts.uri);
        let mut outbound = client
            .request(parts.method, destination)
            .build()
            .map_err(|source| e!(ForwardError::Upstream { source }))?;

        let mut headers = parts.headers;
        let content_type = headers
            .get(CONTENT_TYPE)
            .filter(|value| !value.as_bytes().trim_ascii().is_empty())
            .cloned();
        match content_type {
            Some(content_type) => {
                headers.insert(CONTENT_TYPE, content_type);
                *outbound.body_mut() = Some(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
            None => {
                // Without a body the framing headers would make the upstream wait for one.
                headers.remove(CONTENT_LENGTH);
                headers.remove(TRANSFER_ENCODING);
            }
        }
        *outbound.headers_mut() = headers;
        Ok(outbound)
    }
}

/// Removes every `key` pair from a raw query string.
///
/// All other pairs keep their order and encoding. A query without `key` is returned unchanged.
/// Returns `None` when no pair remains, so callers can omit the `?` entirely.
pub fn strip_query_param<'a>(query: &'a str, key: &str) -> Option<Cow<'a, str>> {
    let is_key = |pair: &str| pair.split_once('=').map_or(pair, |(name, _)| name) == key;
    if !query.split('&').any(is_key) {
        return (!query.is_empty()).then_some(Cow::Borrowed(query));
    }
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !is_key(pair))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(Cow::Owned(kept.join("&")))
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method};
    use http_body_util::{Empty, Full};

    use super::*;

    fn rewriter() -> RequestRewriter {
        RequestRewriter::new("http://upstream.test:8080/", DEFAULT_STRIP_PARAM)
    }

    #[test]
    fn strips_tracking_param() {
        assert_eq!(
            strip_query_param("a=1&fbclid=xyz&b=2", "fbclid").as_deref(),
            Some("a=1&b=2")
        );
        assert_eq!(
            strip_query_param("fbclid=1&a=%20x&fbclid=2", "fbclid").as_deref(),
            Some("a=%20x")
        );
    }

    #[test]
    fn query_without_key_is_unchanged() {
        let query = "a=1&&b=%2F+c&fbclidx=3";
        let stripped = strip_query_param(query, "fbclid");
        assert!(matches!(stripped, Some(Cow::Borrowed(q)) if q == query));
    }

    #[test]
    fn key_only_query_yields_nothing() {
        assert_eq!(strip_query_param("fbclid=abc", "fbclid"), None);
        assert_eq!(strip_query_param("fbclid", "fbclid"), None);
        assert_eq!(strip_query_param("", "fbclid"), None);
    }

    #[test]
    fn key_match_is_case_sensitive() {
        assert_eq!(
            strip_query_param("FBCLID=1", "fbclid").as_deref(),
            Some("FBCLID=1")
        );
    }

    #[test]
    fn stripping_is_idempotent() {
        let once = strip_query_param("x=1&fbclid=2&y=3", "fbclid").unwrap();
        let twice = strip_query_param(&once, "fbclid").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn destination_joins_base_path_and_query() {
        let rewriter = rewriter();
        let uri: Uri = "/articles/1?fbclid=abc".parse().unwrap();
        assert_eq!(
            rewriter.destination(&uri),
            "http://upstream.test:8080/articles/1"
        );
        let uri: Uri = "/articles/1?page=2&fbclid=abc".parse().unwrap();
        assert_eq!(
            rewriter.destination(&uri),
            "http://upstream.test:8080/articles/1?page=2"
        );
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(rewriter.destination(&uri), "http://upstream.test:8080/");
    }

    #[test]
    fn rewrite_relays_headers_verbatim() {
        let client = reqwest::Client::new();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/feed?fbclid=1")
            .header("x-multi", "one")
            .header("x-multi", "two")
            .header("x-odd", HeaderValue::from_bytes(b"weird;; \"value\" \xfe\xff").unwrap())
            .body(Empty::<Bytes>::new())
            .unwrap();
        let outbound = rewriter().rewrite(&client, request).unwrap();
        assert_eq!(outbound.method(), Method::GET);
        assert_eq!(outbound.url().as_str(), "http://upstream.test:8080/feed");
        let multi: Vec<_> = outbound.headers().get_all("x-multi").iter().collect();
        assert_eq!(multi, ["one", "two"]);
        assert_eq!(
            outbound.headers().get("x-odd").unwrap().as_bytes(),
            b"weird;; \"value\" \xfe\xff"
        );
        assert!(outbound.body().is_none());
    }

    #[test]
    fn rewrite_streams_body_with_content_type() {
        let client = reqwest::Client::new();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, "2")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let outbound = rewriter().rewrite(&client, request).unwrap();
        assert!(outbound.body().is_some());
        assert_eq!(
            outbound.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(outbound.headers().get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(outbound.headers().get(CONTENT_LENGTH).unwrap(), "2");
    }

    #[test]
    fn rewrite_drops_body_without_content_type() {
        let client = reqwest::Client::new();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(CONTENT_LENGTH, "5")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap();
        let outbound = rewriter().rewrite(&client, request).unwrap();
        assert!(outbound.body().is_none());
        assert!(outbound.headers().get(CONTENT_LENGTH).is_none());
    }
}
