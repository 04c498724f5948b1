//! HTTP client side of the front door
//!
//! One pooled client forwards proxied requests to workers and the submission
//! service; a second, dedicated client issues liveness probes.

use crate::config::ProxyConfig;
use crate::error::{ClientBodyError, UpstreamError};
use crate::registry::ProbeOutcome;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used for everything the proxy sends or returns
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections kept per upstream address
    pub max_idle_per_host: usize,
    /// Longest silence tolerated on an upstream connection
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for UpstreamConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: config.upstream_idle_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Pooled HTTP/1.1 client towards local upstreams
pub struct UpstreamClient {
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for liveness probes
    health_client: Client<HttpConnector, Empty<Bytes>>,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            "Upstream client initialized"
        );

        Self {
            client,
            health_client,
            config,
        }
    }

    /// Forward a request to `addr`, keeping method, path, query and headers
    ///
    /// The idle timeout bounds every silent stretch of the exchange: between
    /// request body frames while the worker is not reading, between the end
    /// of the request body and the response head, and between response body
    /// frames. A client that stops sending its body fails with
    /// [`UpstreamError::ClientBody`] instead. Dropping the returned future or
    /// the response body tears the upstream connection down.
    pub async fn send(
        &self,
        req: Request<ProxyBody>,
        addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", addr, path);

        let idle_timeout = self.config.idle_timeout;
        let progress = Arc::new(Mutex::new(UploadProgress::new()));

        let (parts, body) = req.into_parts();
        let body = UploadBody::new(body, Arc::clone(&progress), idle_timeout).boxed();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let upstream_req = builder.body(body)?;

        let request = self.client.request(upstream_req);
        tokio::pin!(request);

        let response = loop {
            let deadline = progress.lock().idle_deadline(idle_timeout);
            tokio::select! {
                result = &mut request => break result?,
                _ = tokio::time::sleep_until(deadline) => {
                    if progress.lock().is_idle(idle_timeout) {
                        return Err(UpstreamError::Timeout(idle_timeout));
                    }
                }
            }
        };

        let (parts, body) = response.into_parts();
        let body = body.map_err(|e| Box::new(e) as BoxError).boxed();
        Ok(Response::from_parts(parts, IdleTimeoutBody::new(body, idle_timeout).boxed()))
    }

    /// Liveness probe: `GET http://127.0.0.1:{port}{path}` bounded by `timeout`
    ///
    /// On timeout the in-flight request future is dropped, which aborts the
    /// connection.
    pub async fn probe(&self, port: u16, path: &str, timeout: Duration) -> ProbeOutcome {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header(hyper::header::USER_AGENT, "forkgate-health-check")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return ProbeOutcome::Failed,
        };

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) if response.status() == hyper::StatusCode::OK => ProbeOutcome::Ready,
            Ok(Ok(response)) => ProbeOutcome::NotReady(response.status().as_u16()),
            Ok(Err(e)) => {
                debug!(port, error = %e, "Probe failed (connection error)");
                ProbeOutcome::Failed
            }
            Err(_) => {
                debug!(port, timeout_ms = timeout.as_millis() as u64, "Probe failed (timeout)");
                ProbeOutcome::TimedOut
            }
        }
    }
}

/// Where a forwarded request body stands, shared with the request watchdog
#[derive(Debug)]
struct UploadProgress {
    last_activity: Instant,
    waiting_on_client: bool,
}

impl UploadProgress {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
            waiting_on_client: false,
        }
    }

    fn idle_deadline(&self, timeout: Duration) -> Instant {
        if self.waiting_on_client {
            // The client's own silence is timed by UploadBody
            Instant::now() + timeout
        } else {
            self.last_activity + timeout
        }
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        !self.waiting_on_client && Instant::now() >= self.last_activity + timeout
    }
}

/// Request body that records progress and fails if the client goes silent
struct UploadBody {
    inner: ProxyBody,
    progress: Arc<Mutex<UploadProgress>>,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl UploadBody {
    fn new(inner: ProxyBody, progress: Arc<Mutex<UploadProgress>>, timeout: Duration) -> Self {
        Self {
            inner,
            progress,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl Body for UploadBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                let now = Instant::now();
                {
                    let mut progress = this.progress.lock();
                    progress.last_activity = now;
                    progress.waiting_on_client = false;
                }
                this.deadline.as_mut().reset(now + this.timeout);
                Poll::Ready(frame)
            }
            Poll::Pending => {
                {
                    let mut progress = this.progress.lock();
                    if !progress.waiting_on_client {
                        progress.waiting_on_client = true;
                        this.deadline.as_mut().reset(Instant::now() + this.timeout);
                    }
                }
                if this.deadline.as_mut().poll(cx).is_ready() {
                    let err: BoxError = Box::new(ClientBodyError::Idle(this.timeout));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body that fails once no frame arrived for `timeout`
pub struct IdleTimeoutBody {
    inner: ProxyBody,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: ProxyBody, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.deadline.as_mut().reset(Instant::now() + this.timeout);
                Poll::Ready(frame)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    let err: BoxError = Box::new(UpstreamError::Timeout(this.timeout));
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::StreamBody;

    #[test]
    fn test_upstream_config_default() {
        let config = UpstreamConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_refused_port_fails() {
        let client = UpstreamClient::new(UpstreamConfig::default());

        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = client.probe(port, "/health", Duration::from_secs(2)).await;
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn test_probe_silent_listener_times_out() {
        let client = UpstreamClient::new(UpstreamConfig::default());

        // Accepts the TCP connection but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let outcome = client.probe(port, "/health", Duration::from_millis(200)).await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        hold.abort();
    }

    #[tokio::test]
    async fn test_idle_timeout_body_passes_frames() {
        let body = IdleTimeoutBody::new(full_body("hello"), Duration::from_secs(1));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_body_fails_when_stalled() {
        let stalled = futures::stream::pending::<Result<Frame<Bytes>, BoxError>>();
        let inner = StreamBody::new(stalled).boxed();
        let body = IdleTimeoutBody::new(inner, Duration::from_secs(30));

        let err = body.collect().await.unwrap_err();
        assert!(err.to_string().contains("idle"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_body_fails_when_client_stalls() {
        let stalled = futures::stream::pending::<Result<Frame<Bytes>, BoxError>>();
        let progress = Arc::new(Mutex::new(UploadProgress::new()));
        let body = UploadBody::new(
            StreamBody::new(stalled).boxed(),
            Arc::clone(&progress),
            Duration::from_secs(30),
        );

        let err = body.collect().await.unwrap_err();
        assert!(err.is::<ClientBodyError>());
        // A stalled client never counts against the worker
        assert!(!progress.lock().is_idle(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_progress_tracks_frames() {
        let timeout = Duration::from_secs(30);
        let progress = Arc::new(Mutex::new(UploadProgress::new()));
        let chunks = futures::stream::iter(vec![
            Ok::<_, BoxError>(Frame::data(Bytes::from("a"))),
            Ok(Frame::data(Bytes::from("b"))),
        ]);
        let mut body = UploadBody::new(StreamBody::new(chunks).boxed(), Arc::clone(&progress), timeout);

        tokio::time::advance(Duration::from_secs(20)).await;
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("a"));

        // Activity moved the deadline forward
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!progress.lock().is_idle(timeout));

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(progress.lock().is_idle(timeout));
    }

    #[tokio::test]
    async fn test_slow_active_upload_is_not_timed_out() {
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let body = req.into_body().collect().await?.to_bytes();
                Ok::<_, hyper::Error>(Response::new(Full::new(body)))
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let client = UpstreamClient::new(UpstreamConfig {
            idle_timeout: Duration::from_millis(300),
            ..UpstreamConfig::default()
        });

        // Eight chunks 100ms apart: longer than the idle timeout in total,
        // never silent for that long
        let chunks = futures::stream::unfold(0u8, |i| async move {
            if i == 8 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some((Ok::<_, BoxError>(Frame::data(Bytes::from("x"))), i + 1))
        });
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(StreamBody::new(chunks).boxed())
            .unwrap();

        let response = client.send(req, addr).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        let echoed = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(echoed, Bytes::from("xxxxxxxx"));
        server.abort();
    }

    #[tokio::test]
    async fn test_worker_silent_after_upload_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = UpstreamClient::new(UpstreamConfig {
            idle_timeout: Duration::from_millis(200),
            ..UpstreamConfig::default()
        });
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(full_body("payload"))
            .unwrap();

        let err = client.send(req, addr).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout(_)));
        assert!(err.is_upstream_fault());
        hold.abort();
    }
}
