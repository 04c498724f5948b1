use crate::error::{json_error_response, ClientBodyError, ProxyErrorCode, UpstreamError};
use crate::registry::{WorkerTarget, WorkerRegistry};
use crate::routing::SubmissionRoute;
use crate::upstream::{full_body, BoxError, ProxyBody, UpstreamClient};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Bodies up to this size are buffered so a failed request can be retried
pub const DEFAULT_MAX_REPLAY_BODY_BYTES: u64 = 1024 * 1024;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a request handler needs
struct ProxyState {
    registry: Arc<WorkerRegistry>,
    client: Arc<UpstreamClient>,
    submission: SubmissionRoute,
    max_replay_body_bytes: u64,
}

/// The TLS front door
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<WorkerRegistry>,
        client: Arc<UpstreamClient>,
        submission: SubmissionRoute,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(ProxyState {
                registry,
                client,
                submission,
                max_replay_body_bytes: DEFAULT_MAX_REPLAY_BODY_BYTES,
            }),
            shutdown_rx,
            tls_acceptor: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_max_replay_body_bytes(mut self, limit: u64) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.max_replay_body_bytes = limit;
        }
        self
    }

    /// How long open connections may keep finishing requests after shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, then drain
    ///
    /// On shutdown the listener is closed, every open connection is told to
    /// finish its in-flight requests and close, and connections still open
    /// after the drain timeout are dropped.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let conn_shutdown = self.shutdown_rx.clone();

                            connections.spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true, conn_shutdown).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false, conn_shutdown).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);

        let open = connections.len();
        if open > 0 {
            info!(
                connections = open,
                drain_timeout_secs = self.drain_timeout.as_secs(),
                "Draining open connections"
            );
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    connections = connections.len(),
                    "Drain timeout exceeded, closing remaining connections"
                );
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, state, is_tls).await) }
    });

    // The protocol is detected from the connection preface
    let builder = {
        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        builder.http2().max_concurrent_streams(250);
        builder
    };
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let shutting_down = async {
        loop {
            if *shutdown_rx.borrow_and_update() {
                return;
            }
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = conn.as_mut() => {
            return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
        }
        _ = shutting_down => {
            debug!(addr = %addr, "Closing connection after in-flight requests");
            conn.as_mut().graceful_shutdown();
        }
    }

    conn.await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    is_tls: bool,
) -> Response<ProxyBody> {
    let request_id = Uuid::new_v4();

    let uri = req.uri().clone();
    apply_forwarded_headers(req.headers_mut(), &uri, is_tls);

    debug!(%request_id, method = %req.method(), uri = %uri, version = ?req.version(), "Incoming request");

    if let Some(addr) = state.submission.route(uri.path()) {
        let req = req.map(client_body);
        return match state.client.send(req, addr).await {
            Ok(response) => {
                debug!(%request_id, target = %addr, status = %response.status(), "Submission forwarded");
                response
            }
            Err(e) => {
                // No retry: there is only one submission service
                error!(%request_id, target = %addr, error = %e, "Submission forwarding failed");
                upstream_error_response(&e)
            }
        };
    }

    let Some(first) = state.registry.select_worker() else {
        warn!(%request_id, "No healthy worker available");
        return json_error_response(
            ProxyErrorCode::NoHealthyWorker,
            "No healthy worker available, please retry later",
        );
    };

    let (parts, body) = req.into_parts();
    let mut body = match ReplayableBody::prepare(body, state.max_replay_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            debug!(%request_id, error = %e, "Failed to read request body");
            return upstream_error_response(&e);
        }
    };

    let mut target = first;
    let mut retried = false;

    loop {
        let result = match body.take() {
            Ok(attempt_body) => {
                let mut attempt = Request::new(attempt_body);
                *attempt.method_mut() = parts.method.clone();
                *attempt.uri_mut() = parts.uri.clone();
                *attempt.headers_mut() = parts.headers.clone();
                state.client.send(attempt, worker_addr(&target)).await
            }
            Err(e) => Err(e),
        };

        let e = match result {
            Ok(response) => {
                debug!(
                    %request_id,
                    worker_id = %target.id,
                    port = target.port,
                    status = %response.status(),
                    retried,
                    "Request forwarded"
                );
                return response;
            }
            Err(e) => e,
        };

        warn!(%request_id, worker_id = %target.id, port = target.port, error = %e, "Forwarding to worker failed");

        if e.is_upstream_fault() {
            state.registry.report_failure(&target);
        }

        if retried || !e.is_upstream_fault() || !body.is_replayable() {
            return upstream_error_response(&e);
        }

        match state.registry.select_worker() {
            Some(next) if next.id != target.id => {
                info!(%request_id, from = %target.id, to = %next.id, "Retrying on another worker");
                target = next;
                retried = true;
            }
            _ => {
                debug!(%request_id, "No other healthy worker to retry on");
                return upstream_error_response(&e);
            }
        }
    }
}

fn worker_addr(target: &WorkerTarget) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], target.port))
}

/// Client-facing response for a failed forwarding attempt; details stay in logs
fn upstream_error_response(e: &UpstreamError) -> Response<ProxyBody> {
    let code = e.code();
    let message = match code {
        ProxyErrorCode::BadRequest => "Request body could not be read",
        ProxyErrorCode::UpstreamTimeout => "Upstream did not respond in time",
        ProxyErrorCode::InternalError => "Internal proxy error",
        _ => "Failed to reach upstream",
    };
    json_error_response(code, message)
}

/// Set `x-forwarded-host` and `x-forwarded-proto`, overwriting client values
///
/// HTTP/2 requests carry the host in the `:authority` pseudo-header, which
/// is also copied into `Host` for the HTTP/1.1 upstream.
pub fn apply_forwarded_headers(headers: &mut HeaderMap, uri: &Uri, is_tls: bool) {
    if !headers.contains_key(hyper::header::HOST) {
        if let Some(value) = uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        {
            headers.insert(hyper::header::HOST, value);
        }
    }

    match headers.get(hyper::header::HOST).cloned() {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Box a client's request body, tagging its errors as client-side
fn client_body<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(|e| Box::new(ClientBodyError::Read(e.into())) as BoxError)
        .boxed()
}

/// Request body that can be sent more than once if it was small enough
enum ReplayableBody<B> {
    Buffered(Bytes),
    Streaming(Option<B>),
}

impl<B> ReplayableBody<B>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    /// Buffer the body when its exact size is known and within `limit`
    async fn prepare(body: B, limit: u64) -> Result<Self, UpstreamError> {
        match body.size_hint().exact() {
            Some(len) if len <= limit => {
                let collected = body
                    .collect()
                    .await
                    .map_err(|e| UpstreamError::ClientBody(e.into()))?;
                Ok(ReplayableBody::Buffered(collected.to_bytes()))
            }
            _ => Ok(ReplayableBody::Streaming(Some(body))),
        }
    }

    fn take(&mut self) -> Result<ProxyBody, UpstreamError> {
        match self {
            ReplayableBody::Buffered(bytes) => Ok(full_body(bytes.clone())),
            ReplayableBody::Streaming(body) => {
                body.take().map(client_body).ok_or(UpstreamError::BodyConsumed)
            }
        }
    }

    fn is_replayable(&self) -> bool {
        matches!(self, ReplayableBody::Buffered(_))
    }
}
