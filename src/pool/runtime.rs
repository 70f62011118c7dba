//! Worker process main loop.
//!
//! This runs when the binary is invoked as `prefork worker`. It connects to
//! the master's control socket, registers its slot, bootstraps the bridge on
//! request and then serves HTTP on its private socket until told to stop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use chrono::{DateTime, Local, TimeZone};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::bridge::{self, BootstrapContext, Bridge, BridgeError};
use super::forwarder;
use super::ipc::{FrameReader, Outbox, Outgoing, write_loop};
use super::master::relay_log;
use super::protocol::{ControlMessage, LogLevel, Slot};
use crate::config::LogTransport;
use crate::error::{PoolError, Result};
use crate::paths::SocketPaths;

const CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Request bodies above this are refused with 413.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How long in-flight requests get to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a new connection may take to send its PROXY line.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup parameters handed down by the master on the command line.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub slot: Slot,
    pub socket_dir: PathBuf,
    pub host: String,
    pub bridge: String,
    pub static_directory: Option<PathBuf>,
    pub debug: bool,
    pub logging: bool,
    pub log_transport: LogTransport,
}

/// Per-process state shared by the control loop and the request handler.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    slot: Slot,
    outbox: Outbox,
    transport: LogTransport,
    logging: bool,
    /// Relay lines that could not be sent, flushed to stderr on shutdown.
    diagnostics: Mutex<Vec<String>>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl WorkerContext {
    pub fn new(slot: Slot, outbox: Outbox, transport: LogTransport, logging: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                slot,
                outbox,
                transport,
                logging,
                diagnostics: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn slot(&self) -> Slot {
        self.inner.slot
    }

    /// Report a line to the operator, through the master or directly.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match self.inner.transport {
            LogTransport::Relay => {
                let line = ControlMessage::log(level, message.clone());
                if self.inner.outbox.send(Outgoing::Message(line)).is_err()
                    && let Ok(mut buffer) = self.inner.diagnostics.lock()
                {
                    buffer.push(message);
                }
            }
            LogTransport::Direct => relay_log(Some(self.inner.slot), level, &message, None),
        }
    }

    /// Log one access line, unless request logging is off.
    pub fn access(&self, line: String) {
        if self.inner.logging {
            self.log(LogLevel::Info, line);
        }
    }

    /// Begin shutdown. Only the first call does anything; it returns `true`.
    pub fn shutdown(&self, reason: &str) -> bool {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(slot = self.inner.slot, reason, "Worker shutting down");
        self.flush_diagnostics();
        self.inner.shutdown.send_replace(true);
        true
    }

    /// Resolves once shutdown has begun.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }

    fn flush_diagnostics(&self) {
        let lines = match self.inner.diagnostics.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => return,
        };
        for line in lines {
            eprintln!("{}", line);
        }
    }

    fn send(&self, message: ControlMessage) -> Result<()> {
        self.inner
            .outbox
            .send(Outgoing::Message(message))
            .map_err(|_| PoolError::Protocol("control channel closed".to_string()))
    }

    fn close(&self) {
        let _ = self.inner.outbox.send(Outgoing::Close);
    }
}

/// Client address announced by the master for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClientAddr(Option<SocketAddr>);

/// The worker socket. Every accepted connection has its PROXY line read off
/// before HTTP parsing starts; connections without one are dropped.
struct ForwardedListener {
    inner: UnixListener,
}

impl axum::serve::Listener for ForwardedListener {
    type Io = BufReader<UnixStream>;
    type Addr = ClientAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let stream = match self.inner.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Worker accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let mut stream = BufReader::new(stream);
            match tokio::time::timeout(PREAMBLE_TIMEOUT, forwarder::read_preamble(&mut stream)).await {
                Ok(Ok(client)) => return (stream, ClientAddr(client)),
                Ok(Err(e)) => tracing::warn!(error = %e, "Dropping connection"),
                Err(_) => tracing::warn!("Dropping connection that sent no PROXY line"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(ClientAddr(None))
    }
}

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, ForwardedListener>>
    for ClientAddr
{
    fn connect_info(stream: axum::serve::IncomingStream<'_, ForwardedListener>) -> Self {
        *stream.remote_addr()
    }
}

/// Handler state: the context plus the bootstrapped bridge.
#[derive(Clone)]
struct HttpState {
    ctx: WorkerContext,
    bridge: Arc<dyn Bridge>,
}

/// Request line and headers kept for the access log.
struct RequestSummary {
    remote: String,
    request_line: String,
    referer: String,
    user_agent: String,
}

impl RequestSummary {
    /// `client` comes from the connection; without it the first
    /// `X-Forwarded-For` entry is used.
    fn new(request: &Request, client: Option<SocketAddr>) -> Self {
        let headers = request.headers();
        let path = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        Self {
            remote: client
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| header_or_dash(headers, "x-forwarded-for")),
            request_line: format!("{} {} {:?}", request.method(), path, request.version()),
            referer: header_or_dash(headers, header::REFERER.as_str()),
            user_agent: header_or_dash(headers, header::USER_AGENT.as_str()),
        }
    }
}

fn header_or_dash(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "-".to_string())
}

/// Format an access log line in the common log style, with user agent.
fn access_line<Tz>(at: &DateTime<Tz>, summary: &RequestSummary, status: StatusCode, bytes: usize) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "[{}] {} - - \"{}\" {} {} \"{}\" \"{}\"",
        at.format("%d/%b/%Y:%H:%M:%S %z"),
        summary.remote,
        summary.request_line,
        status.as_u16(),
        bytes,
        summary.referer,
        summary.user_agent,
    )
}

fn plain(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

async fn dispatch(
    State(state): State<HttpState>,
    ConnectInfo(client): ConnectInfo<ClientAddr>,
    request: Request,
) -> Response<Body> {
    let summary = RequestSummary::new(&request, client.0);
    let (parts, body) = request.into_parts();

    let mut fatal = false;
    let mut response = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Err(e) => {
            state
                .ctx
                .log(LogLevel::Warning, format!("Could not read request body: {}", e));
            plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n")
        }
        Ok(bytes) => {
            let request = axum::http::Request::from_parts(parts, bytes);
            let bridge = Arc::clone(&state.bridge);
            match tokio::task::spawn_blocking(move || bridge.handle(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    fatal = matches!(e, BridgeError::OutputFlushed(_));
                    state.ctx.log(LogLevel::Error, e.to_string());
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
                }
                Err(e) => {
                    state
                        .ctx
                        .log(LogLevel::Critical, format!("Request handler panicked: {}", e));
                    plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
                }
            }
        }
    };

    // One exchange per forwarded connection.
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    let bytes = response.body().len();
    state
        .ctx
        .access(access_line(&Local::now(), &summary, response.status(), bytes));

    if fatal {
        state.ctx.shutdown("application flushed output outside the response");
    }
    response.map(Body::from)
}

fn router(state: HttpState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn connect_controller(paths: &SocketPaths) -> Result<UnixStream> {
    let path = paths.controller();
    let mut attempt = 1;
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => return Ok(stream),
            Err(source) if attempt >= CONNECT_ATTEMPTS => {
                return Err(PoolError::MasterUnreachable { path, source });
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Controller not reachable yet, retrying");
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

/// Bootstrap the bridge and start serving on `listener`.
fn bootstrap(
    ctx: &WorkerContext,
    mut bridge: Box<dyn Bridge>,
    listener: UnixListener,
    debug: bool,
) -> Result<JoinHandle<io::Result<()>>> {
    let context = BootstrapContext {
        slot: ctx.slot(),
        debug,
    };
    bridge.bootstrap(&context).map_err(|source| PoolError::Bootstrap {
        slot: ctx.slot(),
        source,
    })?;

    let app = router(HttpState {
        ctx: ctx.clone(),
        bridge: Arc::from(bridge),
    });
    let stopped = ctx.stopped();
    Ok(tokio::spawn(async move {
        let listener = ForwardedListener { inner: listener };
        axum::serve(listener, app.into_make_service_with_connect_info::<ClientAddr>())
            .with_graceful_shutdown(stopped)
            .await
    }))
}

/// Run a worker until the master goes away or asks it to stop.
pub async fn run(options: WorkerOptions) -> Result<()> {
    let slot = options.slot;
    let paths = SocketPaths::new(&options.socket_dir);
    let mut pending_bridge = Some(bridge::resolve(
        &options.bridge,
        options.static_directory.as_deref(),
    )?);

    let control = connect_controller(&paths).await?;

    let socket = paths.worker(slot);
    paths.remove_stale(&socket)?;
    let listener = UnixListener::bind(&socket).map_err(|source| PoolError::Bind {
        what: "worker socket",
        addr: socket.display().to_string(),
        source,
    })?;
    let mut pending_listener = Some(listener);

    let (read_half, write_half) = control.into_split();
    let (outbox, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, rx));
    let ctx = WorkerContext::new(slot, outbox, options.log_transport, options.logging);

    ctx.send(ControlMessage::Register {
        pid: std::process::id(),
        slot,
    })?;
    tracing::debug!(slot, host = %options.host, "Registered with master");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut reader = FrameReader::new(read_half);
    let mut server: Option<JoinHandle<io::Result<()>>> = None;
    let stopped = ctx.stopped();
    tokio::pin!(stopped);

    let outcome = loop {
        tokio::select! {
            message = reader.next_message() => match message {
                Ok(Some(ControlMessage::Bootstrap)) => {
                    let (Some(bridge), Some(listener)) =
                        (pending_bridge.take(), pending_listener.take())
                    else {
                        tracing::warn!(slot, "Ignoring repeated bootstrap");
                        continue;
                    };
                    match bootstrap(&ctx, bridge, listener, options.debug) {
                        Ok(handle) => {
                            server = Some(handle);
                            ctx.send(ControlMessage::Ready)?;
                            tracing::debug!(slot, "Bootstrapped, accepting connections");
                        }
                        Err(e) => {
                            ctx.log(LogLevel::Emergency, e.to_string());
                            break Err(e);
                        }
                    }
                }
                Ok(Some(other)) => {
                    tracing::warn!(slot, cmd = other.command(), "Ignoring unexpected command");
                }
                Ok(None) => {
                    ctx.shutdown("control channel closed");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "Control channel failed");
                    ctx.shutdown("control channel failed");
                    break Ok(());
                }
            },
            _ = sigterm.recv() => {
                ctx.shutdown("SIGTERM");
                break Ok(());
            }
            _ = sigint.recv() => {
                ctx.shutdown("SIGINT");
                break Ok(());
            }
            _ = &mut stopped => break Ok(()),
        }
    };

    ctx.shutdown("worker loop finished");
    if let Some(handle) = server {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(Err(e))) => tracing::warn!(slot, error = %e, "HTTP server failed"),
            Ok(_) => {}
            Err(_) => tracing::warn!(slot, "In-flight requests did not drain in time"),
        }
    }
    drop(pending_listener);
    if let Err(e) = paths.remove_stale(&socket) {
        tracing::debug!(slot, error = %e, "Could not remove worker socket");
    }

    ctx.close();
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, writer).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::pool::ipc::write_message;

    fn stopping(ctx: &WorkerContext) -> bool {
        ctx.inner.stopping.load(Ordering::SeqCst)
    }

    fn connected() -> ConnectInfo<ClientAddr> {
        ConnectInfo(ClientAddr(Some("203.0.113.9:40100".parse().unwrap())))
    }

    fn context(transport: LogTransport) -> (WorkerContext, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerContext::new(2, tx, transport, true), rx)
    }

    fn summary() -> RequestSummary {
        RequestSummary {
            remote: "10.0.0.7".to_string(),
            request_line: "GET /hello?x=1 HTTP/1.1".to_string(),
            referer: "-".to_string(),
            user_agent: "curl/8.5".to_string(),
        }
    }

    struct Panicking;

    impl Bridge for Panicking {
        fn bootstrap(&mut self, _ctx: &BootstrapContext) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        fn handle(&self, _request: axum::http::Request<Bytes>) -> std::result::Result<Response<Bytes>, BridgeError> {
            panic!("application bug");
        }
    }

    struct Flushing;

    impl Bridge for Flushing {
        fn bootstrap(&mut self, _ctx: &BootstrapContext) -> std::result::Result<(), BridgeError> {
            Ok(())
        }

        fn handle(&self, _request: axum::http::Request<Bytes>) -> std::result::Result<Response<Bytes>, BridgeError> {
            Err(BridgeError::OutputFlushed("echo called".to_string()))
        }
    }

    fn get(path: &str) -> Request {
        axum::http::Request::builder()
            .uri(path)
            .header("x-forwarded-for", "192.168.1.4, 10.0.0.1")
            .header("user-agent", "test-agent")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_access_line_format() {
        let at = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .unwrap();
        let line = access_line(&at, &summary(), StatusCode::OK, 512);
        assert_eq!(
            line,
            "[09/Mar/2024:14:05:07 +0200] 10.0.0.7 - - \"GET /hello?x=1 HTTP/1.1\" 200 512 \"-\" \"curl/8.5\""
        );
    }

    #[test]
    fn test_request_summary_headers() {
        let request = get("/a/b?q=2");
        let summary = RequestSummary::new(&request, None);
        assert_eq!(summary.remote, "192.168.1.4");
        assert_eq!(summary.request_line, "GET /a/b?q=2 HTTP/1.1");
        assert_eq!(summary.referer, "-");
        assert_eq!(summary.user_agent, "test-agent");
    }

    #[test]
    fn test_request_summary_prefers_connection_address() {
        let request = get("/");
        let client = "198.51.100.20:6000".parse().ok();
        assert_eq!(RequestSummary::new(&request, client).remote, "198.51.100.20");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (ctx, _rx) = context(LogTransport::Relay);
        let stopped = ctx.stopped();
        assert!(!stopping(&ctx));
        assert!(ctx.shutdown("first"));
        assert!(!ctx.shutdown("second"));
        assert!(stopping(&ctx));
        tokio::time::timeout(Duration::from_secs(1), stopped)
            .await
            .unwrap();
    }

    #[test]
    fn test_relay_log_goes_to_outbox() {
        let (ctx, mut rx) = context(LogTransport::Relay);
        ctx.log(LogLevel::Warning, "disk almost full");
        match rx.try_recv().unwrap() {
            Outgoing::Message(ControlMessage::Log { level, message, .. }) => {
                assert_eq!(level, Some(LogLevel::Warning));
                assert_eq!(message, "disk almost full");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_undeliverable_logs_are_buffered() {
        let (ctx, rx) = context(LogTransport::Relay);
        drop(rx);
        ctx.log(LogLevel::Error, "lost master");
        assert_eq!(ctx.inner.diagnostics.lock().unwrap().len(), 1);
        ctx.shutdown("test");
        assert!(ctx.inner.diagnostics.lock().unwrap().is_empty());
    }

    #[test]
    fn test_access_respects_logging_flag() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext::new(1, tx, LogTransport::Relay, false);
        ctx.access("GET /".to_string());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let (ctx, mut rx) = context(LogTransport::Relay);
        let mut echo = bridge::resolve("echo", None).unwrap();
        echo.bootstrap(&BootstrapContext { slot: 2, debug: false })
            .unwrap();
        let state = HttpState {
            ctx,
            bridge: Arc::from(echo),
        };

        let response = dispatch(State(state), connected(), get("/ping")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("GET /ping"));

        match rx.try_recv().unwrap() {
            Outgoing::Message(ControlMessage::Log { message, .. }) => {
                assert!(message.contains("\"GET /ping HTTP/1.1\" 200"));
                assert!(message.contains("] 203.0.113.9 - - "));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_panic_is_500() {
        let (ctx, _rx) = context(LogTransport::Relay);
        let state = HttpState {
            ctx: ctx.clone(),
            bridge: Arc::new(Panicking),
        };
        let response = dispatch(State(state), connected(), get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!stopping(&ctx));
    }

    #[tokio::test]
    async fn test_flushed_output_stops_worker() {
        let (ctx, _rx) = context(LogTransport::Direct);
        let state = HttpState {
            ctx: ctx.clone(),
            bridge: Arc::new(Flushing),
        };
        let response = dispatch(State(state), connected(), get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(stopping(&ctx));
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SocketPaths::new(dir.path());
        let controller = UnixListener::bind(paths.controller()).unwrap();

        let options = WorkerOptions {
            slot: 4,
            socket_dir: dir.path().to_path_buf(),
            host: "127.0.0.1".to_string(),
            bridge: "echo".to_string(),
            static_directory: None,
            debug: false,
            logging: true,
            log_transport: LogTransport::Relay,
        };
        let worker = tokio::spawn(run(options));

        let (stream, _) = controller.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        match reader.next_message().await.unwrap().unwrap() {
            ControlMessage::Register { pid, slot } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(slot, 4);
            }
            other => panic!("expected register, got {:?}", other),
        }

        write_message(&mut write_half, &ControlMessage::Bootstrap)
            .await
            .unwrap();
        loop {
            match reader.next_message().await.unwrap().unwrap() {
                ControlMessage::Ready => break,
                ControlMessage::Log { .. } => continue,
                other => panic!("expected ready, got {:?}", other),
            }
        }

        // Without a PROXY line the connection is dropped unanswered.
        let mut bare = UnixStream::connect(paths.worker(4)).await.unwrap();
        bare.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        let _ = bare.read_to_string(&mut raw).await;
        assert!(raw.is_empty());

        let peer = "203.0.113.9:40100".parse().ok();
        let local = "127.0.0.1:5500".parse().ok();
        let mut http = UnixStream::connect(paths.worker(4)).await.unwrap();
        http.write_all(crate::pool::forwarder::preamble(peer, local).as_bytes())
            .await
            .unwrap();
        http.write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        http.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.contains("worker: 4"));

        let access = loop {
            match reader.next_message().await.unwrap().unwrap() {
                ControlMessage::Log { message, .. } if message.contains("GET /status") => break message,
                ControlMessage::Log { .. } => continue,
                other => panic!("expected access line, got {:?}", other),
            }
        };
        assert!(access.contains("] 203.0.113.9 - - \"GET /status HTTP/1.1\" 200"));

        // Closing the control channel stops the worker.
        drop(write_half);
        drop(reader);
        let outcome = tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
        assert!(!paths.worker(4).exists());
    }
}
