//! Transparent proxy with per-protocol dispatch
//!
//! Intercepted connections are peeked for a bounded initial window, offered
//! to each registered handler in registration order, and handed to the first
//! one that claims the protocol. Unclaimed connections are piped blind.
//! The operating mode (RECORD vs MOCK) is global to the current run.

pub mod grpc;
pub mod hpack;
pub mod http;
pub mod mongo;

pub use grpc::GrpcHandler;
pub use http::HttpHandler;
pub use mongo::MongoHandler;

use crate::error::{Result, RetraceError};
use crate::mocks::MockRegistry;
use crate::models::{Mock, OutgoingOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bytes peeked before dispatch
const PEEK_WINDOW: usize = 1024;
/// How long to wait for the initial bytes
const PEEK_TIMEOUT: Duration = Duration::from_millis(500);
/// Settle time between two peeks of a still-growing first message
const PEEK_SETTLE: Duration = Duration::from_millis(20);

/// Proxy operating mode, global to the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    #[default]
    Record,
    Mock,
}

/// One wire protocol's recording and mocking behavior
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the initial bytes of a connection belong to this protocol
    fn match_type(&self, prefix: &[u8]) -> bool;

    /// Pipe `client` and `upstream` in both directions, emitting one mock
    /// per completed protocol-level request/response unit.
    async fn record_outgoing(
        &self,
        cancel: &CancellationToken,
        client: TcpStream,
        upstream: TcpStream,
        mocks: mpsc::Sender<Mock>,
        opts: &OutgoingOptions,
    ) -> Result<()>;

    /// Serve `client` from recorded mocks; `upstream_addr` is only used when
    /// the options permit falling through to the real dependency.
    async fn mock_outgoing(
        &self,
        cancel: &CancellationToken,
        client: TcpStream,
        upstream_addr: Option<SocketAddr>,
        mocks: Arc<MockRegistry>,
        opts: &OutgoingOptions,
    ) -> Result<()>;
}

/// Accepts intercepted connections and multiplexes them over the registered
/// protocol handlers.
pub struct Proxy {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
    mode: Mutex<ProxyMode>,
    registry: Arc<MockRegistry>,
    record_sink: Mutex<Option<mpsc::Sender<Mock>>>,
    error_sink: Mutex<Option<mpsc::Sender<RetraceError>>>,
    upstream: Mutex<Option<SocketAddr>>,
    opts: Mutex<OutgoingOptions>,
    /// Live connections, for shutdown diagnostics
    live: DashMap<Uuid, SocketAddr>,
}

impl Proxy {
    /// Proxy with the default handler set. gRPC registers before HTTP
    /// because the HTTP/2 preface also parses as a request line.
    pub fn new() -> Self {
        Self::with_handlers(vec![
            Arc::new(GrpcHandler::new()),
            Arc::new(MongoHandler::new()),
            Arc::new(HttpHandler::new()),
        ])
    }

    pub fn with_handlers(handlers: Vec<Arc<dyn ProtocolHandler>>) -> Self {
        Self {
            handlers,
            mode: Mutex::new(ProxyMode::Record),
            registry: Arc::new(MockRegistry::new()),
            record_sink: Mutex::new(None),
            error_sink: Mutex::new(None),
            upstream: Mutex::new(None),
            opts: Mutex::new(OutgoingOptions::default()),
            live: DashMap::new(),
        }
    }

    pub fn set_mode(&self, mode: ProxyMode) {
        *self.mode.lock() = mode;
    }

    pub fn mode(&self) -> ProxyMode {
        *self.mode.lock()
    }

    /// Install the mock pools MOCK-mode handlers match against
    pub fn set_mocks(&self, filtered: Vec<Mock>, unfiltered: Vec<Mock>) {
        self.registry.set(filtered, unfiltered);
    }

    pub fn registry(&self) -> Arc<MockRegistry> {
        self.registry.clone()
    }

    /// Where RECORD-mode handlers send finished mocks
    pub fn set_record_sink(&self, sink: mpsc::Sender<Mock>) {
        *self.record_sink.lock() = Some(sink);
    }

    /// Switch to MOCK mode and return the channel surfacing handler errors
    /// (mock misses, protocol faults) to the orchestrator.
    pub fn start_mocking(&self) -> mpsc::Receiver<RetraceError> {
        let (tx, rx) = mpsc::channel(16);
        *self.error_sink.lock() = Some(tx);
        self.set_mode(ProxyMode::Mock);
        rx
    }

    /// Original destination of intercepted traffic, delivered by the
    /// interception collaborator during hook setup.
    pub fn set_upstream(&self, addr: Option<SocketAddr>) {
        *self.upstream.lock() = addr;
    }

    pub fn set_opts(&self, opts: OutgoingOptions) {
        *self.opts.lock() = opts;
    }

    /// Accept loop; one task per connection. A failing connection is logged
    /// and dropped without disturbing the others.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(addr = ?listener.local_addr().ok(), "proxy listening");
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!(live = self.live.len(), "proxy accept loop cancelled");
                    return;
                }
            };

            let proxy = self.clone();
            let conn_cancel = cancel.child_token();
            tokio::spawn(async move {
                let conn_ref = Uuid::new_v4();
                proxy.live.insert(conn_ref, peer);
                if let Err(e) = proxy.handle_connection(stream, &conn_cancel).await {
                    warn!(%peer, conn = %conn_ref, "connection ended with error: {}", e);
                    proxy.report_error(e);
                }
                proxy.live.remove(&conn_ref);
            });
        }
    }

    /// Peek, dispatch and run one connection to completion
    pub async fn handle_connection(
        &self,
        client: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let prefix = peek_initial(&client, PEEK_WINDOW, PEEK_TIMEOUT).await?;
        let mode = self.mode();
        let upstream_addr = *self.upstream.lock();
        let opts = self.opts.lock().clone();

        // Pass-through ports bypass matching entirely
        if let Some(addr) = upstream_addr {
            if opts.pass_through_ports.contains(&addr.port()) {
                debug!(%addr, "port is pass-through, tunnelling");
                return self.tunnel(client, upstream_addr, cancel).await;
            }
        }

        let handler = self.handlers.iter().find(|h| h.match_type(&prefix));
        match handler {
            Some(handler) => {
                debug!(handler = handler.name(), ?mode, "dispatching connection");
                match mode {
                    ProxyMode::Record => {
                        let addr = upstream_addr.ok_or_else(|| {
                            RetraceError::Protocol(
                                "no upstream destination for recorded connection".to_string(),
                            )
                        })?;
                        let upstream = TcpStream::connect(addr).await?;
                        let sink = self.record_sink.lock().clone().ok_or_else(|| {
                            RetraceError::Internal("record sink not installed".to_string())
                        })?;
                        handler
                            .record_outgoing(cancel, client, upstream, sink, &opts)
                            .await
                    }
                    ProxyMode::Mock => {
                        handler
                            .mock_outgoing(
                                cancel,
                                client,
                                upstream_addr,
                                self.registry.clone(),
                                &opts,
                            )
                            .await
                    }
                }
            }
            None => {
                debug!("no handler matched, raw tunnel");
                match mode {
                    ProxyMode::Record => self.tunnel(client, upstream_addr, cancel).await,
                    ProxyMode::Mock if opts.fallback_passthrough => {
                        self.tunnel(client, upstream_addr, cancel).await
                    }
                    ProxyMode::Mock => Err(RetraceError::MockMiss(
                        "unmatched protocol with passthrough disabled".to_string(),
                    )),
                }
            }
        }
    }

    /// Pipe bytes blind in both directions until either side closes
    async fn tunnel(
        &self,
        mut client: TcpStream,
        upstream_addr: Option<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let addr = upstream_addr.ok_or_else(|| {
            RetraceError::Protocol("no destination to tunnel to".to_string())
        })?;
        let mut upstream = TcpStream::connect(addr).await?;
        tokio::select! {
            res = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                res?;
                Ok(())
            }
            _ = cancel.cancelled() => Ok(()),
        }
    }

    fn report_error(&self, err: RetraceError) {
        if let Some(sink) = self.error_sink.lock().clone() {
            if let Err(e) = sink.try_send(err) {
                error!("failed to surface handler error: {}", e);
            }
        }
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Peek up to `max` initial bytes, allowing a short settle window so a
/// multi-segment first message can land before dispatch.
async fn peek_initial(stream: &TcpStream, max: usize, window: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let mut n = tokio::time::timeout(window, stream.peek(&mut buf))
        .await
        .map_err(|_| RetraceError::Protocol("timed out waiting for initial bytes".to_string()))??;
    if n == 0 {
        return Err(RetraceError::Protocol(
            "connection closed before any bytes".to_string(),
        ));
    }
    let deadline = tokio::time::Instant::now() + window;
    while n < max && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(PEEK_SETTLE).await;
        let again = stream.peek(&mut buf).await?;
        if again == n {
            break;
        }
        n = again;
    }
    buf.truncate(n);
    Ok(buf)
}

/// Read one delimited message, carrying over any bytes read past its end.
/// Returns `None` on a clean EOF before the first byte of a message.
pub(crate) async fn read_message<R, F>(
    reader: &mut R,
    carry: &mut Vec<u8>,
    complete: F,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> crate::capture::http1::ParseState,
{
    use crate::capture::http1::ParseState;

    let mut buf = std::mem::take(carry);
    loop {
        if !buf.is_empty() {
            match complete(&buf) {
                ParseState::Complete(len) => {
                    let rest = buf.split_off(len);
                    *carry = rest;
                    return Ok(Some(buf));
                }
                ParseState::Invalid => {
                    return Err(RetraceError::Protocol(
                        "unparseable message on proxied connection".to_string(),
                    ));
                }
                ParseState::Partial => {}
            }
        }

        let mut chunk = [0u8; 8192];
        let n = tokio::select! {
            read = reader.read(&mut chunk) => read?,
            _ = cancel.cancelled() => {
                return Err(RetraceError::Shutdown("read cancelled".to_string()));
            }
        };
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RetraceError::Protocol(
                "connection closed mid-message".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
