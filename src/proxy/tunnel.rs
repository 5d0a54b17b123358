//! Upstream dialing and the bidirectional relay between client and upstream.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::tls::upstream_client_config;

/// Opens TLS connections to the real destination of an intercepted connection.
pub struct Tunnel {
    client_config: Arc<ClientConfig>,
    pinned_hosts: HashMap<String, IpAddr>,
}

impl Tunnel {
    /// Creates a tunnel whose upstream TLS sessions skip certificate verification.
    pub fn new() -> Result<Self, TunnelError> {
        Ok(Self {
            client_config: upstream_client_config().map_err(TunnelError::Config)?,
            pinned_hosts: HashMap::new(),
        })
    }

    /// Dials the listed hosts at fixed addresses instead of resolving them.
    pub fn with_pinned_hosts(mut self, hosts: HashMap<String, IpAddr>) -> Self {
        self.pinned_hosts = hosts;
        self
    }

    /// Connects to `host:port` and completes a TLS handshake announcing `host` as SNI.
    pub async fn connect_upstream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
        debug!("connecting to upstream {}:{}", host, port);

        let tcp_stream = match self.pinned_hosts.get(host) {
            Some(ip) => TcpStream::connect((*ip, port)).await,
            None => TcpStream::connect((host, port)).await,
        }
        .map_err(TunnelError::Connect)?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TunnelError::InvalidSni(host.to_string()))?;

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(TunnelError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", host);

        Ok(tls_stream)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to build upstream TLS config: {0}")]
    Config(#[source] rustls::Error),
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error("invalid SNI: {0}")]
    InvalidSni(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
}

/// Which way bytes travel through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    Downstream,
}

const RED: &str = "\x1b[31m";
const BLUE: &str = "\x1b[34m";
const RESET: &str = "\x1b[0m";

impl Direction {
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Upstream => "->",
            Direction::Downstream => "<-",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Direction::Upstream => RED,
            Direction::Downstream => BLUE,
        }
    }
}

/// Receives every nonempty chunk read by the relay, before it is forwarded.
pub trait TrafficObserver: Send + Sync {
    fn observe(&self, direction: Direction, chunk: &[u8]);
}

/// Logs relayed chunks as quoted, escaped text through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    color: bool,
}

impl TracingObserver {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    /// Formats one chunk as `<arrow> "<escaped bytes>"`, color-tagged when enabled.
    pub fn format(&self, direction: Direction, chunk: &[u8]) -> String {
        if self.color {
            format!(
                "{}{} \"{}\" {}",
                direction.color(),
                direction.arrow(),
                chunk.escape_ascii(),
                RESET
            )
        } else {
            format!("{} \"{}\"", direction.arrow(), chunk.escape_ascii())
        }
    }
}

impl TrafficObserver for TracingObserver {
    fn observe(&self, direction: Direction, chunk: &[u8]) {
        info!("{}", self.format(direction, chunk));
    }
}

/// Read-side decorator that reports each chunk to an observer.
///
/// Bytes are passed through untouched; nothing is buffered beyond the chunk
/// just read.
pub struct Observed<R> {
    inner: R,
    direction: Direction,
    observer: Option<Arc<dyn TrafficObserver>>,
    transferred: u64,
}

impl<R> Observed<R> {
    pub fn new(inner: R, direction: Direction, observer: Arc<dyn TrafficObserver>) -> Self {
        Self::with_observer(inner, direction, Some(observer))
    }

    fn with_observer(
        inner: R,
        direction: Direction,
        observer: Option<Arc<dyn TrafficObserver>>,
    ) -> Self {
        Self {
            inner,
            direction,
            observer,
            transferred: 0,
        }
    }

    /// Total bytes read through this decorator so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Observed<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let chunk = &buf.filled()[before..];
        this.transferred += chunk.len() as u64;
        if let Some(observer) = &this.observer
            && !chunk.is_empty()
        {
            observer.observe(this.direction, chunk);
        }
        Poll::Ready(Ok(()))
    }
}

/// Outcome of a finished relay, one result per direction.
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes read from the client side and passed to the upstream side.
    pub upstream: io::Result<u64>,
    /// Bytes read from the upstream side and passed to the client side.
    pub downstream: io::Result<u64>,
}

/// Copies bytes between `client` and `upstream` in both directions.
///
/// Each direction runs in its own task until its source reaches end-of-stream
/// or fails. The first direction to finish stops the other one, and each
/// direction then shuts down the side it was writing to, so a peer that keeps
/// its connection open without sending anything is still released. Returns
/// once both directions are finished.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    observer: Option<Arc<dyn TrafficObserver>>,
) -> RelayReport
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let stop = Arc::new(Notify::new());

    let to_upstream = tokio::spawn(one_way(
        client_read,
        upstream_write,
        Direction::Upstream,
        observer.clone(),
        Arc::clone(&stop),
    ));
    let to_client = tokio::spawn(one_way(
        upstream_read,
        client_write,
        Direction::Downstream,
        observer,
        stop,
    ));

    let (upstream, downstream) = tokio::join!(to_upstream, to_client);
    let report = RelayReport {
        upstream: upstream.unwrap_or_else(|e| Err(io::Error::other(e))),
        downstream: downstream.unwrap_or_else(|e| Err(io::Error::other(e))),
    };

    debug!(
        "relay closed: {:?} client->upstream, {:?} upstream->client",
        report.upstream, report.downstream
    );

    report
}

async fn one_way<R, W>(
    reader: R,
    mut writer: W,
    direction: Direction,
    observer: Option<Arc<dyn TrafficObserver>>,
    stop: Arc<Notify>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = Observed::with_observer(reader, direction, observer);

    let copied = tokio::select! {
        copied = tokio::io::copy(&mut reader, &mut writer) => copied.map(|_| ()),
        _ = stop.notified() => {
            debug!("relay {} stopped by the opposite direction", direction.arrow());
            Ok(())
        }
    };

    if let Err(e) = &copied {
        debug!("relay {} stopped: {}", direction.arrow(), e);
    }
    // Stores a permit when the opposite direction is not waiting yet.
    stop.notify_one();
    if let Err(e) = writer.shutdown().await {
        debug!("relay {} shutdown failed: {}", direction.arrow(), e);
    }

    copied.map(|()| reader.transferred())
}
