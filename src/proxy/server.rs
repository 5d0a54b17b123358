//! Interception listener: terminates client TLS and relays to the real server.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info};

use super::tls::{AcceptError, TlsAcceptor};
use super::tunnel::{Tunnel, TunnelError, TrafficObserver, relay};
use crate::ca::{CertCache, CertificateAuthority};

/// Shared state for the proxy server.
pub struct ProxyState {
    /// Certificate cache for dynamic certificate generation.
    cert_cache: Arc<CertCache>,
    /// Tunnel for upstream connections.
    tunnel: Tunnel,
    /// Receives relayed traffic when logging is enabled.
    observer: Option<Arc<dyn TrafficObserver>>,
}

impl ProxyState {
    /// Creates a new proxy state.
    pub fn new(ca: Arc<CertificateAuthority>) -> Result<Self, TunnelError> {
        Ok(Self {
            cert_cache: Arc::new(CertCache::new(ca)),
            tunnel: Tunnel::new()?,
            observer: None,
        })
    }

    /// Dials the listed upstream hosts at fixed addresses.
    pub fn with_upstream_hosts(mut self, hosts: HashMap<String, IpAddr>) -> Self {
        self.tunnel = self.tunnel.with_pinned_hosts(hosts);
        self
    }

    /// Reports every relayed chunk to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns a reference to the certificate cache.
    pub fn cert_cache(&self) -> &Arc<CertCache> {
        &self.cert_cache
    }
}

/// The interception listener.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Binds the listener. Fails if the address is unavailable.
    pub async fn bind(state: Arc<ProxyState>, addr: impl ToSocketAddrs) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!("proxy server listening on {}", local_addr);

        let tls_acceptor =
            TlsAcceptor::new(Arc::clone(&state.cert_cache)).map_err(ServerError::Tls)?;

        Ok(Self {
            state,
            listener,
            tls_acceptor,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Runs the proxy server, accepting connections forever.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already in
    /// flight keep running on their own tasks.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("proxy server shutting down");
                    return;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                        let delay = accept_retry_delay(&e);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        continue;
                    }
                },
            };
            debug!("accepted connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, state, tls_acceptor).await {
                    error!("connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Pause after an accept error that is not tied to a single connection,
/// such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn accept_retry_delay(error: &io::Error) -> Duration {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Handles a single intercepted connection.
///
/// The upstream is `<sni>:<local port>`, where the local port is the port the
/// client connected to on this listener.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ProxyState>,
    tls_acceptor: TlsAcceptor,
) -> Result<(), ConnectionError> {
    let local_port = stream
        .local_addr()
        .map_err(ConnectionError::LocalAddr)?
        .port();

    let (client_stream, hostname) = tls_acceptor.accept(stream).await?;

    let upstream_stream = state
        .tunnel
        .connect_upstream(&hostname, local_port)
        .await
        .map_err(|source| ConnectionError::Upstream {
            target: format!("{}:{}", hostname, local_port),
            source,
        })?;

    info!("connected {} and {}", peer_addr, hostname);

    relay(client_stream, upstream_stream, state.observer.clone()).await;

    debug!("connection from {} to {} closed", peer_addr, hostname);

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to build TLS config: {0}")]
    Tls(#[source] rustls::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] std::io::Error),
    #[error("handshake failed: {0}")]
    Accept(#[from] AcceptError),
    #[error("failed to establish upstream connection to {target}: {source}")]
    Upstream {
        target: String,
        #[source]
        source: TunnelError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that errors belonging to one aborted connection are retried at
    /// once while process-wide failures back off before the next accept.
    #[test]
    fn accept_errors_are_retried() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(accept_retry_delay(&io::Error::from(kind)), Duration::ZERO);
        }

        // EMFILE
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_retry_delay(&exhausted), ACCEPT_BACKOFF);
        assert_eq!(
            accept_retry_delay(&io::Error::other("listener failure")),
            ACCEPT_BACKOFF
        );
    }

    /// Tests that the accept loop returns once shutdown resolves and keeps
    /// serving until then.
    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let root = crate::RootAuthority::generate().unwrap();
        let ca = CertificateAuthority::new(&root).unwrap();
        let state = Arc::new(ProxyState::new(Arc::new(ca)).unwrap());
        let server = ProxyServer::bind(state, "127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.run_until(async move {
            let _ = stop_rx.await;
        }));

        // A client that connects and leaves at once does not stop the loop.
        drop(TcpStream::connect(addr).await.unwrap());
        tokio::task::yield_now().await;
        assert!(!serving.is_finished());

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
    }
}
