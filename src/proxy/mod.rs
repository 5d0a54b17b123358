//! Interception listener, duplex relay and DNS responder.

mod dns;
mod server;
mod tls;
mod tunnel;

pub use dns::{
    DEFAULT_UPSTREAM_TIMEOUT, DnsError, DnsServer, DnsSettings, OVERRIDE_TTL, OverrideTable, fqdn,
};
pub use server::{ConnectionError, ProxyServer, ProxyState, ServerError, handle_connection};
pub use tls::{AcceptError, TlsAcceptor};
pub use tunnel::{
    Direction, Observed, RelayReport, TracingObserver, TrafficObserver, Tunnel, TunnelError, relay,
};
