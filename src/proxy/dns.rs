//! DNS responder.
//!
//! Answers queries for overridden names with a fixed IPv4 address so that
//! clients reach the interception listener, and forwards every other query
//! verbatim to an upstream resolver. UDP and TCP share one handler.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Header, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Buffer size for DNS packets (EDNS0 supports up to 4096).
const DNS_BUF_SIZE: usize = 4096;

/// Largest reply an upstream resolver can send in one UDP datagram.
const MAX_UDP_MESSAGE: usize = 65535;

/// TTL of synthesized override answers, in seconds.
pub const OVERRIDE_TTL: u32 = 3600;

/// Default deadline for one upstream exchange.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_millis(2000);

/// Idle TCP connections are closed after this long without a query.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(8);

/// Returns `name` in dot-terminated form.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Static hostname to IPv4 mapping, matched by suffix in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    entries: Vec<(String, Ipv4Addr)>,
}

impl OverrideTable {
    /// Builds a table, normalizing every name to its dot-terminated form.
    pub fn new(entries: impl IntoIterator<Item = (String, Ipv4Addr)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, address)| (fqdn(&name), address))
                .collect(),
        }
    }

    /// Returns the address of the first entry that `qname` ends with.
    /// Matching is case-sensitive.
    pub fn lookup(&self, qname: &str) -> Option<Ipv4Addr> {
        self.entries
            .iter()
            .find(|(name, _)| qname.ends_with(name.as_str()))
            .map(|(_, address)| *address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the responder needs besides its listen address.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    /// Resolver that receives every query without an override.
    pub upstream: SocketAddr,
    /// Deadline for one upstream exchange.
    pub timeout: Duration,
    pub overrides: OverrideTable,
}

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to bind DNS {transport} socket on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse DNS query: {0}")]
    Parse(#[source] ProtoError),
    #[error("failed to encode DNS response: {0}")]
    Encode(#[source] ProtoError),
    #[error("upstream DNS exchange with {upstream} failed: {source}")]
    Upstream {
        upstream: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("upstream DNS server {0} did not answer in time")]
    Timeout(SocketAddr),
}

/// Handle to a running DNS responder.
pub struct DnsServer {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DnsServer {
    /// Binds UDP and TCP on `listen` and starts serving.
    ///
    /// When `listen` has port 0, TCP reuses the port assigned to UDP so both
    /// transports share one port number.
    pub async fn bind(listen: SocketAddr, settings: DnsSettings) -> Result<Self, DnsError> {
        let udp = UdpSocket::bind(listen)
            .await
            .map_err(bind_error("UDP", listen))?;
        let udp_addr = udp.local_addr().map_err(bind_error("UDP", listen))?;

        let tcp_listen = SocketAddr::new(listen.ip(), udp_addr.port());
        let tcp = TcpListener::bind(tcp_listen)
            .await
            .map_err(bind_error("TCP", tcp_listen))?;
        let tcp_addr = tcp.local_addr().map_err(bind_error("TCP", tcp_listen))?;

        info!(
            "DNS responder listening on {} (udp) and {} (tcp), upstream {}, {} override(s)",
            udp_addr,
            tcp_addr,
            settings.upstream,
            settings.overrides.len()
        );

        let handler = Arc::new(DnsHandler {
            upstream: settings.upstream,
            timeout: settings.timeout,
            overrides: settings.overrides,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(run_udp(
                Arc::new(udp),
                Arc::clone(&handler),
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_tcp(tcp, handler, shutdown_rx)),
        ];

        Ok(Self {
            udp_addr,
            tcp_addr,
            shutdown,
            tasks,
        })
    }

    /// Returns the UDP address the responder is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Returns the TCP address the responder is listening on.
    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Stops both listeners and waits until their sockets are closed.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("DNS listener task failed: {}", e);
            }
        }
        info!("DNS responder stopped");
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    handler: Arc<DnsHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; DNS_BUF_SIZE];
    let mut queries = JoinSet::new();

    loop {
        let (len, client_addr) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("DNS UDP receive error: {}", e);
                    continue;
                }
            },
        };
        let packet = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let handler = Arc::clone(&handler);

        queries.spawn(async move {
            let Some(response) = handler.handle(&packet).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, client_addr).await {
                error!("DNS UDP write to {} failed: {}", client_addr, e);
            }
        });
        while queries.try_join_next().is_some() {}
    }

    queries.shutdown().await;
    debug!("DNS UDP listener stopped");
}

async fn run_tcp(
    listener: TcpListener,
    handler: Arc<DnsHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("DNS TCP accept error: {}", e);
                    continue;
                }
            },
        };
        let handler = Arc::clone(&handler);

        connections.spawn(async move {
            if let Err(e) = serve_tcp_connection(stream, peer_addr, handler).await {
                debug!("DNS TCP connection from {} ended: {}", peer_addr, e);
            }
        });
        while connections.try_join_next().is_some() {}
    }

    connections.shutdown().await;
    debug!("DNS TCP listener stopped");
}

/// Serves length-prefixed queries until the peer closes, goes idle, or sends
/// a packet without a readable header.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<DnsHandler>,
) -> io::Result<()> {
    loop {
        let len = match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_u16()).await {
            Err(_) => {
                debug!("closing idle DNS TCP connection from {}", peer_addr);
                return Ok(());
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(len) => len?,
        };

        let mut packet = vec![0u8; usize::from(len)];
        stream.read_exact(&mut packet).await?;

        let Some(response) = handler.handle(&packet).await else {
            return Ok(());
        };
        let len = u16::try_from(response.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS response too large"))?;

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&response);
        stream.write_all(&framed).await?;
    }
}

fn bind_error(transport: &'static str, addr: SocketAddr) -> impl FnOnce(io::Error) -> DnsError {
    move |source| DnsError::Bind {
        transport,
        addr,
        source,
    }
}

struct DnsHandler {
    upstream: SocketAddr,
    timeout: Duration,
    overrides: OverrideTable,
}

impl DnsHandler {
    /// Returns the wire response for `packet`, or `None` when it must be dropped.
    ///
    /// Packets whose header decodes but whose body does not get FORMERR.
    async fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        match self.respond(packet).await {
            Ok(response) => Some(response),
            Err(DnsError::Parse(e)) => {
                let response = format_error_response(packet);
                if response.is_some() {
                    warn!("answering malformed DNS query with FORMERR: {}", e);
                } else {
                    warn!("dropping DNS packet without a readable header: {}", e);
                }
                response
            }
            Err(e) => {
                warn!("dropping DNS query: {}", e);
                None
            }
        }
    }

    async fn respond(&self, packet: &[u8]) -> Result<Vec<u8>, DnsError> {
        let request = Message::from_vec(packet).map_err(DnsError::Parse)?;

        let Some(question) = request.queries().first() else {
            warn!("DNS query {} has no questions", request.id());
            return failure_response(&request).to_vec().map_err(DnsError::Encode);
        };
        let name = question.name().to_string();

        if let Some(address) = self.overrides.lookup(&name) {
            debug!("answering {} with override {}", name, address);
            return override_response(&request, address)
                .to_vec()
                .map_err(DnsError::Encode);
        }

        debug!("forwarding DNS query for {} to {}", name, self.upstream);
        match self.exchange(packet, request.id()).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("{} (query for {})", e, name);
                failure_response(&request).to_vec().map_err(DnsError::Encode)
            }
        }
    }

    /// Sends `packet` to the upstream resolver over UDP and returns the first
    /// reply carrying the same transaction id.
    async fn exchange(&self, packet: &[u8], txid: u16) -> Result<Vec<u8>, DnsError> {
        let upstream = self.upstream;
        let io_error = |source: io::Error| DnsError::Upstream { upstream, source };

        let bind_addr: SocketAddr = if upstream.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(io_error)?;
        socket.connect(upstream).await.map_err(io_error)?;
        socket.send(packet).await.map_err(io_error)?;

        let receive = async {
            let mut buf = vec![0u8; MAX_UDP_MESSAGE];
            loop {
                let len = socket.recv(&mut buf).await?;
                if extract_txid(&buf[..len]) == Some(txid) {
                    return Ok::<_, io::Error>(buf[..len].to_vec());
                }
                debug!("discarding upstream DNS reply with mismatched txid");
            }
        };

        tokio::time::timeout(self.timeout, receive)
            .await
            .map_err(|_| DnsError::Timeout(upstream))?
            .map_err(io_error)
    }
}

/// Starts a response that mirrors the request's id, opcode, flags and first question.
fn reply_to(request: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled());
    if let Some(question) = request.queries().first() {
        response.add_query(question.clone());
    }
    response
}

fn failure_response(request: &Message) -> Message {
    let mut response = reply_to(request);
    response.set_response_code(ResponseCode::ServFail);
    response
}

/// Builds a FORMERR reply from the header of an otherwise unparseable packet.
fn format_error_response(packet: &[u8]) -> Option<Vec<u8>> {
    let header = Header::read(&mut BinDecoder::new(packet)).ok()?;
    let mut response = Message::new();
    response
        .set_id(header.id())
        .set_message_type(MessageType::Response)
        .set_op_code(header.op_code())
        .set_recursion_desired(header.recursion_desired())
        .set_checking_disabled(header.checking_disabled())
        .set_response_code(ResponseCode::FormErr);
    response.to_vec().ok()
}

fn override_response(request: &Message, address: Ipv4Addr) -> Message {
    let mut response = reply_to(request);
    if let Some(question) = request.queries().first() {
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            OVERRIDE_TTL,
            RData::A(A::from(address)),
        ));
    }
    response
}

fn extract_txid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};
    use tokio::sync::oneshot;

    const OVERRIDE_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn query(id: u16, name: &str) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        message
    }

    async fn start(upstream: SocketAddr, timeout: Duration) -> DnsServer {
        let settings = DnsSettings {
            upstream,
            timeout,
            overrides: OverrideTable::new([("example.test".to_string(), OVERRIDE_ADDR)]),
        };
        DnsServer::bind("127.0.0.1:0".parse().unwrap(), settings)
            .await
            .unwrap()
    }

    async fn ask_udp(server: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(packet, server).await.unwrap();
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        let received = tokio::time::timeout(Duration::from_secs(3), client.recv(&mut buf)).await;
        received.ok().map(|len| buf[..len.unwrap()].to_vec())
    }

    fn answer_addresses(response: &Message) -> Vec<(Ipv4Addr, u32)> {
        response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some((a.0, record.ttl())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fqdn_appends_dot() {
        assert_eq!(fqdn("example.test"), "example.test.");
        assert_eq!(fqdn("example.test."), "example.test.");
    }

    /// Overrides match by suffix, case-sensitively, first entry wins.
    #[test]
    fn override_table_lookup() {
        let table = OverrideTable::new([
            ("api.example.test".to_string(), Ipv4Addr::new(10, 0, 0, 1)),
            ("example.test.".to_string(), Ipv4Addr::new(10, 0, 0, 2)),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("api.example.test."), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(table.lookup("www.example.test."), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(table.lookup("example.test."), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(table.lookup("EXAMPLE.TEST."), None);
        assert_eq!(table.lookup("example.org."), None);
        assert!(OverrideTable::default().lookup("example.test.").is_none());
    }

    /// Tests that an overridden name is answered locally with a single A record
    /// and that the upstream resolver is never contacted.
    #[tokio::test]
    async fn override_answered_locally() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;

        for (id, name) in [(0x1234, "example.test."), (0x4321, "www.example.test.")] {
            let request = query(id, name);
            let raw = ask_udp(server.local_addr(), &request.to_vec().unwrap())
                .await
                .unwrap();
            let response = Message::from_vec(&raw).unwrap();

            assert_eq!(response.id(), id);
            assert_eq!(response.message_type(), MessageType::Response);
            assert_eq!(response.response_code(), ResponseCode::NoError);
            assert_eq!(response.queries(), request.queries());
            assert_eq!(response.answers().len(), 1);
            assert_eq!(response.answers()[0].name().to_string(), name);
            assert_eq!(answer_addresses(&response), vec![(OVERRIDE_ADDR, OVERRIDE_TTL)]);
        }

        let mut buf = [0u8; DNS_BUF_SIZE];
        let contacted =
            tokio::time::timeout(Duration::from_millis(300), upstream.recv_from(&mut buf)).await;
        assert!(contacted.is_err());

        server.shutdown().await;
    }

    /// Tests that a name without an override is forwarded byte-for-byte and the
    /// upstream reply is relayed back unchanged.
    #[tokio::test]
    async fn forwards_unmatched_query_verbatim() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        let fake_upstream = tokio::spawn(async move {
            let mut buf = [0u8; DNS_BUF_SIZE];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = reply_to(&request);
            reply.set_recursion_available(true);
            reply.add_answer(Record::from_rdata(
                request.queries()[0].name().clone(),
                42,
                RData::A(A::new(192, 0, 2, 7)),
            ));
            let reply = reply.to_vec().unwrap();
            upstream.send_to(&reply, from).await.unwrap();
            seen_tx.send((buf[..len].to_vec(), reply)).unwrap();
        });

        let server = start(upstream_addr, DEFAULT_UPSTREAM_TIMEOUT).await;
        let packet = query(0xbeef, "other.test.").to_vec().unwrap();
        let raw = ask_udp(server.local_addr(), &packet).await.unwrap();

        let (forwarded, upstream_reply) = seen_rx.await.unwrap();
        assert_eq!(forwarded, packet);
        assert_eq!(raw, upstream_reply);

        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.id(), 0xbeef);
        assert_eq!(answer_addresses(&response), vec![(Ipv4Addr::new(192, 0, 2, 7), 42)]);

        fake_upstream.await.unwrap();
        server.shutdown().await;
    }

    /// Tests that an upstream reply larger than an EDNS0 buffer is passed
    /// back whole.
    #[tokio::test]
    async fn forwards_large_upstream_reply() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let fake_upstream = tokio::spawn(async move {
            let mut buf = [0u8; DNS_BUF_SIZE];
            let (len, from) = upstream.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = reply_to(&request);
            for i in 0..400u16 {
                let [high, low] = i.to_be_bytes();
                reply.add_answer(Record::from_rdata(
                    request.queries()[0].name().clone(),
                    60,
                    RData::A(A::new(10, 1, high, low)),
                ));
            }
            let reply = reply.to_vec().unwrap();
            assert!(reply.len() > DNS_BUF_SIZE);
            upstream.send_to(&reply, from).await.unwrap();
            reply
        });

        let server = start(upstream_addr, DEFAULT_UPSTREAM_TIMEOUT).await;
        let packet = query(0x0bad, "big.test.").to_vec().unwrap();
        let raw = ask_udp(server.local_addr(), &packet).await.unwrap();

        let upstream_reply = fake_upstream.await.unwrap();
        assert_eq!(raw, upstream_reply);
        assert_eq!(Message::from_vec(&raw).unwrap().answers().len(), 400);

        server.shutdown().await;
    }

    /// Tests that a query with no questions gets SERVFAIL and is not forwarded.
    #[tokio::test]
    async fn empty_question_fails_without_forwarding() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;

        let mut request = Message::new();
        request.set_id(7).set_message_type(MessageType::Query);
        let raw = ask_udp(server.local_addr(), &request.to_vec().unwrap())
            .await
            .unwrap();
        let response = Message::from_vec(&raw).unwrap();

        assert_eq!(response.id(), 7);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(response.answers().is_empty());

        let mut buf = [0u8; DNS_BUF_SIZE];
        let contacted =
            tokio::time::timeout(Duration::from_millis(300), upstream.recv_from(&mut buf)).await;
        assert!(contacted.is_err());

        server.shutdown().await;
    }

    /// Tests that an upstream that never answers yields SERVFAIL after the deadline.
    #[tokio::test]
    async fn upstream_timeout_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(silent.local_addr().unwrap(), Duration::from_millis(200)).await;

        let raw = ask_udp(server.local_addr(), &query(99, "other.test.").to_vec().unwrap())
            .await
            .unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.id(), 99);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries().len(), 1);

        server.shutdown().await;
    }

    /// A header for query 0x1234 announcing one question, followed by a
    /// label length that is not valid.
    const BROKEN_QUERY: &[u8] = b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00junk";

    /// Tests that a packet with a readable header but a broken body gets
    /// FORMERR carrying the request's id and opcode.
    #[tokio::test]
    async fn malformed_query_gets_format_error() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;

        let raw = ask_udp(server.local_addr(), BROKEN_QUERY).await.unwrap();
        let response = Message::from_vec(&raw).unwrap();
        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.op_code(), OpCode::Query);
        assert!(response.recursion_desired());
        assert_eq!(response.response_code(), ResponseCode::FormErr);
        assert!(response.queries().is_empty());
        assert!(response.answers().is_empty());

        server.shutdown().await;
    }

    /// Tests that packets too short to hold a header are dropped and the
    /// responder keeps serving.
    #[tokio::test]
    async fn headerless_packet_dropped() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\x00\x01junk", server.local_addr()).await.unwrap();
        let mut buf = [0u8; DNS_BUF_SIZE];
        let answered =
            tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
        assert!(answered.is_err());

        let raw = ask_udp(server.local_addr(), &query(1, "example.test.").to_vec().unwrap())
            .await
            .unwrap();
        assert_eq!(Message::from_vec(&raw).unwrap().answers().len(), 1);

        server.shutdown().await;
    }

    /// Tests that a malformed query over TCP is answered with FORMERR and the
    /// connection keeps serving later queries.
    #[tokio::test]
    async fn tcp_malformed_query_keeps_connection() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;
        let mut stream = TcpStream::connect(server.tcp_local_addr()).await.unwrap();

        let good = query(21, "example.test.").to_vec().unwrap();
        for packet in [BROKEN_QUERY, good.as_slice()] {
            stream.write_u16(packet.len() as u16).await.unwrap();
            stream.write_all(packet).await.unwrap();
        }

        let mut responses = Vec::new();
        for _ in 0..2 {
            let len = stream.read_u16().await.unwrap();
            let mut raw = vec![0u8; usize::from(len)];
            stream.read_exact(&mut raw).await.unwrap();
            responses.push(Message::from_vec(&raw).unwrap());
        }

        assert_eq!(responses[0].id(), 0x1234);
        assert_eq!(responses[0].response_code(), ResponseCode::FormErr);
        assert_eq!(responses[1].id(), 21);
        assert_eq!(answer_addresses(&responses[1]), vec![(OVERRIDE_ADDR, OVERRIDE_TTL)]);

        server.shutdown().await;
    }

    /// Tests length-prefixed queries over TCP, several on one connection.
    #[tokio::test]
    async fn tcp_queries_share_connection() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;
        assert_eq!(server.tcp_local_addr().port(), server.local_addr().port());

        let mut stream = TcpStream::connect(server.tcp_local_addr()).await.unwrap();
        for id in [10u16, 11] {
            let packet = query(id, "example.test.").to_vec().unwrap();
            stream.write_u16(packet.len() as u16).await.unwrap();
            stream.write_all(&packet).await.unwrap();

            let len = stream.read_u16().await.unwrap();
            let mut raw = vec![0u8; usize::from(len)];
            stream.read_exact(&mut raw).await.unwrap();
            let response = Message::from_vec(&raw).unwrap();
            assert_eq!(response.id(), id);
            assert_eq!(answer_addresses(&response), vec![(OVERRIDE_ADDR, OVERRIDE_TTL)]);
        }

        server.shutdown().await;
    }

    /// Tests that shutdown releases both the UDP and TCP sockets.
    #[tokio::test]
    async fn shutdown_releases_sockets() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = start(upstream.local_addr().unwrap(), DEFAULT_UPSTREAM_TIMEOUT).await;
        let addr = server.local_addr();

        server.shutdown().await;

        UdpSocket::bind(addr).await.unwrap();
        TcpListener::bind(addr).await.unwrap();
    }
}
