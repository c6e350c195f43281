//! Local DNS forwarder.
//!
//! Every datagram on the listening socket becomes one query task. Standard
//! A/AAAA queries start a remote attempt through the SOCKS5 proxy right away,
//! then the hosts table, the ACL and the local resolver decide whether that
//! attempt is used or cancelled. Everything else is relayed to the remote
//! resolver untouched. All socket readiness goes through the [`Reactor`].

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use futures::TryFutureExt;
use hickory_proto::op::{Message, OpCode};
use hickory_proto::rr::RecordType;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::acl::AclMatcher;
use crate::error::{Error, Result};
use crate::hosts::HostsFile;
use crate::proto_utils::{
    cook_response, filter_family, query_host, servfail_from_raw, servfail_response,
};
use crate::reactor::{Interest, Reactor};
use crate::resolver::LocalResolver;
use crate::socks5::Socks5Endpoint;

const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServerConfig {
    pub listen: SocketAddr,
    /// SOCKS5 proxy the remote resolver is reached through.
    pub proxy: SocketAddr,
    /// Remote resolver as seen from the proxy.
    pub remote_dns: (String, u16),
    /// Relay over SOCKS5 CONNECT (DNS over TCP) instead of UDP ASSOCIATE.
    pub tcp: bool,
    pub local_timeout: Duration,
    pub remote_timeout: Duration,
    /// TTL of locally assembled answers.
    pub ttl: u32,
    pub packet_size: usize,
}

impl Default for DnsServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 5450)),
            proxy: SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)),
            remote_dns: ("8.8.8.8".to_string(), 53),
            tcp: true,
            local_timeout: Duration::from_millis(1000),
            remote_timeout: Duration::from_millis(10_000),
            ttl: 120,
            packet_size: 1500,
        }
    }
}

pub struct LocalDnsServer {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
}

struct Inner {
    config: DnsServerConfig,
    reactor: Reactor,
    remote_dns: Socks5Endpoint,
    hosts: Arc<ArcSwap<HostsFile>>,
    acl: Option<Arc<dyn AclMatcher>>,
    resolver: Arc<dyn LocalResolver>,
    /// Emptied on close so the port is released with the reactor's channels.
    listener: ArcSwapOption<mio::net::UdpSocket>,
    token: CancellationToken,
    tracker: TaskTracker,
    runtime: Handle,
}

impl LocalDnsServer {
    /// Binds the listening socket and starts serving on the current runtime.
    ///
    /// A bind failure is reported as [`Error::Bind`], which
    /// [`Error::is_expected`] classifies as recoverable.
    pub async fn start(
        config: DnsServerConfig,
        resolver: Arc<dyn LocalResolver>,
        acl: Option<Arc<dyn AclMatcher>>,
        hosts: Arc<ArcSwap<HostsFile>>,
    ) -> Result<Self> {
        let listener = bind_listener(config.listen).map_err(|source| Error::Bind {
            addr: config.listen,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let remote_dns = Socks5Endpoint::new(&config.remote_dns.0, config.remote_dns.1)?;

        let inner = Arc::new(Inner {
            reactor: Reactor::new()?,
            remote_dns,
            hosts,
            acl,
            resolver,
            listener: ArcSwapOption::from(Some(Arc::clone(&listener))),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
            config,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .reactor
            .register(listener, Interest::READ, move |_ready| {
                accept_datagrams(&weak);
            })
            .await?;

        info!(
            listen = %local_addr,
            proxy = %inner.config.proxy,
            remote_dns = %format!("{}:{}", inner.config.remote_dns.0, inner.config.remote_dns.1),
            tcp = inner.config.tcp,
            "dns server started"
        );
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancels in-flight queries, stops the reactor and waits for both to wind down.
    pub async fn close(&self) {
        self.inner.token.cancel();
        self.inner.tracker.close();
        self.inner.reactor.shutdown().await;
        self.inner.tracker.wait().await;
        self.inner.listener.store(None);
        debug!(listen = %self.local_addr, "dns server closed");
    }
}

impl Drop for LocalDnsServer {
    fn drop(&mut self) {
        self.inner.token.cancel();
        self.inner.reactor.close();
        self.inner.listener.store(None);
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(mio::net::UdpSocket::from_std(socket.into()))
}

/// Runs on the reactor thread: drains the listener and spawns one task per datagram.
fn accept_datagrams(weak: &Weak<Inner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Some(listener) = inner.listener.load_full() else {
        return;
    };
    let mut buf = vec![0u8; inner.config.packet_size];
    loop {
        match listener.recv_from(&mut buf) {
            Ok((len, peer)) => inner.spawn_query(Bytes::copy_from_slice(&buf[..len]), peer),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                ) => {}
            Err(err) => {
                warn!(error = %err, "udp recv failed");
                break;
            }
        }
    }
}

impl Inner {
    fn spawn_query(self: &Arc<Self>, packet: Bytes, peer: SocketAddr) {
        let inner = Arc::clone(self);
        let token = self.token.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = inner.serve(packet, peer) => {}
                }
            },
            &self.runtime,
        );
    }

    async fn serve(self: Arc<Self>, packet: Bytes, peer: SocketAddr) {
        let response = match Message::from_vec(&packet) {
            Ok(request) => self.answer(&request, &packet).await,
            Err(err) => {
                debug!(event = "dns_passthrough", peer = %peer, error = %err, "unparseable query, forwarding raw bytes");
                self.passthrough(&packet).await
            }
        };
        if let Some(response) = response {
            self.reply(&response, peer).await;
        }
    }

    async fn passthrough(&self, packet: &Bytes) -> Option<Bytes> {
        match self.forward(packet).await {
            Ok(response) => Some(response),
            Err(err) if err.is_cancelled() => None,
            Err(err) => {
                warn!(event = "dns_passthrough", error = %err, "remote forward failed");
                let servfail = servfail_from_raw(packet);
                if servfail.is_none() {
                    debug!(len = packet.len(), "packet shorter than a dns header, dropping");
                }
                servfail
            }
        }
    }

    async fn answer(self: &Arc<Self>, request: &Message, packet: &Bytes) -> Option<Bytes> {
        match self.resolve(request, packet).await {
            Ok(response) => Some(response),
            Err(err) if err.is_cancelled() => None,
            Err(err) => {
                let qname = request
                    .queries()
                    .first()
                    .map(|q| query_host(q.name()))
                    .unwrap_or_default();
                warn!(event = "dns_servfail", qname = %qname, error = %err, "query failed");
                match servfail_response(request) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(error = %err, "failed to encode servfail");
                        None
                    }
                }
            }
        }
    }

    async fn resolve(self: &Arc<Self>, request: &Message, packet: &Bytes) -> Result<Bytes> {
        let query = match request.queries().first() {
            Some(query)
                if request.op_code() == OpCode::Query
                    && matches!(query.query_type(), RecordType::A | RecordType::AAAA) =>
            {
                query
            }
            _ => return self.forward(packet).await,
        };
        let qtype = query.query_type();
        let host = query_host(query.name());
        debug!(event = "dns_query", qname = %host, qtype = %qtype, "query received");

        let mut remote = RemoteSlot::spawn(self, packet.clone());

        let hosts = self.hosts.load().resolve(&host);
        if !hosts.is_empty() {
            remote.cancel();
            let addrs = filter_family(hosts, qtype);
            debug!(event = "dns_response", qname = %host, source = "hosts", answers = addrs.len());
            return cook_response(request, &addrs, self.config.ttl);
        }

        let Some(acl) = self.acl.as_ref() else {
            return remote.join().await;
        };
        if acl.should_bypass(&host) == Some(true) {
            debug!(event = "dns_response", qname = %host, source = "remote", "acl routes host through proxy");
            return remote.join().await;
        }

        let local = match timeout(self.config.local_timeout, self.resolver.resolve(&host)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(err)) => {
                debug!(qname = %host, error = %err, "local resolution failed, using remote");
                return remote.join().await;
            }
            Err(_) => {
                warn!(qname = %host, timeout_ms = self.config.local_timeout.as_millis() as u64, "local resolution timed out, using remote");
                return remote.join().await;
            }
        };

        let local = filter_family(local, qtype);
        if local.iter().any(|addr| acl.should_bypass_ip(*addr)) {
            remote.cancel();
            debug!(event = "dns_response", qname = %host, source = "local", answers = local.len());
            return cook_response(request, &local, self.config.ttl);
        }

        match remote.join().await {
            Err(err) if !err.is_cancelled() && !local.is_empty() => {
                warn!(qname = %host, error = %err, "remote failed, answering with local addresses");
                cook_response(request, &local, self.config.ttl)
            }
            other => other,
        }
    }

    /// Relays `packet` to the remote resolver, bounded by the remote timeout.
    async fn forward(&self, packet: &[u8]) -> Result<Bytes> {
        let attempt = async {
            if self.config.tcp {
                self.forward_tcp(packet).await
            } else {
                self.forward_udp(packet).await
            }
        };
        match timeout(self.config.remote_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("remote resolution")),
        }
    }

    async fn forward_tcp(&self, packet: &[u8]) -> Result<Bytes> {
        let request = self.remote_dns.tcp_wrap(packet)?;
        let stream = Arc::new(mio::net::TcpStream::connect(self.config.proxy)?);

        loop {
            let ready = self.reactor.wait(&stream, Interest::CONNECT).await?;
            if let Some(err) = stream.take_error()? {
                return Err(err.into());
            }
            if ready.is_error() {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            match stream.peer_addr() {
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let mut written = 0;
        while written < request.len() {
            match (&*stream).write(&request[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.reactor.wait(&stream, Interest::WRITE).await?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }

        let reactor = &self.reactor;
        let reader = &stream;
        let mut buffer = self.remote_dns.tcp_receive_buffer(self.config.packet_size);
        self.remote_dns
            .tcp_unwrap(
                &mut buffer,
                |buf| (&**reader).read(buf),
                move || reactor.wait(reader, Interest::READ).map_ok(|_| ()),
            )
            .await?;
        Ok(buffer.freeze())
    }

    async fn forward_udp(&self, packet: &[u8]) -> Result<Bytes> {
        let proxy = self.config.proxy;
        let bind_addr = if proxy.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = Arc::new(mio::net::UdpSocket::bind(bind_addr)?);
        let datagram = self.remote_dns.udp_wrap(packet);

        loop {
            self.reactor.wait(&socket, Interest::WRITE).await?;
            match socket.send_to(&datagram, proxy) {
                Ok(_) => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut buffer = self.remote_dns.udp_receive_buffer(self.config.packet_size);
        loop {
            self.reactor.wait(&socket, Interest::READ).await?;
            loop {
                match socket.recv_from(&mut buffer) {
                    Ok((len, from)) if from == proxy => {
                        buffer.truncate(len);
                        self.remote_dns.udp_unwrap(&mut buffer)?;
                        return Ok(buffer.freeze());
                    }
                    Ok((_, from)) => {
                        debug!(from = %from, proxy = %proxy, "discarding datagram from unexpected source");
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    async fn reply(&self, response: &[u8], peer: SocketAddr) {
        let Some(listener) = self.listener.load_full() else {
            debug!(peer = %peer, "listener closed, reply abandoned");
            return;
        };
        loop {
            if let Err(err) = self.reactor.wait(&listener, Interest::WRITE).await {
                debug!(peer = %peer, error = %err, "reply abandoned");
                return;
            }
            match listener.send_to(response, peer) {
                Ok(_) => return,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    warn!(peer = %peer, error = %err, "failed to send response");
                    return;
                }
            }
        }
    }
}

/// Remote side of the race, running as its own task so the hosts table and
/// local resolver can be consulted meanwhile. Aborted when dropped unjoined.
struct RemoteSlot {
    handle: Option<JoinHandle<Result<Bytes>>>,
}

impl RemoteSlot {
    fn spawn(inner: &Arc<Inner>, packet: Bytes) -> Self {
        let task = Arc::clone(inner);
        let token = inner.token.clone();
        let handle = inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err(Error::Cancelled),
                    result = task.forward(&packet) => result,
                }
            },
            &inner.runtime,
        );
        Self {
            handle: Some(handle),
        }
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    async fn join(mut self) -> Result<Bytes> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::Cancelled);
        };
        let joined = handle.await;
        self.handle = None;
        match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(Error::Cancelled),
            Err(err) => Err(io::Error::other(err.to_string()).into()),
        }
    }
}

impl Drop for RemoteSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RData};
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::sleep;

    /// Header the server prepends for the default remote resolver 8.8.8.8:53.
    const UDP_RELAY_HEADER: usize = 3 + 1 + 4 + 2;

    struct MockResolver {
        answer: Option<Vec<IpAddr>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockResolver {
        fn new(answer: Option<Vec<IpAddr>>) -> Arc<Self> {
            Self::delayed(answer, Duration::ZERO)
        }

        fn delayed(answer: Option<Vec<IpAddr>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LocalResolver for MockResolver {
        fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                sleep(self.delay).await;
                self.answer
                    .clone()
                    .ok_or_else(|| Error::UnknownHost(host.to_string()))
            }
            .boxed()
        }
    }

    struct MockAcl {
        host: Option<bool>,
        direct: bool,
    }

    impl AclMatcher for MockAcl {
        fn should_bypass(&self, _host: &str) -> Option<bool> {
            self.host
        }

        fn should_bypass_ipv4(&self, _addr: Ipv4Addr) -> bool {
            self.direct
        }

        fn should_bypass_ipv6(&self, _addr: Ipv6Addr) -> bool {
            self.direct
        }
    }

    fn acl(host: Option<bool>, direct: bool) -> Option<Arc<dyn AclMatcher>> {
        Some(Arc::new(MockAcl { host, direct }))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// What the fake remote resolver behind the proxy answers.
    fn remote_answer(payload: &[u8]) -> Vec<u8> {
        match Message::from_vec(payload) {
            Ok(req) => {
                let addrs = match req.queries()[0].query_type() {
                    RecordType::A => vec![ip("9.9.9.9")],
                    RecordType::AAAA => vec![ip("2001:db8::9")],
                    _ => Vec::new(),
                };
                cook_response(&req, &addrs, 60).unwrap().to_vec()
            }
            Err(_) => {
                let mut raw = b"raw:".to_vec();
                raw.extend_from_slice(payload);
                raw
            }
        }
    }

    /// UDP relay that strips the SOCKS5 header, answers, and optionally sends
    /// a forged answer from a foreign socket first.
    async fn spawn_udp_proxy(spoof: bool) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let header = buf[..UDP_RELAY_HEADER].to_vec();
                if spoof {
                    let rogue = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
                    let req = Message::from_vec(&buf[UDP_RELAY_HEADER..len]).unwrap();
                    let mut forged = header.clone();
                    forged.extend(cook_response(&req, &[ip("6.6.6.6")], 60).unwrap());
                    rogue.send_to(&forged, from).await.unwrap();
                }
                let mut reply = header;
                reply.extend(remote_answer(&buf[UDP_RELAY_HEADER..len]));
                let _ = socket.send_to(&reply, from).await;
            }
        });
        (addr, hits)
    }

    /// SOCKS5 CONNECT proxy that answers one length-prefixed DNS query per connection.
    async fn spawn_tcp_proxy() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = [0u8; 3 + 4 + 4 + 2];
                    stream.read_exact(&mut head).await?;
                    assert_eq!(&head[..4], &[5, 1, 0, 5]);
                    let mut len = [0u8; 2];
                    stream.read_exact(&mut len).await?;
                    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
                    stream.read_exact(&mut payload).await?;

                    let answer = remote_answer(&payload);
                    let mut reply = vec![5, 0, 5, 0, 0, 1, 127, 0, 0, 1, 0, 0];
                    reply.extend_from_slice(&(answer.len() as u16).to_be_bytes());
                    reply.extend_from_slice(&answer);
                    stream.write_all(&reply).await?;
                    Ok::<(), io::Error>(())
                });
            }
        });
        (addr, hits)
    }

    async fn start_server(
        proxy: SocketAddr,
        tcp: bool,
        resolver: Arc<MockResolver>,
        acl: Option<Arc<dyn AclMatcher>>,
        hosts: &str,
    ) -> LocalDnsServer {
        let config = DnsServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            proxy,
            tcp,
            local_timeout: Duration::from_millis(200),
            remote_timeout: Duration::from_millis(500),
            ..DnsServerConfig::default()
        };
        let hosts = Arc::new(ArcSwap::from_pointee(HostsFile::parse(hosts)));
        LocalDnsServer::start(config, resolver, acl, hosts)
            .await
            .expect("server start")
    }

    fn query(host: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x4242);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(host).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    async fn exchange(server: &LocalDnsServer, packet: &[u8]) -> Vec<u8> {
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(packet, server.local_addr()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .expect("no response from server")
            .unwrap();
        buf.truncate(len);
        buf
    }

    fn answers(response: &[u8]) -> (ResponseCode, Vec<IpAddr>) {
        let msg = Message::from_vec(response).unwrap();
        assert_eq!(msg.id(), 0x4242);
        let addrs = msg
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect();
        (msg.response_code(), addrs)
    }

    #[tokio::test]
    async fn hosts_table_answers_with_family_filter() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::new(Some(vec![ip("10.0.0.5")]));
        let server = start_server(proxy, false, resolver.clone(), acl(Some(true), true), "1.2.3.4 a.test").await;

        let (rcode, addrs) = answers(&exchange(&server, &query("a.test.", RecordType::A)).await);
        assert_eq!(rcode, ResponseCode::NoError);
        assert_eq!(addrs, vec![ip("1.2.3.4")]);

        let (rcode, addrs) = answers(&exchange(&server, &query("a.test.", RecordType::AAAA)).await);
        assert_eq!(rcode, ResponseCode::NoError);
        assert!(addrs.is_empty());
        assert_eq!(resolver.calls(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn remote_routed_host_never_touches_local_resolver() {
        let (proxy, hits) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::new(Some(vec![ip("10.0.0.5")]));
        let server = start_server(proxy, false, resolver.clone(), acl(Some(true), true), "").await;

        let (_, addrs) = answers(&exchange(&server, &query("blocked.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("9.9.9.9")]);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn local_answer_without_direct_address_loses_to_remote() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::new(Some(vec![ip("10.0.0.5")]));
        let server = start_server(proxy, false, resolver.clone(), acl(Some(false), false), "").await;

        let (_, addrs) = answers(&exchange(&server, &query("direct.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("9.9.9.9")]);
        assert_eq!(resolver.calls(), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn direct_local_address_wins_race() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::new(Some(vec![ip("10.0.0.5"), ip("fd00::5")]));
        let server = start_server(proxy, false, resolver.clone(), acl(None, true), "").await;

        let (_, addrs) = answers(&exchange(&server, &query("lan.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("10.0.0.5")]);

        let (_, addrs) = answers(&exchange(&server, &query("lan.example.", RecordType::AAAA)).await);
        assert_eq!(addrs, vec![ip("fd00::5")]);
        server.close().await;
    }

    #[tokio::test]
    async fn slow_local_resolver_falls_back_to_remote() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::delayed(Some(vec![ip("10.0.0.5")]), Duration::from_secs(2));
        let server = start_server(proxy, false, resolver.clone(), acl(None, true), "").await;

        let (_, addrs) = answers(&exchange(&server, &query("slow.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("9.9.9.9")]);
        assert_eq!(resolver.calls(), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn unparseable_query_is_relayed_verbatim() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let server = start_server(proxy, false, MockResolver::new(None), None, "").await;

        let response = exchange(&server, &[0x13, 0x37, 0x42]).await;
        assert_eq!(response, b"raw:\x13\x37\x42".to_vec());
        server.close().await;
    }

    #[tokio::test]
    async fn non_address_query_is_forwarded_without_acl() {
        let (proxy, hits) = spawn_udp_proxy(false).await;
        let resolver = MockResolver::new(Some(vec![ip("10.0.0.5")]));
        let server = start_server(proxy, false, resolver.clone(), acl(Some(false), true), "1.2.3.4 txt.example").await;

        let (rcode, addrs) = answers(&exchange(&server, &query("txt.example.", RecordType::TXT)).await);
        assert_eq!(rcode, ResponseCode::NoError);
        assert!(addrs.is_empty());
        assert_eq!(resolver.calls(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn forged_datagrams_are_ignored() {
        let (proxy, _) = spawn_udp_proxy(true).await;
        let server = start_server(proxy, false, MockResolver::new(None), None, "").await;

        let (_, addrs) = answers(&exchange(&server, &query("spoof.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("9.9.9.9")]);
        server.close().await;
    }

    #[tokio::test]
    async fn unreachable_remote_and_unknown_local_is_servfail() {
        let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let proxy = dead.local_addr().unwrap();
        drop(dead);
        let server = start_server(proxy, false, MockResolver::new(None), acl(None, true), "").await;

        let (rcode, addrs) = answers(&exchange(&server, &query("down.example.", RecordType::A)).await);
        assert_eq!(rcode, ResponseCode::ServFail);
        assert!(addrs.is_empty());
        server.close().await;
    }

    #[tokio::test]
    async fn remote_failure_keeps_undirected_local_answer() {
        let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let proxy = dead.local_addr().unwrap();
        drop(dead);
        let resolver = MockResolver::new(Some(vec![ip("93.184.216.34")]));
        let server = start_server(proxy, false, resolver, acl(None, false), "").await;

        let (rcode, addrs) = answers(&exchange(&server, &query("web.example.", RecordType::A)).await);
        assert_eq!(rcode, ResponseCode::NoError);
        assert_eq!(addrs, vec![ip("93.184.216.34")]);
        server.close().await;
    }

    #[tokio::test]
    async fn tcp_relay_through_connect() {
        let (proxy, hits) = spawn_tcp_proxy().await;
        let server = start_server(proxy, true, MockResolver::new(None), None, "").await;

        let (_, addrs) = answers(&exchange(&server, &query("tcp.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("9.9.9.9")]);
        let (_, addrs) = answers(&exchange(&server, &query("tcp.example.", RecordType::AAAA)).await);
        assert_eq!(addrs, vec![ip("2001:db8::9")]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        server.close().await;
    }

    #[tokio::test]
    async fn refused_tcp_proxy_is_servfail() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy = dead.local_addr().unwrap();
        drop(dead);
        let server = start_server(proxy, true, MockResolver::new(None), None, "").await;

        let (rcode, _) = answers(&exchange(&server, &query("refused.example.", RecordType::A)).await);
        assert_eq!(rcode, ResponseCode::ServFail);
        server.close().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_expected_error() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let first = start_server(proxy, false, MockResolver::new(None), None, "").await;

        let config = DnsServerConfig {
            listen: first.local_addr(),
            proxy,
            ..DnsServerConfig::default()
        };
        let hosts = Arc::new(ArcSwap::from_pointee(HostsFile::default()));
        let err = match LocalDnsServer::start(config, MockResolver::new(None), None, hosts).await {
            Ok(_) => panic!("second bind on the same port succeeded"),
            Err(err) => err,
        };
        assert!(err.is_expected());
        first.close().await;
    }

    #[tokio::test]
    async fn close_releases_listening_port() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let server = start_server(proxy, false, MockResolver::new(None), None, "").await;
        let addr = server.local_addr();
        let _ = exchange(&server, &query("x.example.", RecordType::A)).await;

        server.close().await;
        let rebound = std::net::UdpSocket::bind(addr);
        assert!(rebound.is_ok(), "listener still bound after close: {rebound:?}");
    }

    #[tokio::test]
    async fn losing_remote_connection_is_closed_after_local_win() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = closed_tx.send(());
        });

        let config = DnsServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            proxy,
            tcp: true,
            local_timeout: Duration::from_secs(2),
            remote_timeout: Duration::from_secs(10),
            ..DnsServerConfig::default()
        };
        let hosts = Arc::new(ArcSwap::from_pointee(HostsFile::default()));
        let resolver = MockResolver::delayed(Some(vec![ip("10.0.0.5")]), Duration::from_millis(100));
        let server = LocalDnsServer::start(config, resolver, acl(None, true), hosts)
            .await
            .expect("server start");

        let (_, addrs) = answers(&exchange(&server, &query("direct.example.", RecordType::A)).await);
        assert_eq!(addrs, vec![ip("10.0.0.5")]);
        tokio::time::timeout(Duration::from_secs(1), closed_rx)
            .await
            .expect("remote connection still open after local answer")
            .unwrap();
        server.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (proxy, _) = spawn_udp_proxy(false).await;
        let server = start_server(proxy, false, MockResolver::new(None), None, "").await;
        let _ = exchange(&server, &query("x.example.", RecordType::A)).await;

        server.close().await;
        server.close().await;
        drop(server);
    }
}
