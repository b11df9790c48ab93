//! 嵌入式协议栈与其描述符表。
//!
//! 协议栈运行在进程内的回环设备上；所有套接字共享同一个 `Stack`，描述符是描述符表
//! 中的下标，总是分配最小的空闲槽位。每次操作前后都会驱动协议栈（`pump`），
//! 使握手、确认与窗口更新在同一次调用内推进。

use std::io;
use std::time::Duration;

use smoltcp::iface::{Config, Interface, PollResult, SocketHandle, SocketSet};
use smoltcp::phy::{Loopback, Medium};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tracing::{debug, warn};

use crate::addr::{AddressFamily, SocketAddress};
use crate::config::SocketConfig;
use crate::error::{self, OperationKind, SocketError};
use crate::socket::{
    ConnectOutcome, Descriptor, Protocol, ReadOutcome, RecvOutcome, ShutdownDirection,
    WriteOutcome,
};

const NAME: &str = "lwip_sockets";
/// 单次驱动最多轮询的次数；回环设备上一次握手约需三轮。
const PUMP_ROUNDS: usize = 16;

struct Entry {
    family: AddressFamily,
    /// 由本描述符独占的本地端口；`accept` 得到的连接与监听者共享端口，此处为 `None`。
    owned_port: Option<u16>,
    reuse_address: bool,
    kind: Kind,
}

enum Kind {
    Tcp(TcpEntry),
    Udp(UdpEntry),
}

struct TcpEntry {
    handle: SocketHandle,
    bound: Option<IpListenEndpoint>,
    pool: Option<ListenerPool>,
    /// 是否曾发起或接受连接；决定 `Closed` 状态应报告为复位还是未连接。
    active: bool,
    read_shutdown: bool,
}

/// 监听积压：一组处于 `Listen` 状态的套接字，每接受一个连接就补齐一个。
struct ListenerPool {
    endpoint: IpListenEndpoint,
    backlog: usize,
    pending: Vec<SocketHandle>,
}

struct UdpEntry {
    handle: SocketHandle,
    remote: Option<IpEndpoint>,
}

pub(super) struct Stack {
    iface: Interface,
    device: Loopback,
    sockets: SocketSet<'static>,
    table: Vec<Option<Entry>>,
    /// 已关闭、等待完成 FIN 交换的 TCP 套接字。
    closing: Vec<SocketHandle>,
    config: SocketConfig,
    next_port: u16,
}

fn io_error(op: OperationKind, kind: io::ErrorKind) -> SocketError {
    SocketError::from_kind(op, kind)
}

fn slot(
    table: &mut [Option<Entry>],
    fd: Descriptor,
    op: OperationKind,
) -> Result<&mut Entry, SocketError> {
    usize::try_from(fd)
        .ok()
        .and_then(|index| table.get_mut(index))
        .and_then(Option::as_mut)
        .ok_or_else(|| SocketError::closed(op))
}

fn to_ip(addr: &SocketAddress) -> IpAddress {
    IpAddress::from(addr.ip())
}

fn to_endpoint(addr: &SocketAddress) -> IpEndpoint {
    IpEndpoint::new(to_ip(addr), addr.port())
}

fn from_ip(addr: IpAddress, port: u16) -> SocketAddress {
    match addr {
        IpAddress::Ipv4(v4) => SocketAddress::V4 {
            addr: v4.octets(),
            port,
        },
        IpAddress::Ipv6(v6) => SocketAddress::V6 {
            addr: v6.segments(),
            port,
            scope_id: 0,
        },
    }
}

fn wildcard(family: AddressFamily, port: u16) -> SocketAddress {
    match family {
        AddressFamily::Inet => SocketAddress::V4 {
            addr: [0; 4],
            port,
        },
        AddressFamily::Inet6 => SocketAddress::V6 {
            addr: [0; 8],
            port,
            scope_id: 0,
        },
    }
}

fn from_listen_endpoint(family: AddressFamily, endpoint: IpListenEndpoint) -> SocketAddress {
    match endpoint.addr {
        Some(addr) => from_ip(addr, endpoint.port),
        None => wildcard(family, endpoint.port),
    }
}

/// IPv6 套接字上的 IPv4-mapped 地址还原为 IPv4，协议栈本身是双栈的。
fn normalize(family: AddressFamily, addr: &SocketAddress) -> Result<SocketAddress, SocketError> {
    match (family, addr) {
        (AddressFamily::Inet, SocketAddress::V6 { .. }) => addr
            .to_family(AddressFamily::Inet)
            .ok_or_else(|| SocketError::InvalidAddress {
                text: addr.to_string(),
            }),
        _ => Ok(addr.unmapped()),
    }
}

fn tcp_connect_outcome(state: tcp::State) -> Result<ConnectOutcome, SocketError> {
    match state {
        tcp::State::SynSent | tcp::State::SynReceived => Ok(ConnectOutcome::InProgress),
        tcp::State::Closed | tcp::State::Listen => Err(io_error(
            error::CONNECT,
            io::ErrorKind::ConnectionRefused,
        )),
        _ => Ok(ConnectOutcome::Connected),
    }
}

fn new_tcp_socket(config: &SocketConfig) -> tcp::Socket<'static> {
    let mut socket = tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0u8; config.rx_buffer_size]),
        tcp::SocketBuffer::new(vec![0u8; config.tx_buffer_size]),
    );
    socket.set_nagle_enabled(false);
    socket.set_ack_delay(None);
    socket
}

fn new_udp_socket(config: &SocketConfig) -> udp::Socket<'static> {
    let packet_bytes = config.udp_packet_slots * config.rx_buffer_size.max(1500);
    udp::Socket::new(
        udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; config.udp_packet_slots],
            vec![0u8; packet_bytes],
        ),
        udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; config.udp_packet_slots],
            vec![0u8; packet_bytes],
        ),
    )
}

impl ListenerPool {
    fn refill(
        &mut self,
        sockets: &mut SocketSet<'static>,
        config: &SocketConfig,
    ) -> Result<(), SocketError> {
        while self.pending.len() < self.backlog {
            let mut socket = new_tcp_socket(config);
            socket
                .listen(self.endpoint)
                .map_err(|_| io_error(error::LISTEN, io::ErrorKind::AddrNotAvailable))?;
            self.pending.push(sockets.add(socket));
        }
        Ok(())
    }

    fn has_established(&self, sockets: &SocketSet<'static>) -> bool {
        self.pending.iter().any(|handle| {
            let socket = sockets.get::<tcp::Socket>(*handle);
            socket.may_send() || socket.may_recv()
        })
    }
}

impl Stack {
    pub(super) fn new(config: SocketConfig) -> Self {
        let mut device = Loopback::new(Medium::Ip);
        let mut iface = Interface::new(
            Config::new(HardwareAddress::Ip),
            &mut device,
            Instant::now(),
        );
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::v4(127, 0, 0, 1), 8));
            if crate::addr::IPV6_ENABLED {
                let _ = addrs.push(IpCidr::new(IpAddress::v6(0, 0, 0, 0, 0, 0, 0, 1), 128));
            }
        });
        Self {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            table: Vec::with_capacity(config.max_descriptors),
            closing: Vec::new(),
            next_port: config.ephemeral_port_start,
            config,
        }
    }

    /// 驱动协议栈直到没有状态变化（或达到轮数上限），并回收已完成关闭的套接字。
    pub(super) fn pump(&mut self) {
        for _ in 0..PUMP_ROUNDS {
            let result = self
                .iface
                .poll(Instant::now(), &mut self.device, &mut self.sockets);
            if matches!(result, PollResult::None) {
                break;
            }
        }
        let sockets = &mut self.sockets;
        self.closing.retain(|handle| {
            let state = sockets.get::<tcp::Socket>(*handle).state();
            let done = matches!(state, tcp::State::Closed | tcp::State::TimeWait);
            if done {
                sockets.remove(*handle);
            }
            !done
        });
    }

    /// 当前占用的描述符数量。
    pub(super) fn open_descriptors(&self) -> usize {
        self.table.iter().flatten().count()
    }

    fn has_free_slot(&self) -> bool {
        self.table.iter().any(Option::is_none) || self.table.len() < self.config.max_descriptors
    }

    fn insert(&mut self, entry: Entry, op: OperationKind) -> Result<Descriptor, SocketError> {
        let index = match self.table.iter().position(Option::is_none) {
            Some(index) => index,
            None if self.table.len() < self.config.max_descriptors => {
                self.table.push(None);
                self.table.len() - 1
            }
            None => return Err(SocketError::Exhausted { op }),
        };
        let fd = Descriptor::try_from(index).map_err(|_| SocketError::Exhausted { op })?;
        self.table[index] = Some(entry);
        Ok(fd)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.table
            .iter()
            .flatten()
            .any(|entry| entry.owned_port == Some(port))
    }

    fn ephemeral_port(&mut self, op: OperationKind) -> Result<u16, SocketError> {
        let start = self.config.ephemeral_port_start;
        let span = u32::from(u16::MAX - start) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX { start } else { port + 1 };
            if !self.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(SocketError::Exhausted { op })
    }

    pub(super) fn open(
        &mut self,
        family: AddressFamily,
        protocol: Protocol,
    ) -> Result<Descriptor, SocketError> {
        if !self.has_free_slot() {
            return Err(SocketError::Exhausted { op: error::OPEN });
        }
        let kind = match protocol {
            Protocol::Udp => Kind::Udp(UdpEntry {
                handle: self.sockets.add(new_udp_socket(&self.config)),
                remote: None,
            }),
            _ => Kind::Tcp(TcpEntry {
                handle: self.sockets.add(new_tcp_socket(&self.config)),
                bound: None,
                pool: None,
                active: false,
                read_shutdown: false,
            }),
        };
        let fd = self.insert(
            Entry {
                family,
                owned_port: None,
                reuse_address: false,
                kind,
            },
            error::OPEN,
        )?;
        debug!(backend = NAME, fd, ?family, ?protocol, "descriptor allocated");
        Ok(fd)
    }

    fn listen_endpoint(
        &self,
        addr: &SocketAddress,
        port: u16,
    ) -> Result<IpListenEndpoint, SocketError> {
        if addr.is_wildcard() {
            return Ok(IpListenEndpoint { addr: None, port });
        }
        let ip = to_ip(addr);
        if !self.iface.has_ip_addr(ip) {
            return Err(io_error(error::BIND, io::ErrorKind::AddrNotAvailable));
        }
        Ok(IpListenEndpoint {
            addr: Some(ip),
            port,
        })
    }

    pub(super) fn bind(&mut self, fd: Descriptor, addr: &SocketAddress) -> Result<(), SocketError> {
        let (family, owned_port, reuse) = {
            let entry = slot(&mut self.table, fd, error::BIND)?;
            (entry.family, entry.owned_port, entry.reuse_address)
        };
        if owned_port.is_some() {
            return Err(SocketError::invalid_state(error::BIND));
        }
        let addr = normalize(family, addr)?;
        let port = match addr.port() {
            0 => self.ephemeral_port(error::BIND)?,
            port if !reuse && self.port_in_use(port) => {
                return Err(io_error(error::BIND, io::ErrorKind::AddrInUse));
            }
            port => port,
        };
        let endpoint = self.listen_endpoint(&addr, port)?;
        let entry = slot(&mut self.table, fd, error::BIND)?;
        match &mut entry.kind {
            Kind::Tcp(tcp) => tcp.bound = Some(endpoint),
            Kind::Udp(udp) => self
                .sockets
                .get_mut::<udp::Socket>(udp.handle)
                .bind(endpoint)
                .map_err(|_| SocketError::invalid_state(error::BIND))?,
        }
        entry.owned_port = Some(port);
        Ok(())
    }

    pub(super) fn listen(&mut self, fd: Descriptor, backlog: i32) -> Result<(), SocketError> {
        let unbound = match &slot(&mut self.table, fd, error::LISTEN)?.kind {
            Kind::Tcp(tcp) => tcp.bound.is_none(),
            Kind::Udp(_) => return Err(SocketError::invalid_state(error::LISTEN)),
        };
        let fresh_port = if unbound {
            Some(self.ephemeral_port(error::LISTEN)?)
        } else {
            None
        };
        let backlog = self.config.clamp_backlog(backlog);
        let entry = slot(&mut self.table, fd, error::LISTEN)?;
        if let Some(port) = fresh_port {
            entry.owned_port = Some(port);
        }
        let Kind::Tcp(tcp) = &mut entry.kind else {
            return Err(SocketError::invalid_state(error::LISTEN));
        };
        if tcp.active {
            return Err(SocketError::invalid_state(error::LISTEN));
        }
        let endpoint = *tcp.bound.get_or_insert(IpListenEndpoint {
            addr: None,
            port: fresh_port.unwrap_or_default(),
        });
        let pool = tcp.pool.get_or_insert_with(|| ListenerPool {
            endpoint,
            backlog,
            pending: Vec::with_capacity(backlog),
        });
        pool.backlog = backlog;
        pool.refill(&mut self.sockets, &self.config)?;
        debug!(backend = NAME, fd, port = endpoint.port, backlog, "listening");
        Ok(())
    }

    /// 取出一个已完成握手的连接，返回新描述符。
    pub(super) fn accept(&mut self, fd: Descriptor) -> Result<Option<Descriptor>, SocketError> {
        self.pump();
        let free = self.has_free_slot();
        let entry = slot(&mut self.table, fd, error::ACCEPT)?;
        let family = entry.family;
        let Kind::Tcp(TcpEntry {
            pool: Some(pool), ..
        }) = &mut entry.kind
        else {
            return Err(SocketError::invalid_state(error::ACCEPT));
        };
        let sockets = &mut self.sockets;
        pool.pending.retain(|handle| {
            let closed = sockets.get::<tcp::Socket>(*handle).state() == tcp::State::Closed;
            if closed {
                sockets.remove(*handle);
            }
            !closed
        });
        let ready = pool.pending.iter().position(|handle| {
            let socket = sockets.get::<tcp::Socket>(*handle);
            socket.may_send() || socket.may_recv()
        });
        let Some(position) = ready else {
            pool.refill(sockets, &self.config)?;
            return Ok(None);
        };
        if !free {
            return Err(SocketError::Exhausted { op: error::ACCEPT });
        }
        let handle = pool.pending.swap_remove(position);
        pool.refill(sockets, &self.config)?;
        let child = self.insert(
            Entry {
                family,
                owned_port: None,
                reuse_address: false,
                kind: Kind::Tcp(TcpEntry {
                    handle,
                    bound: None,
                    pool: None,
                    active: true,
                    read_shutdown: false,
                }),
            },
            error::ACCEPT,
        )?;
        debug!(backend = NAME, listener = fd, fd = child, "connection accepted");
        Ok(Some(child))
    }

    fn ensure_udp_bound(&mut self, fd: Descriptor, op: OperationKind) -> Result<(), SocketError> {
        let needs_port = match &slot(&mut self.table, fd, op)?.kind {
            Kind::Udp(udp) => !self.sockets.get::<udp::Socket>(udp.handle).is_open(),
            Kind::Tcp(_) => return Err(SocketError::invalid_state(op)),
        };
        if !needs_port {
            return Ok(());
        }
        let port = self.ephemeral_port(op)?;
        let entry = slot(&mut self.table, fd, op)?;
        if let Kind::Udp(udp) = &entry.kind {
            self.sockets
                .get_mut::<udp::Socket>(udp.handle)
                .bind(port)
                .map_err(|_| SocketError::invalid_state(op))?;
        }
        entry.owned_port = Some(port);
        Ok(())
    }

    pub(super) fn connect(
        &mut self,
        fd: Descriptor,
        addr: &SocketAddress,
    ) -> Result<ConnectOutcome, SocketError> {
        let (family, is_udp, active, bound) = {
            let entry = slot(&mut self.table, fd, error::CONNECT)?;
            match &entry.kind {
                Kind::Tcp(tcp) => (entry.family, false, tcp.active, tcp.bound),
                Kind::Udp(_) => (entry.family, true, false, None),
            }
        };
        let addr = normalize(family, addr)?;
        if addr.is_wildcard() || addr.port() == 0 {
            return Err(SocketError::InvalidAddress {
                text: addr.to_string(),
            });
        }
        let remote = to_endpoint(&addr);

        if is_udp {
            self.ensure_udp_bound(fd, error::CONNECT)?;
            if let Kind::Udp(udp) = &mut slot(&mut self.table, fd, error::CONNECT)?.kind {
                udp.remote = Some(remote);
            }
            return Ok(ConnectOutcome::Connected);
        }

        if active {
            self.pump();
            return self.tcp_state(fd, error::CONNECT).and_then(tcp_connect_outcome);
        }
        let local = match bound {
            Some(endpoint) => endpoint,
            None => IpListenEndpoint::from(self.ephemeral_port(error::CONNECT)?),
        };
        let entry = slot(&mut self.table, fd, error::CONNECT)?;
        let Kind::Tcp(tcp) = &mut entry.kind else {
            return Err(SocketError::invalid_state(error::CONNECT));
        };
        if tcp.pool.is_some() {
            return Err(SocketError::invalid_state(error::CONNECT));
        }
        self.sockets
            .get_mut::<tcp::Socket>(tcp.handle)
            .connect(self.iface.context(), remote, local)
            .map_err(|err| match err {
                tcp::ConnectError::InvalidState => SocketError::invalid_state(error::CONNECT),
                tcp::ConnectError::Unaddressable => {
                    io_error(error::CONNECT, io::ErrorKind::AddrNotAvailable)
                }
            })?;
        tcp.active = true;
        entry.owned_port = Some(local.port);
        self.pump();
        self.tcp_state(fd, error::CONNECT).and_then(tcp_connect_outcome)
    }

    fn tcp_state(&mut self, fd: Descriptor, op: OperationKind) -> Result<tcp::State, SocketError> {
        match &slot(&mut self.table, fd, op)?.kind {
            Kind::Tcp(tcp) => Ok(self.sockets.get::<tcp::Socket>(tcp.handle).state()),
            Kind::Udp(_) => Err(SocketError::invalid_state(op)),
        }
    }

    pub(super) fn read(
        &mut self,
        fd: Descriptor,
        buf: &mut [u8],
    ) -> Result<ReadOutcome, SocketError> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }
        self.pump();
        let outcome = match &slot(&mut self.table, fd, error::READ)?.kind {
            Kind::Tcp(tcp) => {
                if tcp.read_shutdown {
                    return Ok(ReadOutcome::Closed);
                }
                if tcp.pool.is_some() {
                    return Err(SocketError::invalid_state(error::READ));
                }
                let socket = self.sockets.get_mut::<tcp::Socket>(tcp.handle);
                match socket.recv_slice(buf) {
                    Ok(0) => ReadOutcome::WouldBlock,
                    Ok(n) => ReadOutcome::Read(n),
                    Err(tcp::RecvError::Finished) => ReadOutcome::Closed,
                    Err(tcp::RecvError::InvalidState) => match socket.state() {
                        tcp::State::SynSent | tcp::State::SynReceived => ReadOutcome::WouldBlock,
                        tcp::State::Closed | tcp::State::TimeWait if tcp.active => {
                            return Err(io_error(error::READ, io::ErrorKind::ConnectionReset));
                        }
                        _ => return Err(SocketError::invalid_state(error::READ)),
                    },
                }
            }
            Kind::Udp(udp) => {
                let socket = self.sockets.get_mut::<udp::Socket>(udp.handle);
                match socket.recv_slice(buf) {
                    Ok((n, _)) => ReadOutcome::Read(n),
                    Err(udp::RecvError::Exhausted) => ReadOutcome::WouldBlock,
                    Err(udp::RecvError::Truncated) => {
                        return Err(io_error(error::READ, io::ErrorKind::InvalidData));
                    }
                }
            }
        };
        if matches!(outcome, ReadOutcome::Read(_)) {
            self.pump();
        }
        Ok(outcome)
    }

    pub(super) fn write(
        &mut self,
        fd: Descriptor,
        buf: &[u8],
    ) -> Result<WriteOutcome, SocketError> {
        let remote = match &slot(&mut self.table, fd, error::WRITE)?.kind {
            Kind::Tcp(_) => None,
            Kind::Udp(udp) => Some(
                udp.remote
                    .ok_or_else(|| io_error(error::WRITE, io::ErrorKind::NotConnected))?,
            ),
        };
        if let Some(remote) = remote {
            return self.send_datagram(fd, buf, remote, error::WRITE);
        }
        if buf.is_empty() {
            return Ok(WriteOutcome::Written(0));
        }
        let outcome = match &slot(&mut self.table, fd, error::WRITE)?.kind {
            Kind::Tcp(tcp) => {
                let socket = self.sockets.get_mut::<tcp::Socket>(tcp.handle);
                match socket.send_slice(buf) {
                    Ok(0) => WriteOutcome::WouldBlock,
                    Ok(n) => WriteOutcome::Written(n),
                    Err(tcp::SendError::InvalidState) => match socket.state() {
                        tcp::State::SynSent | tcp::State::SynReceived => WriteOutcome::WouldBlock,
                        _ => return Err(io_error(error::WRITE, io::ErrorKind::BrokenPipe)),
                    },
                }
            }
            Kind::Udp(_) => return Err(SocketError::invalid_state(error::WRITE)),
        };
        self.pump();
        Ok(outcome)
    }

    fn send_datagram(
        &mut self,
        fd: Descriptor,
        buf: &[u8],
        remote: IpEndpoint,
        op: OperationKind,
    ) -> Result<WriteOutcome, SocketError> {
        self.ensure_udp_bound(fd, op)?;
        let outcome = match &slot(&mut self.table, fd, op)?.kind {
            Kind::Udp(udp) => match self
                .sockets
                .get_mut::<udp::Socket>(udp.handle)
                .send_slice(buf, remote)
            {
                Ok(()) => WriteOutcome::Written(buf.len()),
                Err(udp::SendError::BufferFull) => WriteOutcome::WouldBlock,
                Err(udp::SendError::Unaddressable) => {
                    return Err(io_error(op, io::ErrorKind::AddrNotAvailable));
                }
            },
            Kind::Tcp(_) => return Err(SocketError::invalid_state(op)),
        };
        self.pump();
        Ok(outcome)
    }

    pub(super) fn recv_from(
        &mut self,
        fd: Descriptor,
        buf: &mut [u8],
    ) -> Result<RecvOutcome, SocketError> {
        self.pump();
        match &slot(&mut self.table, fd, error::RECV_FROM)?.kind {
            Kind::Udp(udp) => {
                let socket = self.sockets.get_mut::<udp::Socket>(udp.handle);
                match socket.recv_slice(buf) {
                    Ok((len, meta)) => Ok(RecvOutcome::Received {
                        len,
                        from: from_ip(meta.endpoint.addr, meta.endpoint.port),
                    }),
                    Err(udp::RecvError::Exhausted) => Ok(RecvOutcome::WouldBlock),
                    Err(udp::RecvError::Truncated) => {
                        Err(io_error(error::RECV_FROM, io::ErrorKind::InvalidData))
                    }
                }
            }
            Kind::Tcp(_) => Err(SocketError::invalid_state(error::RECV_FROM)),
        }
    }

    pub(super) fn send_to(
        &mut self,
        fd: Descriptor,
        buf: &[u8],
        addr: &SocketAddress,
    ) -> Result<WriteOutcome, SocketError> {
        let family = slot(&mut self.table, fd, error::SEND_TO)?.family;
        let addr = normalize(family, addr)?;
        self.send_datagram(fd, buf, to_endpoint(&addr), error::SEND_TO)
    }

    pub(super) fn shutdown(
        &mut self,
        fd: Descriptor,
        direction: ShutdownDirection,
    ) -> Result<(), SocketError> {
        let Kind::Tcp(tcp) = &mut slot(&mut self.table, fd, error::SHUTDOWN)?.kind else {
            return Err(SocketError::invalid_state(error::SHUTDOWN));
        };
        if matches!(direction, ShutdownDirection::Read | ShutdownDirection::Both) {
            tcp.read_shutdown = true;
        }
        if matches!(direction, ShutdownDirection::Write | ShutdownDirection::Both) {
            self.sockets.get_mut::<tcp::Socket>(tcp.handle).close();
        }
        self.pump();
        Ok(())
    }

    pub(super) fn local_addr(&mut self, fd: Descriptor) -> Result<SocketAddress, SocketError> {
        let entry = slot(&mut self.table, fd, error::LOCAL_ADDR)?;
        let family = entry.family;
        Ok(match &entry.kind {
            Kind::Tcp(tcp) => match self.sockets.get::<tcp::Socket>(tcp.handle).local_endpoint() {
                Some(endpoint) => from_ip(endpoint.addr, endpoint.port),
                None => tcp
                    .bound
                    .map(|endpoint| from_listen_endpoint(family, endpoint))
                    .unwrap_or_else(|| wildcard(family, 0)),
            },
            Kind::Udp(udp) => {
                from_listen_endpoint(family, self.sockets.get::<udp::Socket>(udp.handle).endpoint())
            }
        })
    }

    pub(super) fn peer_addr(&mut self, fd: Descriptor) -> Result<SocketAddress, SocketError> {
        let endpoint = match &slot(&mut self.table, fd, error::PEER_ADDR)?.kind {
            Kind::Tcp(tcp) => self.sockets.get::<tcp::Socket>(tcp.handle).remote_endpoint(),
            Kind::Udp(udp) => udp.remote,
        };
        endpoint
            .map(|endpoint| from_ip(endpoint.addr, endpoint.port))
            .ok_or_else(|| io_error(error::PEER_ADDR, io::ErrorKind::NotConnected))
    }

    pub(super) fn set_nodelay(&mut self, fd: Descriptor, nodelay: bool) -> Result<(), SocketError> {
        match &slot(&mut self.table, fd, error::CONFIGURE)?.kind {
            Kind::Tcp(tcp) => {
                self.sockets
                    .get_mut::<tcp::Socket>(tcp.handle)
                    .set_nagle_enabled(!nodelay);
                Ok(())
            }
            Kind::Udp(_) => Err(SocketError::invalid_state(error::CONFIGURE)),
        }
    }

    pub(super) fn set_reuse_address(
        &mut self,
        fd: Descriptor,
        reuse: bool,
    ) -> Result<(), SocketError> {
        slot(&mut self.table, fd, error::CONFIGURE)?.reuse_address = reuse;
        Ok(())
    }

    /// 释放描述符。已建立的 TCP 连接进入关闭队列，完成 FIN 交换后由 `pump` 回收。
    pub(super) fn close(&mut self, fd: Descriptor) {
        let Some(entry) = usize::try_from(fd)
            .ok()
            .and_then(|index| self.table.get_mut(index))
            .and_then(Option::take)
        else {
            return;
        };
        match entry.kind {
            Kind::Tcp(tcp) => {
                if let Some(pool) = tcp.pool {
                    for handle in pool.pending {
                        self.sockets.get_mut::<tcp::Socket>(handle).abort();
                        self.closing.push(handle);
                    }
                }
                let socket = self.sockets.get_mut::<tcp::Socket>(tcp.handle);
                socket.close();
                if socket.state() == tcp::State::Closed {
                    self.sockets.remove(tcp.handle);
                } else {
                    self.closing.push(tcp.handle);
                }
            }
            Kind::Udp(udp) => {
                self.sockets.get_mut::<udp::Socket>(udp.handle).close();
                self.sockets.remove(udp.handle);
            }
        }
        self.pump();
        debug!(backend = NAME, fd, "descriptor released");
    }

    fn readable(&self, fd: Descriptor) -> io::Result<bool> {
        let entry = usize::try_from(fd)
            .ok()
            .and_then(|index| self.table.get(index))
            .and_then(Option::as_ref)
            .ok_or_else(|| io::Error::from_raw_os_error(libc_ebadf()))?;
        Ok(match &entry.kind {
            Kind::Tcp(TcpEntry {
                pool: Some(pool), ..
            }) => pool.has_established(&self.sockets),
            Kind::Tcp(tcp) => {
                let socket = self.sockets.get::<tcp::Socket>(tcp.handle);
                tcp.read_shutdown
                    || socket.can_recv()
                    || (tcp.active
                        && matches!(
                            socket.state(),
                            tcp::State::CloseWait
                                | tcp::State::LastAck
                                | tcp::State::Closing
                                | tcp::State::TimeWait
                                | tcp::State::Closed
                        ))
            }
            Kind::Udp(udp) => self.sockets.get::<udp::Socket>(udp.handle).can_recv(),
        })
    }

    /// 多路查询：先驱动协议栈，再逐个判定可读；全部不可读且允许等待时，
    /// 休眠到协议栈下一个定时器或超时为止，再判定一次。
    pub(super) fn select(
        &mut self,
        descriptors: &[Descriptor],
        readable: &mut [bool],
        timeout: Duration,
    ) -> io::Result<()> {
        self.pump();
        let mut any = self.mark(descriptors, readable)?;
        if !any && !timeout.is_zero() {
            let delay = self
                .iface
                .poll_delay(Instant::now(), &self.sockets)
                .map(Duration::from)
                .unwrap_or(timeout)
                .min(timeout);
            std::thread::sleep(delay);
            self.pump();
            any = self.mark(descriptors, readable)?;
        }
        if any {
            tracing::trace!(backend = NAME, "select found readable descriptors");
        }
        Ok(())
    }

    fn mark(&self, descriptors: &[Descriptor], readable: &mut [bool]) -> io::Result<bool> {
        let mut any = false;
        for (fd, slot) in descriptors.iter().zip(readable.iter_mut()) {
            *slot = self.readable(*fd)?;
            any |= *slot;
        }
        Ok(any)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let open = self.open_descriptors();
        if open > 0 {
            warn!(backend = NAME, open, "stack dropped with descriptors still open");
        }
    }
}

/// `EBADF`：与 BSD `select` 对无效描述符的报告保持一致。
fn libc_ebadf() -> i32 {
    #[cfg(unix)]
    {
        nix::errno::Errno::EBADF as i32
    }
    #[cfg(not(unix))]
    {
        9
    }
}
