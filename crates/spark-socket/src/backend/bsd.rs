//! 完整协议栈后端：操作系统原生非阻塞套接字。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 在具备完整 POSIX 套接字的设备（及宿主机测试）上，以 `socket2` 打开非阻塞套接字，
//!   每轮迭代用一次 `poll(2)` 覆盖所有已登记描述符。
//!
//! ## 逻辑（How）
//! - 流式套接字直接使用 `socket2::Socket`；数据报套接字转换为 `std::net::UdpSocket`
//!   以复用标准库的 `recv_from`/`send_to`；
//! - IPv6 套接字关闭 `IPV6_V6ONLY`，传入的 IPv4 地址被转换为 IPv4-mapped 形式；
//! - `connect` 将 `EINPROGRESS`/`EALREADY`/`WouldBlock` 视为进行中，重复调用时以
//!   `EISCONN` 或 `SO_ERROR` 判断握手结果。
//!
//! ## 契约（What）
//! - 所有描述符都处于非阻塞模式，包括 `accept` 得到的子套接字；
//! - `close()` 与 `Drop` 都先注销就绪登记，再关闭描述符。

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{setsockopt, sockopt};
use socket2::{Domain, SockAddr, Type};
use tracing::debug;

use crate::addr::{AddressFamily, SocketAddress};
use crate::config::SocketConfig;
use crate::error::{self, SocketError, is_transient, map_io_error};
use crate::factory::Backend;
use crate::readiness::{Monitor, ReadinessQuery};
use crate::socket::{
    AcceptOutcome, ConnectOutcome, Descriptor, Protocol, ReadOutcome, RecvOutcome,
    ShutdownDirection, Socket, SocketType, WriteOutcome,
};

const NAME: &str = "bsd";

/// 完整协议栈后端。
#[derive(Clone, Debug, Default)]
pub struct BsdBackend {
    config: SocketConfig,
}

impl BsdBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用自定义配置；仅 `max_backlog` 对本后端生效。
    pub fn with_config(config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl Backend for BsdBackend {
    type Socket = BsdSocket;
    type Query = PollQuery;

    const NAME: &'static str = NAME;

    fn open(
        &self,
        family: AddressFamily,
        ty: SocketType,
        protocol: Protocol,
        monitor: Monitor,
    ) -> Result<BsdSocket, SocketError> {
        let protocol = protocol
            .resolve(ty)
            .ok_or_else(|| SocketError::unsupported(error::OPEN, NAME))?;
        let domain = match family {
            AddressFamily::Inet => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
        };
        let (socket_type, socket_protocol) = match protocol {
            Protocol::Udp => (Type::DGRAM, socket2::Protocol::UDP),
            _ => (Type::STREAM, socket2::Protocol::TCP),
        };
        let socket = socket2::Socket::new(domain, socket_type, Some(socket_protocol))
            .map_err(|err| map_io_error(error::OPEN, err))?;
        if family == AddressFamily::Inet6 {
            socket
                .set_only_v6(false)
                .map_err(|err| map_io_error(error::OPEN, err))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::OPEN, err))?;
        let inner = match ty {
            SocketType::Stream => Inner::Stream(socket),
            SocketType::Datagram => Inner::Datagram(UdpSocket::from(socket)),
        };
        Ok(BsdSocket {
            monitor,
            inner: Some(inner),
            family,
            max_backlog: self.config.max_backlog,
        })
    }

    fn readiness_query(&self) -> PollQuery {
        PollQuery
    }
}

#[derive(Debug)]
enum Inner {
    Stream(socket2::Socket),
    Datagram(UdpSocket),
}

impl Inner {
    fn raw_fd(&self) -> Descriptor {
        match self {
            Inner::Stream(socket) => socket.as_raw_fd(),
            Inner::Datagram(socket) => socket.as_raw_fd(),
        }
    }

    fn socket_ref(&self) -> socket2::SockRef<'_> {
        match self {
            Inner::Stream(socket) => socket2::SockRef::from(socket),
            Inner::Datagram(socket) => socket2::SockRef::from(socket),
        }
    }
}

/// 原生非阻塞套接字。
#[derive(Debug)]
pub struct BsdSocket {
    monitor: Monitor,
    inner: Option<Inner>,
    family: AddressFamily,
    max_backlog: usize,
}

impl BsdSocket {
    /// 套接字的地址族。
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    fn inner(&self, op: error::OperationKind) -> Result<&Inner, SocketError> {
        self.inner.as_ref().ok_or_else(|| SocketError::closed(op))
    }

    fn adapt(&self, addr: &SocketAddress) -> Result<SockAddr, SocketError> {
        let adapted = addr
            .to_family(self.family)
            .ok_or_else(|| SocketError::InvalidAddress {
                text: addr.to_string(),
            })?;
        Ok(SockAddr::from(SocketAddr::from(adapted)))
    }

    fn probe_connect(socket: &socket2::Socket) -> Result<ConnectOutcome, SocketError> {
        if let Some(err) = socket
            .take_error()
            .map_err(|err| map_io_error(error::CONNECT, err))?
        {
            return Err(map_io_error(error::CONNECT, err));
        }
        match socket.peer_addr() {
            Ok(_) => Ok(ConnectOutcome::Connected),
            Err(err) if err.raw_os_error() == Some(Errno::ENOTCONN as i32) => {
                Ok(ConnectOutcome::InProgress)
            }
            Err(err) => Err(map_io_error(error::CONNECT, err)),
        }
    }

    fn release(&mut self) -> Option<Inner> {
        self.monitor.release();
        self.inner.take()
    }
}

fn to_address(addr: SockAddr, op: error::OperationKind) -> Result<SocketAddress, SocketError> {
    addr.as_socket()
        .map(SocketAddress::from)
        .ok_or_else(|| SocketError::from_kind(op, io::ErrorKind::InvalidData))
}

fn read_outcome(result: io::Result<usize>, wanted: usize) -> Result<ReadOutcome, SocketError> {
    match result {
        Ok(0) if wanted > 0 => Ok(ReadOutcome::Closed),
        Ok(n) => Ok(ReadOutcome::Read(n)),
        Err(err) if is_transient(&err) => Ok(ReadOutcome::WouldBlock),
        Err(err) => Err(map_io_error(error::READ, err)),
    }
}

fn write_outcome(
    result: io::Result<usize>,
    op: error::OperationKind,
) -> Result<WriteOutcome, SocketError> {
    match result {
        Ok(n) => Ok(WriteOutcome::Written(n)),
        Err(err) if is_transient(&err) => Ok(WriteOutcome::WouldBlock),
        Err(err) => Err(map_io_error(op, err)),
    }
}

impl Socket for BsdSocket {
    fn bind(&mut self, addr: &SocketAddress) -> Result<(), SocketError> {
        let target = self.adapt(addr)?;
        self.inner(error::BIND)?
            .socket_ref()
            .bind(&target)
            .map_err(|err| map_io_error(error::BIND, err))
    }

    fn listen(&mut self, backlog: i32) -> Result<(), SocketError> {
        let cap = i32::try_from(self.max_backlog).unwrap_or(i32::MAX).max(1);
        let backlog = backlog.clamp(1, cap);
        match self.inner(error::LISTEN)? {
            Inner::Stream(socket) => socket
                .listen(backlog)
                .map_err(|err| map_io_error(error::LISTEN, err)),
            Inner::Datagram(_) => Err(SocketError::invalid_state(error::LISTEN)),
        }
    }

    fn accept(&mut self) -> Result<AcceptOutcome<Self>, SocketError> {
        let Inner::Stream(listener) = self.inner(error::ACCEPT)? else {
            return Err(SocketError::invalid_state(error::ACCEPT));
        };
        let (socket, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) if is_transient(&err) => return Ok(AcceptOutcome::WouldBlock),
            Err(err) => return Err(map_io_error(error::ACCEPT, err)),
        };
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        debug!(backend = NAME, fd = socket.as_raw_fd(), "connection accepted");
        Ok(AcceptOutcome::Accepted(BsdSocket {
            monitor: Monitor::new(self.monitor.handle()),
            inner: Some(Inner::Stream(socket)),
            family: self.family,
            max_backlog: self.max_backlog,
        }))
    }

    fn connect(&mut self, addr: &SocketAddress) -> Result<ConnectOutcome, SocketError> {
        let target = self.adapt(addr)?;
        match self.inner(error::CONNECT)? {
            Inner::Stream(socket) => match socket.connect(&target) {
                Ok(()) => Ok(ConnectOutcome::Connected),
                Err(err) => match err.raw_os_error().map(Errno::from_raw) {
                    Some(Errno::EINPROGRESS) => Ok(ConnectOutcome::InProgress),
                    Some(Errno::EALREADY) => Self::probe_connect(socket),
                    Some(Errno::EISCONN) => Ok(ConnectOutcome::Connected),
                    _ if is_transient(&err) => Ok(ConnectOutcome::InProgress),
                    _ => Err(map_io_error(error::CONNECT, err)),
                },
            },
            Inner::Datagram(socket) => {
                let target = target.as_socket().ok_or_else(|| {
                    SocketError::from_kind(error::CONNECT, io::ErrorKind::InvalidInput)
                })?;
                socket
                    .connect(target)
                    .map(|()| ConnectOutcome::Connected)
                    .map_err(|err| map_io_error(error::CONNECT, err))
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SocketError> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Read(0));
        }
        let wanted = buf.len();
        match self.inner(error::READ)? {
            Inner::Stream(socket) => {
                let mut stream = socket;
                read_outcome(stream.read(buf), wanted)
            }
            // 零长度数据报是合法报文，不代表对端关闭。
            Inner::Datagram(socket) => read_outcome(socket.recv(buf), 0),
        }
    }

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<ReadOutcome, SocketError> {
        let wanted: usize = bufs.iter().map(|buf| buf.len()).sum();
        if wanted == 0 {
            return Ok(ReadOutcome::Read(0));
        }
        match self.inner(error::READ)? {
            Inner::Stream(socket) => {
                let mut stream = socket;
                read_outcome(stream.read_vectored(bufs), wanted)
            }
            Inner::Datagram(_) => Err(SocketError::unsupported(error::READ, NAME)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, SocketError> {
        let result = match self.inner(error::WRITE)? {
            Inner::Stream(socket) => {
                let mut stream = socket;
                stream.write(buf)
            }
            Inner::Datagram(socket) => socket.send(buf),
        };
        write_outcome(result, error::WRITE)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<WriteOutcome, SocketError> {
        match self.inner(error::WRITE)? {
            Inner::Stream(socket) => {
                let mut stream = socket;
                write_outcome(stream.write_vectored(bufs), error::WRITE)
            }
            Inner::Datagram(_) => Err(SocketError::unsupported(error::WRITE, NAME)),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, SocketError> {
        let Inner::Datagram(socket) = self.inner(error::RECV_FROM)? else {
            return Err(SocketError::invalid_state(error::RECV_FROM));
        };
        match socket.recv_from(buf) {
            Ok((len, from)) => Ok(RecvOutcome::Received {
                len,
                from: SocketAddress::from(from),
            }),
            Err(err) if is_transient(&err) => Ok(RecvOutcome::WouldBlock),
            Err(err) => Err(map_io_error(error::RECV_FROM, err)),
        }
    }

    fn send_to(&mut self, buf: &[u8], addr: &SocketAddress) -> Result<WriteOutcome, SocketError> {
        let target = self.adapt(addr)?;
        let Inner::Datagram(socket) = self.inner(error::SEND_TO)? else {
            return Err(SocketError::invalid_state(error::SEND_TO));
        };
        let target = target
            .as_socket()
            .ok_or_else(|| SocketError::from_kind(error::SEND_TO, io::ErrorKind::InvalidInput))?;
        write_outcome(socket.send_to(buf, target), error::SEND_TO)
    }

    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<(), SocketError> {
        self.inner(error::SHUTDOWN)?
            .socket_ref()
            .shutdown(direction.into())
            .map_err(|err| map_io_error(error::SHUTDOWN, err))
    }

    fn local_addr(&self) -> Result<SocketAddress, SocketError> {
        let addr = self
            .inner(error::LOCAL_ADDR)?
            .socket_ref()
            .local_addr()
            .map_err(|err| map_io_error(error::LOCAL_ADDR, err))?;
        to_address(addr, error::LOCAL_ADDR)
    }

    fn peer_addr(&self) -> Result<SocketAddress, SocketError> {
        let addr = self
            .inner(error::PEER_ADDR)?
            .socket_ref()
            .peer_addr()
            .map_err(|err| map_io_error(error::PEER_ADDR, err))?;
        to_address(addr, error::PEER_ADDR)
    }

    fn set_nodelay(&mut self, nodelay: bool) -> Result<(), SocketError> {
        match self.inner(error::CONFIGURE)? {
            Inner::Stream(socket) => setsockopt(socket, sockopt::TcpNoDelay, &nodelay)
                .map_err(|errno| map_io_error(error::CONFIGURE, io::Error::from(errno))),
            Inner::Datagram(_) => Err(SocketError::invalid_state(error::CONFIGURE)),
        }
    }

    fn set_reuse_address(&mut self, reuse: bool) -> Result<(), SocketError> {
        self.inner(error::CONFIGURE)?
            .socket_ref()
            .set_reuse_address(reuse)
            .map_err(|err| map_io_error(error::CONFIGURE, err))
    }

    fn close(&mut self) -> Result<(), SocketError> {
        if let Some(inner) = self.release() {
            debug!(backend = NAME, fd = inner.raw_fd(), "socket closed");
        }
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        self.inner.as_ref().map(Inner::raw_fd)
    }

    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }
}

impl Drop for BsdSocket {
    fn drop(&mut self) {
        self.release();
    }
}

/// 基于 `poll(2)` 的多路查询。
#[derive(Clone, Copy, Debug, Default)]
pub struct PollQuery;

impl ReadinessQuery for PollQuery {
    fn query(
        &mut self,
        descriptors: &[Descriptor],
        readable: &mut [bool],
        timeout: Duration,
    ) -> io::Result<()> {
        let mut fds: Vec<PollFd<'_>> = descriptors
            .iter()
            .map(|fd| {
                // SAFETY: 登记集合中的描述符在注销之前不会被关闭（`close`/`Drop` 先注销再关闭），
                // 且本次查询在单线程内同步完成，借用期间描述符保持有效。
                #[allow(unsafe_code)]
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                PollFd::new(borrowed, PollFlags::POLLIN)
            })
            .collect();
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        loop {
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
        for (pfd, slot) in fds.iter().zip(readable.iter_mut()) {
            let revents = pfd.revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLNVAL) {
                return Err(io::Error::from(Errno::EBADF));
            }
            *slot = revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
        }
        Ok(())
    }
}
