//! 精简协议栈后端：嵌入式 IP 协议栈提供的类套接字接口。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 资源受限设备上的轻量协议栈自带一张小型描述符表与 `select`，但不具备完整 POSIX
//!   语义。本后端以进程内 `smoltcp` 协议栈（回环设备）扮演该角色，使契约可以在宿主机上
//!   完整验证。
//!
//! ## 逻辑（How）
//! - [`LwipSocketsBackend`] 持有共享协议栈；每个 [`LwipSocket`] 只记录自己的描述符，
//!   所有状态都留在协议栈的描述符表中；
//! - `listen` 以一组监听套接字模拟积压队列，`accept` 取出其中已完成握手的一个并补齐；
//! - [`SelectQuery`] 每轮迭代驱动一次协议栈，再判定全部已登记描述符是否可读。
//!
//! ## 契约（What）
//! - 描述符表容量由 [`SocketConfig::max_descriptors`] 决定，耗尽时 `open`/`accept` 返回
//!   [`SocketError::Exhausted`]；
//! - 描述符释放后立即可被复用（最小空闲槽位优先），因此关闭时必须先注销就绪登记。

mod stack;

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::addr::{AddressFamily, SocketAddress};
use crate::config::SocketConfig;
use crate::error::{self, OperationKind, SocketError};
use crate::factory::Backend;
use crate::readiness::{Monitor, ReadinessQuery};
use crate::socket::{
    AcceptOutcome, ConnectOutcome, Descriptor, Protocol, ReadOutcome, RecvOutcome,
    ShutdownDirection, Socket, SocketType, WriteOutcome,
};

use self::stack::Stack;

/// 精简协议栈后端。
#[derive(Clone)]
pub struct LwipSocketsBackend {
    stack: Rc<RefCell<Stack>>,
}

impl LwipSocketsBackend {
    /// 使用默认配置构造协议栈。
    pub fn new() -> Self {
        Self {
            stack: Rc::new(RefCell::new(Stack::new(SocketConfig::default()))),
        }
    }

    pub fn with_config(config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        Ok(Self {
            stack: Rc::new(RefCell::new(Stack::new(config))),
        })
    }

    /// 当前占用的描述符数量。
    pub fn open_descriptors(&self) -> usize {
        self.stack.borrow().open_descriptors()
    }

    /// 手动驱动协议栈一次。
    pub fn service(&self) {
        self.stack.borrow_mut().pump();
    }
}

impl Default for LwipSocketsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LwipSocketsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LwipSocketsBackend")
            .field("open_descriptors", &self.open_descriptors())
            .finish()
    }
}

impl Backend for LwipSocketsBackend {
    type Socket = LwipSocket;
    type Query = SelectQuery;

    const NAME: &'static str = "lwip_sockets";

    fn open(
        &self,
        family: AddressFamily,
        ty: SocketType,
        protocol: Protocol,
        monitor: Monitor,
    ) -> Result<LwipSocket, SocketError> {
        let protocol = protocol
            .resolve(ty)
            .ok_or_else(|| SocketError::unsupported(error::OPEN, Self::NAME))?;
        let fd = self.stack.borrow_mut().open(family, protocol)?;
        Ok(LwipSocket {
            monitor,
            stack: Rc::clone(&self.stack),
            fd: Some(fd),
            family,
        })
    }

    fn readiness_query(&self) -> SelectQuery {
        SelectQuery {
            stack: Rc::clone(&self.stack),
        }
    }
}

/// 精简协议栈上的套接字。
pub struct LwipSocket {
    monitor: Monitor,
    stack: Rc<RefCell<Stack>>,
    fd: Option<Descriptor>,
    family: AddressFamily,
}

impl LwipSocket {
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    fn fd(&self, op: OperationKind) -> Result<Descriptor, SocketError> {
        self.fd.ok_or_else(|| SocketError::closed(op))
    }

    fn release(&mut self) {
        self.monitor.release();
        if let Some(fd) = self.fd.take() {
            self.stack.borrow_mut().close(fd);
        }
    }
}

impl std::fmt::Debug for LwipSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LwipSocket")
            .field("fd", &self.fd)
            .field("family", &self.family)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl Socket for LwipSocket {
    fn bind(&mut self, addr: &SocketAddress) -> Result<(), SocketError> {
        let fd = self.fd(error::BIND)?;
        self.stack.borrow_mut().bind(fd, addr)
    }

    fn listen(&mut self, backlog: i32) -> Result<(), SocketError> {
        let fd = self.fd(error::LISTEN)?;
        self.stack.borrow_mut().listen(fd, backlog)
    }

    fn accept(&mut self) -> Result<AcceptOutcome<Self>, SocketError> {
        let fd = self.fd(error::ACCEPT)?;
        let accepted = self.stack.borrow_mut().accept(fd)?;
        Ok(match accepted {
            Some(child) => AcceptOutcome::Accepted(LwipSocket {
                monitor: Monitor::new(self.monitor.handle()),
                stack: Rc::clone(&self.stack),
                fd: Some(child),
                family: self.family,
            }),
            None => AcceptOutcome::WouldBlock,
        })
    }

    fn connect(&mut self, addr: &SocketAddress) -> Result<ConnectOutcome, SocketError> {
        let fd = self.fd(error::CONNECT)?;
        self.stack.borrow_mut().connect(fd, addr)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SocketError> {
        let fd = self.fd(error::READ)?;
        self.stack.borrow_mut().read(fd, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, SocketError> {
        let fd = self.fd(error::WRITE)?;
        self.stack.borrow_mut().write(fd, buf)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, SocketError> {
        let fd = self.fd(error::RECV_FROM)?;
        self.stack.borrow_mut().recv_from(fd, buf)
    }

    fn send_to(&mut self, buf: &[u8], addr: &SocketAddress) -> Result<WriteOutcome, SocketError> {
        let fd = self.fd(error::SEND_TO)?;
        self.stack.borrow_mut().send_to(fd, buf, addr)
    }

    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<(), SocketError> {
        let fd = self.fd(error::SHUTDOWN)?;
        self.stack.borrow_mut().shutdown(fd, direction)
    }

    fn local_addr(&self) -> Result<SocketAddress, SocketError> {
        let fd = self.fd(error::LOCAL_ADDR)?;
        self.stack.borrow_mut().local_addr(fd)
    }

    fn peer_addr(&self) -> Result<SocketAddress, SocketError> {
        let fd = self.fd(error::PEER_ADDR)?;
        self.stack.borrow_mut().peer_addr(fd)
    }

    fn set_nodelay(&mut self, nodelay: bool) -> Result<(), SocketError> {
        let fd = self.fd(error::CONFIGURE)?;
        self.stack.borrow_mut().set_nodelay(fd, nodelay)
    }

    fn set_reuse_address(&mut self, reuse: bool) -> Result<(), SocketError> {
        let fd = self.fd(error::CONFIGURE)?;
        self.stack.borrow_mut().set_reuse_address(fd, reuse)
    }

    fn close(&mut self) -> Result<(), SocketError> {
        self.release();
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        self.fd
    }

    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }
}

impl Drop for LwipSocket {
    fn drop(&mut self) {
        self.release();
    }
}

/// 协议栈 `select` 形式的多路查询。
pub struct SelectQuery {
    stack: Rc<RefCell<Stack>>,
}

impl std::fmt::Debug for SelectQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectQuery").finish_non_exhaustive()
    }
}

impl ReadinessQuery for SelectQuery {
    fn query(
        &mut self,
        descriptors: &[Descriptor],
        readable: &mut [bool],
        timeout: Duration,
    ) -> io::Result<()> {
        self.stack
            .borrow_mut()
            .select(descriptors, readable, timeout)
    }
}
