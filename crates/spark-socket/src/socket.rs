//! 套接字能力集合。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 上层协议（服务发现、Web 接口、轮询器）只依赖 [`Socket`] 这一组能力，不感知其下
//!   是 BSD 套接字、嵌入式协议栈还是回调式 TCP 引擎。
//! - 所有操作都运行在单线程协作式主循环上，因而**不得阻塞**：暂时无法完成的操作以
//!   `WouldBlock` / `InProgress` 结果返回，由调用方在后续迭代中重新驱动。
//!
//! ## 逻辑（How）
//! - 每个后端提供一个实现 [`Socket`] 的具体类型；后端在编译期选定，
//!   [`crate::factory::SocketFactory`] 以泛型参数绑定，不存在运行时分派；
//! - 套接字内部持有一个 [`Monitor`]，负责与 [`crate::readiness::ReadinessAggregator`]
//!   之间的登记与注销；`ready()` 的默认实现完全委托给它。
//!
//! ## 契约（What）
//! - `close()` 可重复调用，第二次起为无操作；关闭时**先**注销就绪登记，**后**释放描述符；
//! - 关闭后的其他操作返回 [`SocketError::Closed`]；
//! - 未登记的套接字 `ready()` 恒为 `true`，由随后的 `read()` 返回 `WouldBlock` 加以区分。

use std::io::{IoSlice, IoSliceMut};

use crate::addr::SocketAddress;
use crate::error::SocketError;
use crate::readiness::Monitor;

/// 小整数描述符。
pub type Descriptor = i32;

/// 套接字类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// 传输层协议；`Default` 表示按 [`SocketType`] 推导。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Default,
    Tcp,
    Udp,
}

impl Protocol {
    /// 结合套接字类型解析出具体协议，类型与协议不匹配时返回 `None`。
    pub fn resolve(self, ty: SocketType) -> Option<Protocol> {
        match (self, ty) {
            (Protocol::Default, SocketType::Stream) | (Protocol::Tcp, SocketType::Stream) => {
                Some(Protocol::Tcp)
            }
            (Protocol::Default, SocketType::Datagram) | (Protocol::Udp, SocketType::Datagram) => {
                Some(Protocol::Udp)
            }
            _ => None,
        }
    }
}

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    Read,
    Write,
    Both,
}

impl From<ShutdownDirection> for std::net::Shutdown {
    fn from(direction: ShutdownDirection) -> Self {
        match direction {
            ShutdownDirection::Read => std::net::Shutdown::Read,
            ShutdownDirection::Write => std::net::Shutdown::Write,
            ShutdownDirection::Both => std::net::Shutdown::Both,
        }
    }
}

/// `read` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 读取了若干字节；仅当调用方缓冲区为空时才可能为 0。
    Read(usize),
    /// 当前没有数据，稍后重试。
    WouldBlock,
    /// 对端已有序关闭，不会再有数据。
    Closed,
}

/// `write` / `send_to` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
}

/// `connect` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// 握手进行中；再次调用 `connect` 以查询进度。
    InProgress,
}

/// `accept` 的结果。
#[derive(Debug)]
pub enum AcceptOutcome<S> {
    Accepted(S),
    WouldBlock,
}

impl<S> AcceptOutcome<S> {
    /// 取出已接受的套接字。
    pub fn into_socket(self) -> Option<S> {
        match self {
            AcceptOutcome::Accepted(socket) => Some(socket),
            AcceptOutcome::WouldBlock => None,
        }
    }
}

/// `recv_from` 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Received { len: usize, from: SocketAddress },
    WouldBlock,
}

/// 后端无关的套接字能力集合。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 所有方法立即返回，绝不挂起主循环；
/// - 实现者需保证 `close()` 在释放底层句柄之前调用 `self.monitor_mut().release()`，
///   并在 `Drop` 中遵循同样的顺序；
/// - `readv`/`writev` 提供逐段调用 `read`/`write` 的默认实现，后端可覆盖为真正的
///   分散/聚集 I/O。
///
/// ## 风险提示（Trade-offs）
/// - 默认的 `readv` 在某一段未读满时即停止，保证不会因后续段而阻塞，但单次调用可能
///   少于各段总容量。
pub trait Socket: Sized {
    /// 绑定本地地址。
    fn bind(&mut self, addr: &SocketAddress) -> Result<(), SocketError>;

    /// 进入监听状态；积压值会被截断到后端上限。
    fn listen(&mut self, backlog: i32) -> Result<(), SocketError>;

    /// 接受一个入站连接；新套接字默认不登记就绪监控。
    fn accept(&mut self) -> Result<AcceptOutcome<Self>, SocketError>;

    /// 接受入站连接，并像工厂一样立即为其登记就绪监控。
    fn accept_loop_monitored(&mut self) -> Result<AcceptOutcome<Self>, SocketError> {
        match self.accept()? {
            AcceptOutcome::Accepted(mut socket) => {
                socket.enable_loop_monitoring();
                Ok(AcceptOutcome::Accepted(socket))
            }
            AcceptOutcome::WouldBlock => Ok(AcceptOutcome::WouldBlock),
        }
    }

    /// 发起或推进连接。
    fn connect(&mut self, addr: &SocketAddress) -> Result<ConnectOutcome, SocketError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SocketError>;

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<ReadOutcome, SocketError> {
        let mut total = 0;
        for buf in bufs.iter_mut().filter(|buf| !buf.is_empty()) {
            let capacity = buf.len();
            match self.read(buf)? {
                ReadOutcome::Read(n) => {
                    total += n;
                    if n < capacity {
                        break;
                    }
                }
                ReadOutcome::WouldBlock if total == 0 => return Ok(ReadOutcome::WouldBlock),
                ReadOutcome::Closed if total == 0 => return Ok(ReadOutcome::Closed),
                ReadOutcome::WouldBlock | ReadOutcome::Closed => break,
            }
        }
        Ok(ReadOutcome::Read(total))
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, SocketError>;

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> Result<WriteOutcome, SocketError> {
        let mut total = 0;
        for buf in bufs.iter().filter(|buf| !buf.is_empty()) {
            match self.write(buf)? {
                WriteOutcome::Written(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                WriteOutcome::WouldBlock if total == 0 => return Ok(WriteOutcome::WouldBlock),
                WriteOutcome::WouldBlock => break,
            }
        }
        Ok(WriteOutcome::Written(total))
    }

    /// 接收一个数据报及其来源地址。
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, SocketError>;

    /// 向指定地址发送一个数据报。
    fn send_to(&mut self, buf: &[u8], addr: &SocketAddress)
    -> Result<WriteOutcome, SocketError>;

    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<(), SocketError>;

    fn local_addr(&self) -> Result<SocketAddress, SocketError>;

    fn peer_addr(&self) -> Result<SocketAddress, SocketError>;

    /// 本端 IP 的文本形式（`getsockname`）。
    fn local_ip(&self) -> Result<String, SocketError> {
        Ok(self.local_addr()?.ip_text())
    }

    /// 对端 IP 的文本形式（`getpeername`）。
    fn peer_ip(&self) -> Result<String, SocketError> {
        Ok(self.peer_addr()?.ip_text())
    }

    /// 开关 Nagle 算法；`true` 表示禁用合并、立即发送。
    fn set_nodelay(&mut self, nodelay: bool) -> Result<(), SocketError>;

    fn set_reuse_address(&mut self, reuse: bool) -> Result<(), SocketError>;

    /// 关闭套接字；重复调用为无操作。
    fn close(&mut self) -> Result<(), SocketError>;

    /// 小整数描述符；回调式后端没有描述符，返回 `None`。
    fn descriptor(&self) -> Option<Descriptor>;

    fn monitor(&self) -> &Monitor;

    fn monitor_mut(&mut self) -> &mut Monitor;

    /// 是否已向聚合器登记。
    fn is_loop_monitored(&self) -> bool {
        self.monitor().is_registered()
    }

    /// 向聚合器登记当前描述符，返回是否登记成功。
    ///
    /// 没有描述符、已关闭或聚合器已销毁时返回 `false`，套接字保持“恒就绪”路径。
    fn enable_loop_monitoring(&mut self) -> bool {
        match self.descriptor() {
            Some(fd) => self.monitor_mut().register(fd),
            None => false,
        }
    }

    /// 是否可能有数据可读。
    ///
    /// 已登记的套接字返回聚合器本轮迭代缓存的结果，不发起任何系统调用；
    /// 其余情况保守地返回 `true`。
    fn ready(&self) -> bool {
        self.monitor().ready()
    }
}
