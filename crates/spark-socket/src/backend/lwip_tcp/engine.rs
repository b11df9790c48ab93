//! 回调式原始 TCP 引擎契约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 最精简的嵌入式协议栈只提供以控制块（pcb）为单位的原始 TCP 接口：
//!   `new/bind/listen/connect/write/output/recved/close/abort`，数据与状态变化通过回调送达，
//!   没有描述符，也没有 `select`。[`TcpEngine`] 把这一形态抽象出来，套接字层只依赖该特征。
//!
//! ## 契约（What）
//! - 回调只会在 [`TcpEngine::service`] 中触发，且触发期间引擎**不处于借用状态**，
//!   回调可以安全地调用引擎的任意方法（包括关闭或中止触发回调的那个连接）；
//! - 一个 pcb 在未安装回调前收到的事件会被暂存，安装回调时按原顺序补发；
//! - `write` 只把数据拷入发送缓冲并返回接受的字节数（为 0 表示缓冲已满），
//!   `output` 才真正发送；接收方必须以 `recved` 确认已消费的字节，发送方的缓冲才会释放。

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

/// 引擎分配的连接令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionToken(pub u32);

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// 引擎错误码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineError {
    /// 控制块或缓冲分配失败。
    OutOfMemory,
    AddrInUse,
    ConnectionRefused,
    ConnectionReset,
    /// 连接被本端中止。
    Aborted,
    NotConnected,
    InvalidArgument,
    InvalidState,
}

impl EngineError {
    /// 对应的 `io::ErrorKind`。
    pub fn kind(self) -> io::ErrorKind {
        match self {
            EngineError::OutOfMemory => io::ErrorKind::OutOfMemory,
            EngineError::AddrInUse => io::ErrorKind::AddrInUse,
            EngineError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            EngineError::ConnectionReset => io::ErrorKind::ConnectionReset,
            EngineError::Aborted => io::ErrorKind::ConnectionAborted,
            EngineError::NotConnected => io::ErrorKind::NotConnected,
            EngineError::InvalidArgument => io::ErrorKind::InvalidInput,
            EngineError::InvalidState => io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for EngineError {}

/// 回调事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// 监听 pcb 上完成了一次握手，新连接的令牌随事件送达。
    Accepted(ConnectionToken),
    /// 主动连接完成。
    Connected,
    /// 收到数据。
    Received(Bytes),
    /// 对端发送了 FIN。
    PeerClosed,
    /// 对端确认了若干字节，发送缓冲随之释放。
    Sent(usize),
    /// 连接出错，之后不会再有事件。
    Error(EngineError),
}

/// 回调：`(触发事件的 pcb, 事件)`。
pub type EventHandler = Box<dyn FnMut(ConnectionToken, EngineEvent)>;

/// 原始 TCP 引擎。
pub trait TcpEngine {
    /// 分配控制块；耗尽时返回 [`EngineError::OutOfMemory`]。
    fn new_pcb(&mut self) -> Result<ConnectionToken, EngineError>;

    /// 绑定本地地址，端口为 0 时由引擎分配。
    fn bind(&mut self, pcb: ConnectionToken, addr: SocketAddr) -> Result<(), EngineError>;

    fn listen(&mut self, pcb: ConnectionToken, backlog: usize) -> Result<(), EngineError>;

    /// 发起连接；结果通过 `Connected` 或 `Error` 回调送达。
    fn connect(&mut self, pcb: ConnectionToken, addr: SocketAddr) -> Result<(), EngineError>;

    /// 拷入发送缓冲，返回接受的字节数。
    fn write(&mut self, pcb: ConnectionToken, data: &[u8]) -> Result<usize, EngineError>;

    /// 发送缓冲中尚未发出的数据。
    fn output(&mut self, pcb: ConnectionToken) -> Result<(), EngineError>;

    /// 确认应用层已消费 `len` 字节。
    fn recved(&mut self, pcb: ConnectionToken, len: usize);

    fn set_nagle(&mut self, pcb: ConnectionToken, enabled: bool) -> Result<(), EngineError>;

    fn shutdown(
        &mut self,
        pcb: ConnectionToken,
        read: bool,
        write: bool,
    ) -> Result<(), EngineError>;

    /// 优雅关闭并释放控制块。
    fn close(&mut self, pcb: ConnectionToken) -> Result<(), EngineError>;

    /// 立即释放控制块，对端收到复位。
    fn abort(&mut self, pcb: ConnectionToken);

    fn local_addr(&self, pcb: ConnectionToken) -> Option<SocketAddr>;

    fn peer_addr(&self, pcb: ConnectionToken) -> Option<SocketAddr>;

    fn set_handler(&mut self, pcb: ConnectionToken, handler: EventHandler);

    fn clear_handler(&mut self, pcb: ConnectionToken);

    /// 投递待处理回调；由主循环每轮迭代调用一次。
    ///
    /// 以共享句柄为参数，使实现能在调用回调前释放借用。
    fn service(engine: &Rc<RefCell<Self>>)
    where
        Self: Sized,
    {
        let _ = engine;
    }
}
