use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use super::engine::{ConnectionToken, EngineError, EngineEvent, EventHandler, TcpEngine};
use super::loopback::LoopbackEngine;
use crate::addr::{AddressFamily, SocketAddress};
use crate::config::SocketConfig;
use crate::error::{self, OperationKind, SocketError};
use crate::factory::Backend;
use crate::readiness::{Monitor, ReadinessQuery};
use crate::socket::{
    AcceptOutcome, ConnectOutcome, Descriptor, Protocol, ReadOutcome, RecvOutcome,
    ShutdownDirection, Socket, SocketType, WriteOutcome,
};

const BACKEND: &str = "lwip_tcp";

fn engine_error(op: OperationKind, error: EngineError) -> SocketError {
    match error {
        EngineError::OutOfMemory => SocketError::Exhausted { op },
        EngineError::InvalidState => SocketError::invalid_state(op),
        other => SocketError::from_kind(op, other.kind()),
    }
}

/// 回调与套接字共享的连接状态。
#[derive(Debug)]
struct PcbShared {
    rx: BytesMut,
    accept_queue: VecDeque<(ConnectionToken, Rc<RefCell<PcbShared>>)>,
    accept_capacity: usize,
    connected: bool,
    peer_closed: bool,
    read_shutdown: bool,
    error: Option<EngineError>,
}

impl PcbShared {
    fn new(accept_capacity: usize) -> Self {
        Self {
            rx: BytesMut::new(),
            accept_queue: VecDeque::new(),
            accept_capacity,
            connected: false,
            peer_closed: false,
            read_shutdown: false,
            error: None,
        }
    }
}

/// 构造某个 pcb 的回调；只持有弱引用，套接字释放后回调自动失效。
fn connection_handler<E: TcpEngine + 'static>(
    shared: Weak<RefCell<PcbShared>>,
    engine: Weak<RefCell<E>>,
) -> EventHandler {
    Box::new(move |pcb, event| {
        let Some(state) = shared.upgrade() else {
            return;
        };
        match event {
            EngineEvent::Accepted(child) => {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                let capacity = {
                    let state = state.borrow();
                    (state.accept_queue.len() < state.accept_capacity)
                        .then_some(state.accept_capacity)
                };
                let Some(capacity) = capacity else {
                    warn!(
                        backend = BACKEND,
                        listener = %pcb,
                        %child,
                        "accept queue full; aborting connection"
                    );
                    engine.borrow_mut().abort(child);
                    return;
                };
                let mut child_state = PcbShared::new(capacity);
                child_state.connected = true;
                let child_state = Rc::new(RefCell::new(child_state));
                engine.borrow_mut().set_handler(
                    child,
                    connection_handler(Rc::downgrade(&child_state), Rc::downgrade(&engine)),
                );
                state.borrow_mut().accept_queue.push_back((child, child_state));
            }
            EngineEvent::Connected => state.borrow_mut().connected = true,
            EngineEvent::Received(data) => state.borrow_mut().rx.extend_from_slice(&data),
            EngineEvent::PeerClosed => state.borrow_mut().peer_closed = true,
            EngineEvent::Sent(_) => {}
            EngineEvent::Error(error) => {
                let mut state = state.borrow_mut();
                state.connected = false;
                state.error = Some(error);
            }
        }
    })
}

/// 回调式原始 TCP 后端。
pub struct LwipTcpBackend<E = LoopbackEngine> {
    engine: Rc<RefCell<E>>,
    config: Rc<SocketConfig>,
}

impl LwipTcpBackend<LoopbackEngine> {
    /// 以内存回环引擎构造。
    pub fn loopback(config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        let engine = LoopbackEngine::from_config(&config);
        Ok(Self {
            engine: Rc::new(RefCell::new(engine)),
            config: Rc::new(config),
        })
    }
}

impl<E: TcpEngine + 'static> LwipTcpBackend<E> {
    pub fn new(engine: E, config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;
        Ok(Self {
            engine: Rc::new(RefCell::new(engine)),
            config: Rc::new(config),
        })
    }

    /// 共享引擎句柄。
    pub fn engine(&self) -> &Rc<RefCell<E>> {
        &self.engine
    }

    /// 手动投递一次待处理回调。
    pub fn service(&self) {
        E::service(&self.engine);
    }
}

impl Default for LwipTcpBackend<LoopbackEngine> {
    fn default() -> Self {
        let config = SocketConfig::default();
        Self {
            engine: Rc::new(RefCell::new(LoopbackEngine::from_config(&config))),
            config: Rc::new(config),
        }
    }
}

impl<E> Clone for LwipTcpBackend<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Rc::clone(&self.engine),
            config: Rc::clone(&self.config),
        }
    }
}

impl<E> fmt::Debug for LwipTcpBackend<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LwipTcpBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: TcpEngine + 'static> Backend for LwipTcpBackend<E> {
    type Socket = RawTcpSocket<E>;
    type Query = EngineTick<E>;

    const NAME: &'static str = BACKEND;

    fn open(
        &self,
        family: AddressFamily,
        ty: SocketType,
        protocol: Protocol,
        monitor: Monitor,
    ) -> Result<RawTcpSocket<E>, SocketError> {
        if ty != SocketType::Stream || protocol.resolve(ty) != Some(Protocol::Tcp) {
            return Err(SocketError::unsupported(error::OPEN, Self::NAME));
        }
        let pcb = self
            .engine
            .borrow_mut()
            .new_pcb()
            .map_err(|error| engine_error(error::OPEN, error))?;
        let shared = Rc::new(RefCell::new(PcbShared::new(
            self.config.accept_queue_capacity,
        )));
        self.engine.borrow_mut().set_handler(
            pcb,
            connection_handler(Rc::downgrade(&shared), Rc::downgrade(&self.engine)),
        );
        Ok(RawTcpSocket {
            monitor,
            engine: Rc::clone(&self.engine),
            pcb: Some(pcb),
            shared,
            family,
            connect_started: false,
            listening: false,
            config: Rc::clone(&self.config),
        })
    }

    fn readiness_query(&self) -> EngineTick<E> {
        EngineTick {
            engine: Rc::clone(&self.engine),
        }
    }
}

/// 原始 TCP 引擎上的流套接字。
///
/// 没有描述符，因此永远不会登记到聚合器，`ready()` 恒为 `true`；
/// 所有状态由回调写入共享缓冲，读写只消费缓冲。
pub struct RawTcpSocket<E: TcpEngine + 'static = LoopbackEngine> {
    monitor: Monitor,
    engine: Rc<RefCell<E>>,
    pcb: Option<ConnectionToken>,
    shared: Rc<RefCell<PcbShared>>,
    family: AddressFamily,
    connect_started: bool,
    listening: bool,
    config: Rc<SocketConfig>,
}

impl<E: TcpEngine + 'static> RawTcpSocket<E> {
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// 引擎分配的连接令牌；关闭后为 `None`。
    pub fn token(&self) -> Option<ConnectionToken> {
        self.pcb
    }

    /// 已被引擎接受、尚未 `accept` 取走的连接数。
    pub fn pending_accepts(&self) -> usize {
        self.shared.borrow().accept_queue.len()
    }

    fn pcb(&self, op: OperationKind) -> Result<ConnectionToken, SocketError> {
        self.pcb.ok_or_else(|| SocketError::closed(op))
    }

    fn adapt(&self, addr: &SocketAddress) -> Result<SocketAddr, SocketError> {
        let adapted = addr
            .to_family(self.family)
            .ok_or_else(|| SocketError::InvalidAddress {
                text: addr.to_string(),
            })?;
        Ok(SocketAddr::from(adapted.unmapped()))
    }

    fn typed(&self, addr: SocketAddr) -> SocketAddress {
        let addr = SocketAddress::from(addr);
        addr.to_family(self.family).unwrap_or(addr)
    }

    fn sticky_error(&self, op: OperationKind) -> Result<(), SocketError> {
        match self.shared.borrow().error {
            Some(error) => Err(engine_error(op, error)),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        self.monitor.release();
        let Some(pcb) = self.pcb.take() else {
            return;
        };
        let queued: Vec<ConnectionToken> = self
            .shared
            .borrow_mut()
            .accept_queue
            .drain(..)
            .map(|(child, _)| child)
            .collect();
        let mut engine = self.engine.borrow_mut();
        engine.clear_handler(pcb);
        for child in queued {
            engine.abort(child);
        }
        if engine.close(pcb).is_err() {
            engine.abort(pcb);
        }
        debug!(backend = BACKEND, %pcb, "socket closed");
    }
}

impl<E: TcpEngine + 'static> fmt::Debug for RawTcpSocket<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTcpSocket")
            .field("pcb", &self.pcb)
            .field("family", &self.family)
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

impl<E: TcpEngine + 'static> Socket for RawTcpSocket<E> {
    fn bind(&mut self, addr: &SocketAddress) -> Result<(), SocketError> {
        let pcb = self.pcb(error::BIND)?;
        let addr = self.adapt(addr)?;
        self.engine
            .borrow_mut()
            .bind(pcb, addr)
            .map_err(|error| engine_error(error::BIND, error))
    }

    fn listen(&mut self, backlog: i32) -> Result<(), SocketError> {
        let pcb = self.pcb(error::LISTEN)?;
        let backlog = self.config.clamp_backlog(backlog);
        self.engine
            .borrow_mut()
            .listen(pcb, backlog)
            .map_err(|error| engine_error(error::LISTEN, error))?;
        self.listening = true;
        Ok(())
    }

    fn accept(&mut self) -> Result<AcceptOutcome<Self>, SocketError> {
        self.pcb(error::ACCEPT)?;
        if !self.listening {
            return Err(SocketError::invalid_state(error::ACCEPT));
        }
        E::service(&self.engine);
        let next = self.shared.borrow_mut().accept_queue.pop_front();
        Ok(match next {
            Some((child, shared)) => AcceptOutcome::Accepted(RawTcpSocket {
                monitor: Monitor::new(self.monitor.handle()),
                engine: Rc::clone(&self.engine),
                pcb: Some(child),
                shared,
                family: self.family,
                connect_started: true,
                listening: false,
                config: Rc::clone(&self.config),
            }),
            None => AcceptOutcome::WouldBlock,
        })
    }

    fn connect(&mut self, addr: &SocketAddress) -> Result<ConnectOutcome, SocketError> {
        let pcb = self.pcb(error::CONNECT)?;
        if !self.connect_started {
            let addr = self.adapt(addr)?;
            self.engine
                .borrow_mut()
                .connect(pcb, addr)
                .map_err(|error| engine_error(error::CONNECT, error))?;
            self.connect_started = true;
        }
        E::service(&self.engine);
        self.sticky_error(error::CONNECT)?;
        Ok(if self.shared.borrow().connected {
            ConnectOutcome::Connected
        } else {
            ConnectOutcome::InProgress
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, SocketError> {
        let pcb = self.pcb(error::READ)?;
        E::service(&self.engine);
        let consumed = {
            let mut shared = self.shared.borrow_mut();
            if shared.rx.is_empty() {
                if let Some(error) = shared.error {
                    return Err(engine_error(error::READ, error));
                }
                if shared.peer_closed || shared.read_shutdown {
                    return Ok(ReadOutcome::Closed);
                }
                return Ok(if buf.is_empty() {
                    ReadOutcome::Read(0)
                } else {
                    ReadOutcome::WouldBlock
                });
            }
            let n = buf.len().min(shared.rx.len());
            shared.rx.copy_to_slice(&mut buf[..n]);
            n
        };
        if consumed > 0 {
            self.engine.borrow_mut().recved(pcb, consumed);
        }
        Ok(ReadOutcome::Read(consumed))
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, SocketError> {
        let pcb = self.pcb(error::WRITE)?;
        E::service(&self.engine);
        self.sticky_error(error::WRITE)?;
        if !self.shared.borrow().connected {
            // 握手尚未完成时与非阻塞连接中的套接字一致，报告暂不可写。
            if self.connect_started {
                return Ok(WriteOutcome::WouldBlock);
            }
            return Err(SocketError::invalid_state(error::WRITE));
        }
        if buf.is_empty() {
            return Ok(WriteOutcome::Written(0));
        }
        let mut engine = self.engine.borrow_mut();
        let accepted = engine
            .write(pcb, buf)
            .map_err(|error| engine_error(error::WRITE, error))?;
        if accepted == 0 {
            return Ok(WriteOutcome::WouldBlock);
        }
        engine
            .output(pcb)
            .map_err(|error| engine_error(error::WRITE, error))?;
        Ok(WriteOutcome::Written(accepted))
    }

    fn recv_from(&mut self, _buf: &mut [u8]) -> Result<RecvOutcome, SocketError> {
        self.pcb(error::RECV_FROM)?;
        Err(SocketError::unsupported(error::RECV_FROM, BACKEND))
    }

    fn send_to(&mut self, _buf: &[u8], _addr: &SocketAddress) -> Result<WriteOutcome, SocketError> {
        self.pcb(error::SEND_TO)?;
        Err(SocketError::unsupported(error::SEND_TO, BACKEND))
    }

    fn shutdown(&mut self, direction: ShutdownDirection) -> Result<(), SocketError> {
        let pcb = self.pcb(error::SHUTDOWN)?;
        let (read, write) = match direction {
            ShutdownDirection::Read => (true, false),
            ShutdownDirection::Write => (false, true),
            ShutdownDirection::Both => (true, true),
        };
        self.engine
            .borrow_mut()
            .shutdown(pcb, read, write)
            .map_err(|error| engine_error(error::SHUTDOWN, error))?;
        if read {
            let discarded = {
                let mut shared = self.shared.borrow_mut();
                shared.read_shutdown = true;
                let len = shared.rx.len();
                shared.rx.clear();
                len
            };
            if discarded > 0 {
                self.engine.borrow_mut().recved(pcb, discarded);
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddress, SocketError> {
        let pcb = self.pcb(error::LOCAL_ADDR)?;
        let local = self.engine.borrow().local_addr(pcb);
        local
            .map(|addr| self.typed(addr))
            .ok_or_else(|| SocketError::invalid_state(error::LOCAL_ADDR))
    }

    fn peer_addr(&self) -> Result<SocketAddress, SocketError> {
        let pcb = self.pcb(error::PEER_ADDR)?;
        let peer = self.engine.borrow().peer_addr(pcb);
        peer.map(|addr| self.typed(addr))
            .ok_or_else(|| SocketError::from_kind(error::PEER_ADDR, io::ErrorKind::NotConnected))
    }

    fn set_nodelay(&mut self, nodelay: bool) -> Result<(), SocketError> {
        let pcb = self.pcb(error::CONFIGURE)?;
        self.engine
            .borrow_mut()
            .set_nagle(pcb, !nodelay)
            .map_err(|error| engine_error(error::CONFIGURE, error))
    }

    fn set_reuse_address(&mut self, _reuse: bool) -> Result<(), SocketError> {
        // 控制块释放时端口立即归还，引擎没有 TIME_WAIT 占用。
        self.pcb(error::CONFIGURE).map(|_| ())
    }

    fn close(&mut self) -> Result<(), SocketError> {
        self.release();
        Ok(())
    }

    fn descriptor(&self) -> Option<Descriptor> {
        None
    }

    fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    fn monitor_mut(&mut self) -> &mut Monitor {
        &mut self.monitor
    }
}

impl<E: TcpEngine + 'static> Drop for RawTcpSocket<E> {
    fn drop(&mut self) {
        self.release();
    }
}

/// 每轮迭代投递一次引擎回调的“查询”。
///
/// 该后端的套接字不会登记描述符；若仍收到描述符，一律报告为可读。
pub struct EngineTick<E> {
    engine: Rc<RefCell<E>>,
}

impl<E> fmt::Debug for EngineTick<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTick").finish_non_exhaustive()
    }
}

impl<E: TcpEngine + 'static> ReadinessQuery for EngineTick<E> {
    fn query(
        &mut self,
        _descriptors: &[Descriptor],
        readable: &mut [bool],
        _timeout: Duration,
    ) -> io::Result<()> {
        E::service(&self.engine);
        readable.fill(true);
        Ok(())
    }
}
