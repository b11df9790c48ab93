//! 内存回环 TCP 引擎，供宿主机与测试驱动回调式后端。
//!
//! 连接在 `connect` 调用时即在两个控制块之间建立，但 `Accepted`/`Connected` 等事件
//! 只在 [`TcpEngine::service`] 中投递，行为上与真实引擎“先返回、后回调”的时序一致。
//! 发送方的在途字节在接收方 `recved` 之前不会释放，发送缓冲满时 `write` 返回 0。

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use bytes::Bytes;
use tracing::trace;

use super::engine::{ConnectionToken, EngineError, EngineEvent, EventHandler, TcpEngine};
use crate::config::SocketConfig;

/// Nagle 算法生效时，小于该长度的数据在有在途字节时被暂缓发送。
const MSS: usize = 536;

#[derive(Debug)]
enum PcbState {
    Fresh,
    Bound,
    Listen {
        backlog: usize,
        /// 已建立但 `Accepted` 尚未投递的子连接。
        pending: Vec<ConnectionToken>,
    },
    Established,
}

#[derive(Debug)]
struct Pcb {
    state: PcbState,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    peer_pcb: Option<ConnectionToken>,
    listener: Option<ConnectionToken>,
    unsent: Vec<u8>,
    in_flight: usize,
    nagle: bool,
    write_closed: bool,
    read_closed: bool,
}

impl Pcb {
    fn new() -> Self {
        Self {
            state: PcbState::Fresh,
            local: None,
            peer: None,
            peer_pcb: None,
            listener: None,
            unsent: Vec::new(),
            in_flight: 0,
            nagle: true,
            write_closed: false,
            read_closed: false,
        }
    }
}

/// 内存回环引擎。
pub struct LoopbackEngine {
    pcbs: BTreeMap<ConnectionToken, Pcb>,
    handlers: BTreeMap<ConnectionToken, EventHandler>,
    parked: BTreeMap<ConnectionToken, Vec<EngineEvent>>,
    events: VecDeque<(ConnectionToken, EngineEvent)>,
    next_token: u32,
    port_start: u16,
    next_port: u16,
    max_pcbs: usize,
    send_buffer: usize,
}

impl LoopbackEngine {
    /// `max_pcbs` 限制同时存在的控制块数，`send_buffer` 限制每个连接的在途字节。
    pub fn new(max_pcbs: usize, send_buffer: usize) -> Self {
        Self::with_ports(max_pcbs, send_buffer, SocketConfig::default().ephemeral_port_start)
    }

    pub fn from_config(config: &SocketConfig) -> Self {
        Self::with_ports(
            config.max_descriptors,
            config.send_buffer_size,
            config.ephemeral_port_start,
        )
    }

    fn with_ports(max_pcbs: usize, send_buffer: usize, port_start: u16) -> Self {
        Self {
            pcbs: BTreeMap::new(),
            handlers: BTreeMap::new(),
            parked: BTreeMap::new(),
            events: VecDeque::new(),
            next_token: 1,
            port_start,
            next_port: port_start,
            max_pcbs,
            send_buffer,
        }
    }

    /// 当前存活的控制块数量。
    pub fn pcb_count(&self) -> usize {
        self.pcbs.len()
    }

    /// 尚未投递的事件数量（不含暂存事件）。
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    fn alloc(&mut self, pcb: Pcb) -> Result<ConnectionToken, EngineError> {
        if self.pcbs.len() >= self.max_pcbs {
            return Err(EngineError::OutOfMemory);
        }
        let mut token = ConnectionToken(self.next_token);
        while self.pcbs.contains_key(&token) || token.0 == 0 {
            token = ConnectionToken(token.0.wrapping_add(1));
        }
        self.next_token = token.0.wrapping_add(1);
        self.pcbs.insert(token, pcb);
        Ok(token)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.pcbs.values().any(|pcb| {
            matches!(pcb.state, PcbState::Bound | PcbState::Listen { .. })
                && pcb.local.is_some_and(|local| local.port() == port)
        })
    }

    fn ephemeral_port(&mut self) -> Result<u16, EngineError> {
        let span = u32::from(u16::MAX - self.port_start) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                self.port_start
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Ok(port);
            }
        }
        Err(EngineError::AddrInUse)
    }

    fn find_listener(&self, addr: SocketAddr) -> Option<ConnectionToken> {
        self.pcbs.iter().find_map(|(token, pcb)| {
            let PcbState::Listen { .. } = pcb.state else {
                return None;
            };
            let local = pcb.local?;
            let ip_matches = local.ip().is_unspecified() || local.ip() == addr.ip();
            (local.port() == addr.port() && ip_matches).then_some(*token)
        })
    }

    fn refuse(&mut self, pcb: ConnectionToken) {
        if let Some(state) = self.pcbs.get_mut(&pcb) {
            state.state = PcbState::Bound;
            state.peer = None;
        }
        self.events
            .push_back((pcb, EngineEvent::Error(EngineError::ConnectionRefused)));
    }

    fn flush(&mut self, pcb: ConnectionToken, force: bool) {
        let Some(state) = self.pcbs.get_mut(&pcb) else {
            return;
        };
        if state.unsent.is_empty() {
            return;
        }
        let Some(peer) = state.peer_pcb else {
            return;
        };
        if !force && state.nagle && state.in_flight > 0 && state.unsent.len() < MSS {
            return;
        }
        let data = Bytes::from(std::mem::take(&mut state.unsent));
        state.in_flight += data.len();
        trace!(%pcb, %peer, len = data.len(), "loopback segment");
        self.events.push_back((peer, EngineEvent::Received(data)));
    }

    /// 移除控制块及其全部回调、暂存与排队事件，并断开对端链接。
    fn release(&mut self, pcb: ConnectionToken, peer_event: Option<EngineEvent>) {
        let Some(state) = self.pcbs.remove(&pcb) else {
            return;
        };
        self.handlers.remove(&pcb);
        self.parked.remove(&pcb);
        self.events.retain(|(target, _)| *target != pcb);
        if let Some(listener) = state.listener
            && let Some(Pcb {
                state: PcbState::Listen { pending, .. },
                ..
            }) = self.pcbs.get_mut(&listener)
        {
            pending.retain(|child| *child != pcb);
        }
        if let Some(peer) = state.peer_pcb
            && let Some(peer_state) = self.pcbs.get_mut(&peer)
        {
            peer_state.peer_pcb = None;
            peer_state.in_flight = 0;
            if let Some(event) = peer_event {
                self.events.push_back((peer, event));
            }
        }
        if let PcbState::Listen { pending, .. } = state.state {
            for child in pending {
                self.abort(child);
            }
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::from_config(&SocketConfig::default())
    }
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("pcbs", &self.pcbs.len())
            .field("events", &self.events.len())
            .field("max_pcbs", &self.max_pcbs)
            .finish()
    }
}

impl TcpEngine for LoopbackEngine {
    fn new_pcb(&mut self) -> Result<ConnectionToken, EngineError> {
        self.alloc(Pcb::new())
    }

    fn bind(&mut self, pcb: ConnectionToken, addr: SocketAddr) -> Result<(), EngineError> {
        match self.pcbs.get(&pcb).map(|state| &state.state) {
            Some(PcbState::Fresh) => {}
            Some(_) => return Err(EngineError::InvalidState),
            None => return Err(EngineError::NotConnected),
        }
        let port = match addr.port() {
            0 => self.ephemeral_port()?,
            port if self.port_in_use(port) => return Err(EngineError::AddrInUse),
            port => port,
        };
        if let Some(state) = self.pcbs.get_mut(&pcb) {
            state.local = Some(SocketAddr::new(addr.ip(), port));
            state.state = PcbState::Bound;
        }
        Ok(())
    }

    fn listen(&mut self, pcb: ConnectionToken, backlog: usize) -> Result<(), EngineError> {
        let fresh = match self.pcbs.get(&pcb).map(|state| &state.state) {
            Some(PcbState::Fresh) => true,
            Some(PcbState::Bound) => false,
            Some(_) => return Err(EngineError::InvalidState),
            None => return Err(EngineError::NotConnected),
        };
        if fresh {
            let port = self.ephemeral_port()?;
            if let Some(state) = self.pcbs.get_mut(&pcb) {
                state.local = Some(SocketAddr::new(IpAddr::from([0u8; 4]), port));
            }
        }
        if let Some(state) = self.pcbs.get_mut(&pcb) {
            state.state = PcbState::Listen {
                backlog: backlog.max(1),
                pending: Vec::new(),
            };
        }
        Ok(())
    }

    fn connect(&mut self, pcb: ConnectionToken, addr: SocketAddr) -> Result<(), EngineError> {
        let bound = match self.pcbs.get(&pcb) {
            Some(Pcb {
                state: PcbState::Fresh,
                ..
            }) => None,
            Some(Pcb {
                state: PcbState::Bound,
                local,
                ..
            }) => *local,
            Some(_) => return Err(EngineError::InvalidState),
            None => return Err(EngineError::NotConnected),
        };
        if addr.ip().is_unspecified() || addr.port() == 0 {
            return Err(EngineError::InvalidArgument);
        }
        let local = match bound {
            Some(local) if !local.ip().is_unspecified() => local,
            Some(local) => SocketAddr::new(addr.ip(), local.port()),
            None => SocketAddr::new(addr.ip(), self.ephemeral_port()?),
        };
        if let Some(state) = self.pcbs.get_mut(&pcb) {
            state.local = Some(local);
            state.peer = Some(addr);
            state.state = PcbState::Established;
        }

        let Some(listener) = self.find_listener(addr) else {
            self.refuse(pcb);
            return Ok(());
        };
        let backlog_full = matches!(
            self.pcbs.get(&listener).map(|state| &state.state),
            Some(PcbState::Listen { backlog, pending }) if pending.len() >= *backlog
        );
        if backlog_full {
            self.refuse(pcb);
            return Ok(());
        }
        let mut child = Pcb::new();
        child.state = PcbState::Established;
        child.local = Some(addr);
        child.peer = Some(local);
        child.peer_pcb = Some(pcb);
        child.listener = Some(listener);
        let Ok(child) = self.alloc(child) else {
            self.refuse(pcb);
            return Ok(());
        };
        if let Some(Pcb {
            state: PcbState::Listen { pending, .. },
            ..
        }) = self.pcbs.get_mut(&listener)
        {
            pending.push(child);
        }
        if let Some(state) = self.pcbs.get_mut(&pcb) {
            state.peer_pcb = Some(child);
        }
        trace!(client = %pcb, server = %child, %listener, "loopback handshake");
        self.events
            .push_back((listener, EngineEvent::Accepted(child)));
        self.events.push_back((pcb, EngineEvent::Connected));
        Ok(())
    }

    fn write(&mut self, pcb: ConnectionToken, data: &[u8]) -> Result<usize, EngineError> {
        let send_buffer = self.send_buffer;
        let state = self.pcbs.get_mut(&pcb).ok_or(EngineError::NotConnected)?;
        if !matches!(state.state, PcbState::Established) || state.write_closed {
            return Err(EngineError::InvalidState);
        }
        if state.peer_pcb.is_none() {
            return Err(EngineError::ConnectionReset);
        }
        let available = send_buffer.saturating_sub(state.unsent.len() + state.in_flight);
        let accepted = available.min(data.len());
        state.unsent.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn output(&mut self, pcb: ConnectionToken) -> Result<(), EngineError> {
        if !self.pcbs.contains_key(&pcb) {
            return Err(EngineError::NotConnected);
        }
        self.flush(pcb, false);
        Ok(())
    }

    fn recved(&mut self, pcb: ConnectionToken, len: usize) {
        let Some(peer) = self.pcbs.get(&pcb).and_then(|state| state.peer_pcb) else {
            return;
        };
        if let Some(sender) = self.pcbs.get_mut(&peer) {
            sender.in_flight = sender.in_flight.saturating_sub(len);
            self.events.push_back((peer, EngineEvent::Sent(len)));
            self.flush(peer, false);
        }
    }

    fn set_nagle(&mut self, pcb: ConnectionToken, enabled: bool) -> Result<(), EngineError> {
        let state = self.pcbs.get_mut(&pcb).ok_or(EngineError::NotConnected)?;
        state.nagle = enabled;
        if !enabled {
            self.flush(pcb, false);
        }
        Ok(())
    }

    fn shutdown(
        &mut self,
        pcb: ConnectionToken,
        read: bool,
        write: bool,
    ) -> Result<(), EngineError> {
        let state = self.pcbs.get_mut(&pcb).ok_or(EngineError::NotConnected)?;
        if !matches!(state.state, PcbState::Established) {
            return Err(EngineError::NotConnected);
        }
        state.read_closed |= read;
        if write && !state.write_closed {
            state.write_closed = true;
            let peer = state.peer_pcb;
            self.flush(pcb, true);
            if let Some(peer) = peer {
                self.events.push_back((peer, EngineEvent::PeerClosed));
            }
        }
        Ok(())
    }

    fn close(&mut self, pcb: ConnectionToken) -> Result<(), EngineError> {
        let Some(state) = self.pcbs.get(&pcb) else {
            return Err(EngineError::NotConnected);
        };
        let send_fin = matches!(state.state, PcbState::Established) && !state.write_closed;
        self.flush(pcb, true);
        self.release(pcb, send_fin.then_some(EngineEvent::PeerClosed));
        Ok(())
    }

    fn abort(&mut self, pcb: ConnectionToken) {
        self.release(
            pcb,
            Some(EngineEvent::Error(EngineError::ConnectionReset)),
        );
    }

    fn local_addr(&self, pcb: ConnectionToken) -> Option<SocketAddr> {
        self.pcbs.get(&pcb).and_then(|state| state.local)
    }

    fn peer_addr(&self, pcb: ConnectionToken) -> Option<SocketAddr> {
        self.pcbs.get(&pcb).and_then(|state| state.peer)
    }

    fn set_handler(&mut self, pcb: ConnectionToken, handler: EventHandler) {
        if !self.pcbs.contains_key(&pcb) {
            return;
        }
        self.handlers.insert(pcb, handler);
        if let Some(parked) = self.parked.remove(&pcb) {
            for event in parked.into_iter().rev() {
                self.events.push_front((pcb, event));
            }
        }
    }

    fn clear_handler(&mut self, pcb: ConnectionToken) {
        self.handlers.remove(&pcb);
    }

    fn service(engine: &Rc<RefCell<Self>>) {
        loop {
            let (pcb, event, mut handler) = {
                let mut inner = engine.borrow_mut();
                let Some((pcb, event)) = inner.events.pop_front() else {
                    break;
                };
                let Some(state) = inner.pcbs.get(&pcb) else {
                    continue;
                };
                if let (true, EngineEvent::Received(data)) = (state.read_closed, &event) {
                    let len = data.len();
                    inner.recved(pcb, len);
                    continue;
                }
                let Some(handler) = inner.handlers.remove(&pcb) else {
                    inner.parked.entry(pcb).or_default().push(event);
                    continue;
                };
                if let EngineEvent::Accepted(child) = &event {
                    if let Some(Pcb {
                        state: PcbState::Listen { pending, .. },
                        ..
                    }) = inner.pcbs.get_mut(&pcb)
                    {
                        pending.retain(|token| token != child);
                    }
                    if let Some(child_state) = inner.pcbs.get_mut(child) {
                        child_state.listener = None;
                    }
                }
                (pcb, event, handler)
            };
            handler(pcb, event);
            let mut inner = engine.borrow_mut();
            if inner.pcbs.contains_key(&pcb) && !inner.handlers.contains_key(&pcb) {
                inner.handlers.insert(pcb, handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn recorder(
        engine: &Rc<RefCell<LoopbackEngine>>,
        pcb: ConnectionToken,
    ) -> Rc<RefCell<Vec<EngineEvent>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        engine.borrow_mut().set_handler(
            pcb,
            Box::new(move |_, event| sink.borrow_mut().push(event)),
        );
        log
    }

    #[test]
    fn handshake_events_arrive_only_when_serviced() {
        let engine = Rc::new(RefCell::new(LoopbackEngine::new(8, 64)));
        let (listener, client) = {
            let mut e = engine.borrow_mut();
            let listener = e.new_pcb().unwrap();
            e.bind(listener, addr(7000)).unwrap();
            e.listen(listener, 2).unwrap();
            (listener, e.new_pcb().unwrap())
        };
        let accepted = recorder(&engine, listener);
        let connected = recorder(&engine, client);
        engine.borrow_mut().connect(client, addr(7000)).unwrap();
        assert!(accepted.borrow().is_empty());

        LoopbackEngine::service(&engine);
        assert!(matches!(accepted.borrow()[0], EngineEvent::Accepted(_)));
        assert_eq!(connected.borrow()[0], EngineEvent::Connected);
    }

    #[test]
    fn refused_without_listener() {
        let engine = Rc::new(RefCell::new(LoopbackEngine::new(4, 64)));
        let client = engine.borrow_mut().new_pcb().unwrap();
        let log = recorder(&engine, client);
        engine.borrow_mut().connect(client, addr(9)).unwrap();
        LoopbackEngine::service(&engine);
        assert_eq!(
            log.borrow().as_slice(),
            &[EngineEvent::Error(EngineError::ConnectionRefused)]
        );
    }

    #[test]
    fn events_for_unhandled_pcb_are_parked_in_order() {
        let engine = Rc::new(RefCell::new(LoopbackEngine::new(8, 64)));
        let listener = {
            let mut e = engine.borrow_mut();
            let listener = e.new_pcb().unwrap();
            e.bind(listener, addr(7001)).unwrap();
            e.listen(listener, 1).unwrap();
            listener
        };
        let accepted = recorder(&engine, listener);
        let client = engine.borrow_mut().new_pcb().unwrap();
        engine.borrow_mut().connect(client, addr(7001)).unwrap();
        engine.borrow_mut().write(client, b"ab").unwrap();
        engine.borrow_mut().output(client).unwrap();
        LoopbackEngine::service(&engine);

        let EngineEvent::Accepted(child) = accepted.borrow()[0].clone() else {
            panic!("listener should see the handshake");
        };
        let log = recorder(&engine, child);
        LoopbackEngine::service(&engine);
        assert_eq!(
            log.borrow().as_slice(),
            &[EngineEvent::Received(Bytes::from_static(b"ab"))]
        );
    }

    #[test]
    fn send_buffer_is_released_by_recved() {
        let engine = Rc::new(RefCell::new(LoopbackEngine::new(8, 4)));
        let (listener, client) = {
            let mut e = engine.borrow_mut();
            let listener = e.new_pcb().unwrap();
            e.bind(listener, addr(7002)).unwrap();
            e.listen(listener, 1).unwrap();
            let client = e.new_pcb().unwrap();
            e.set_nagle(client, false).unwrap();
            e.connect(client, addr(7002)).unwrap();
            (listener, client)
        };
        let _ = recorder(&engine, listener);
        let mut e = engine.borrow_mut();
        assert_eq!(e.write(client, b"abcdef").unwrap(), 4);
        e.output(client).unwrap();
        assert_eq!(e.write(client, b"ef").unwrap(), 0);
        let server = e.pcbs[&client].peer_pcb.unwrap();
        e.recved(server, 4);
        assert_eq!(e.write(client, b"ef").unwrap(), 2);
    }

    #[test]
    fn closing_from_inside_a_callback_is_safe() {
        let engine = Rc::new(RefCell::new(LoopbackEngine::new(8, 64)));
        let client = engine.borrow_mut().new_pcb().unwrap();
        let weak = Rc::downgrade(&engine);
        let calls = Rc::new(RefCell::new(0));
        let seen = Rc::clone(&calls);
        engine.borrow_mut().set_handler(
            client,
            Box::new(move |pcb, _| {
                *seen.borrow_mut() += 1;
                if let Some(engine) = weak.upgrade() {
                    let _ = engine.borrow_mut().close(pcb);
                }
            }),
        );
        engine.borrow_mut().connect(client, addr(1)).unwrap();
        LoopbackEngine::service(&engine);
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(engine.borrow().pcb_count(), 0);
    }

    #[test]
    fn pcb_table_exhaustion() {
        let mut engine = LoopbackEngine::new(1, 64);
        engine.new_pcb().unwrap();
        assert_eq!(engine.new_pcb(), Err(EngineError::OutOfMemory));
    }
}
