//! 套接字工厂与后端契约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 消费者只说“我要一个某地址族、某类型的套接字，是否需要主循环监控”，
//!   由工厂决定交给哪个后端，并在打开成功后立即完成就绪登记。
//! - 工厂与聚合器都以后端类型为泛型参数：`SocketFactory<B>` 只能产出 `B::Socket`，
//!   其聚合器只能运行 `B::Query`，不同后端的描述符在类型层面无法混用。
//!
//! ## 契约（What）
//! - `open(family, ty, protocol, monitored)`：地址族未编译进当前构建时返回
//!   [`SocketError::FamilyUnsupported`]；后端无法分配描述符时返回
//!   [`SocketError::Exhausted`]；`monitored = true` 时在返回前完成登记；
//! - [`SocketFactory::open_ip`] 使用 [`AddressFamily::preferred`]，即双栈构建下优先 IPv6。

use tracing::debug;

use crate::addr::AddressFamily;
use crate::error::SocketError;
use crate::readiness::{Monitor, ReadinessAggregator, ReadinessQuery, RegistryHandle};
use crate::socket::{Protocol, Socket, SocketType};

/// 一种具体网络栈。
pub trait Backend {
    /// 该后端产出的套接字类型。
    type Socket: Socket;
    /// 该后端每轮迭代执行的多路查询。
    type Query: ReadinessQuery;

    /// 后端名称，用于日志与 [`SocketError::Unsupported`]。
    const NAME: &'static str;

    /// 打开一个未登记的套接字；`monitor` 已绑定到聚合器句柄。
    fn open(
        &self,
        family: AddressFamily,
        ty: SocketType,
        protocol: Protocol,
        monitor: Monitor,
    ) -> Result<Self::Socket, SocketError>;

    /// 构造与本后端配套的多路查询。
    fn readiness_query(&self) -> Self::Query;
}

/// 套接字工厂。
#[derive(Debug)]
pub struct SocketFactory<B> {
    backend: B,
    registry: RegistryHandle,
}

impl<B: Backend> SocketFactory<B> {
    /// 绑定到已有聚合器。
    pub fn new(backend: B, aggregator: &ReadinessAggregator<B::Query>) -> Self {
        Self {
            backend,
            registry: aggregator.handle(),
        }
    }

    /// 同时构造工厂与配套聚合器，聚合器交由主循环持有。
    pub fn with_aggregator(backend: B) -> (Self, ReadinessAggregator<B::Query>) {
        let aggregator = ReadinessAggregator::new(backend.readiness_query());
        let factory = Self::new(backend, &aggregator);
        (factory, aggregator)
    }

    /// 不绑定聚合器的工厂，产出的套接字 `ready()` 恒为 `true`。
    pub fn unmonitored(backend: B) -> Self {
        Self {
            backend,
            registry: RegistryHandle::detached(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// 打开套接字。
    pub fn open(
        &self,
        family: AddressFamily,
        ty: SocketType,
        protocol: Protocol,
        monitored: bool,
    ) -> Result<B::Socket, SocketError> {
        if !family.is_compiled() {
            return Err(SocketError::FamilyUnsupported(family));
        }
        let mut socket =
            self.backend
                .open(family, ty, protocol, Monitor::new(self.registry.clone()))?;
        let registered = monitored && socket.enable_loop_monitoring();
        debug!(
            backend = B::NAME,
            fd = socket.descriptor(),
            ?family,
            ?ty,
            monitored,
            registered,
            "socket opened"
        );
        Ok(socket)
    }

    /// 以双栈偏好的地址族打开套接字。
    pub fn open_ip(
        &self,
        ty: SocketType,
        protocol: Protocol,
        monitored: bool,
    ) -> Result<B::Socket, SocketError> {
        self.open(AddressFamily::preferred(), ty, protocol, monitored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::lwip_sockets::LwipSocketsBackend;

    #[test]
    fn monitored_open_registers_before_returning() {
        let (factory, aggregator) = SocketFactory::with_aggregator(LwipSocketsBackend::new());
        let socket = factory
            .open(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp, true)
            .unwrap();
        let fd = socket.descriptor().unwrap();
        assert!(socket.is_loop_monitored());
        assert!(aggregator.is_registered(fd));

        let plain = factory
            .open(AddressFamily::Inet, SocketType::Stream, Protocol::Tcp, false)
            .unwrap();
        assert!(!plain.is_loop_monitored());
        assert_eq!(aggregator.registered(), 1);
    }

    #[test]
    fn open_ip_uses_the_preferred_family() {
        let factory = SocketFactory::unmonitored(LwipSocketsBackend::new());
        let socket = factory
            .open_ip(SocketType::Datagram, Protocol::Default, true)
            .unwrap();
        assert_eq!(socket.family(), AddressFamily::preferred());
        assert!(!socket.is_loop_monitored());
    }

    #[test]
    fn mismatched_protocol_is_rejected() {
        let factory = SocketFactory::unmonitored(LwipSocketsBackend::new());
        let error = factory
            .open(AddressFamily::Inet, SocketType::Stream, Protocol::Udp, false)
            .unwrap_err();
        assert!(matches!(error, SocketError::Unsupported { .. }));
    }

    #[cfg(not(feature = "ipv6"))]
    #[test]
    fn ipv6_is_rejected_when_not_compiled() {
        let factory = SocketFactory::unmonitored(LwipSocketsBackend::new());
        let error = factory
            .open(AddressFamily::Inet6, SocketType::Stream, Protocol::Tcp, false)
            .unwrap_err();
        assert!(matches!(
            error,
            SocketError::FamilyUnsupported(AddressFamily::Inet6)
        ));
    }
}
