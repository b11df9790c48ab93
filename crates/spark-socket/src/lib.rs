#![deny(unsafe_code)]

//! # spark-socket
//!
//! ## 教案目的（Why）
//! - **定位**：为运行在单线程协作式主循环上的组件（服务发现、Web 接口、本地 API、
//!   轮询型传感器）提供统一的套接字抽象，屏蔽其下三种差异很大的网络栈。
//! - **核心问题**：主循环每轮迭代都会询问大量套接字“是否有数据”。逐个探测意味着
//!   每轮 N 次系统调用；本 crate 把它们合并为一次多路查询，`ready()` 只读缓存。
//!
//! ## 交互契约（What）
//! - [`SocketFactory`] 按 `(地址族, 类型, 协议, 是否监控)` 打开套接字，
//!   `monitored = true` 时在返回前向 [`ReadinessAggregator`] 登记；
//! - [`Socket`] 的所有操作都是非阻塞的，暂态以 `WouldBlock`/`InProgress` 结果返回；
//! - 主循环在每轮迭代开始时调用一次 [`ReadinessAggregator::refresh`]，随后各组件的
//!   `ready()` 看到同一份快照；
//! - [`SocketAddress`] 与 [`set_sockaddr`] 把文本 IP 与端口编码为二进制 sockaddr，
//!   不做域名解析。
//!
//! ## 实现策略（How）
//! - `addr`：地址构造与解码；
//! - `socket`：后端无关的 [`Socket`] 能力集合与结果枚举；
//! - `readiness`：登记表、epoch 与聚合器；
//! - `factory`：[`Backend`] 契约与 [`SocketFactory`]；
//! - `backend`：BSD、精简协议栈、回调式 TCP 三种实现；
//! - `config` / `error`：可由 TOML 加载的容量配置与统一错误模型。
//!
//! ## 风险提示（Trade-offs）
//! - 聚合器与工厂以后端类型为泛型参数，一个主循环只服务一种后端；
//!   这是编译期选型的直接结果，而非运行时限制。
//! - 本 crate 不安装任何 `tracing` 订阅器，日志输出由宿主程序决定。

pub mod addr;
pub mod backend;
pub mod config;
pub mod error;
pub mod factory;
pub mod readiness;
pub mod socket;

pub use addr::{
    AddressFamily, IPV6_ENABLED, SOCKADDR_IN_LEN, SOCKADDR_IN6_LEN, SocketAddress,
    set_sockaddr, set_sockaddr_any,
};
pub use config::SocketConfig;
pub use error::{ErrorCategory, OperationKind, SocketError};
pub use factory::{Backend, SocketFactory};
pub use readiness::{
    IterationReport, Monitor, Phase, ReadinessAggregator, ReadinessQuery, Registration,
    RegistryHandle,
};
pub use socket::{
    AcceptOutcome, ConnectOutcome, Descriptor, Protocol, ReadOutcome, RecvOutcome,
    ShutdownDirection, Socket, SocketType, WriteOutcome,
};

/// 当前构建选定的后端。
#[cfg(all(unix, feature = "impl-bsd-sockets"))]
pub type DefaultBackend = backend::bsd::BsdBackend;

/// 当前构建选定的后端。
#[cfg(all(
    feature = "impl-lwip-sockets",
    not(all(unix, feature = "impl-bsd-sockets"))
))]
pub type DefaultBackend = backend::lwip_sockets::LwipSocketsBackend;

/// 当前构建选定的后端。
#[cfg(all(
    feature = "impl-lwip-tcp",
    not(feature = "impl-lwip-sockets"),
    not(all(unix, feature = "impl-bsd-sockets"))
))]
pub type DefaultBackend = backend::lwip_tcp::LwipTcpBackend;
