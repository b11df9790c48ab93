//! 回调式原始 TCP 后端。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 不启用类套接字层时，嵌入式协议栈只剩原始 TCP 接口：连接以控制块令牌标识，数据经回调送达。
//!   本后端把回调积累到每个连接的共享缓冲里，再以与其他后端一致的非阻塞 [`Socket`]
//!   语义对外暴露。
//!
//! ## 逻辑（How）
//! - [`LwipTcpBackend`] 以 [`TcpEngine`] 为泛型参数，默认使用内存实现 [`LoopbackEngine`]；
//! - 回调只持有共享缓冲的弱引用：`Received` 追加到接收缓冲，`Accepted` 进入定长的接受队列，
//!   队列满时直接中止新连接并记录 `warn!`；
//! - `read` 每消费一段数据即调用 `recved` 归还接收窗口；
//! - [`EngineTick`] 作为本后端的多路查询，每轮迭代投递一次待处理回调。
//!
//! ## 契约（What）
//! - 套接字没有描述符：`descriptor()` 为 `None`，不会登记到聚合器，`ready()` 恒为 `true`；
//! - 数据报、`recv_from`/`send_to` 返回 [`crate::SocketError::Unsupported`]；
//! - 关闭可以在任意时刻进行，包括引擎正在投递回调的过程中。
//!
//! [`Socket`]: crate::socket::Socket

mod engine;
mod loopback;
mod socket;

pub use engine::{ConnectionToken, EngineError, EngineEvent, EventHandler, TcpEngine};
pub use loopback::LoopbackEngine;
pub use socket::{EngineTick, LwipTcpBackend, RawTcpSocket};
