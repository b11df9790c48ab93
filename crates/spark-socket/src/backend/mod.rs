//! 三种网络栈后端。
//!
//! - [`bsd`]：操作系统原生非阻塞套接字，`poll(2)` 聚合（仅 Unix）；
//! - [`lwip_sockets`]：进程内嵌入式协议栈的类套接字接口，自有描述符表与 `select`；
//! - [`lwip_tcp`]：回调式原始 TCP 引擎，没有描述符。
//!
//! 三者始终参与编译，特性开关只决定 [`crate::DefaultBackend`] 的指向。

#[cfg(unix)]
pub mod bsd;
pub mod lwip_sockets;
pub mod lwip_tcp;
