//! 套接字层的统一错误模型。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 三种后端（BSD、精简协议栈、回调式 TCP 引擎）各自有不同的错误来源：`errno`、协议栈
//!   枚举、引擎回调。上层协议只关心“配置错了 / 资源耗尽 / 连接已不可用”三类结论，
//!   因此在此收敛为一个 [`SocketError`]，并提供稳定错误码与 [`ErrorCategory`]。
//! - “暂时无法完成”（WouldBlock / InProgress）**不是**错误，它们以结果枚举的分支返回，
//!   见 [`crate::socket`]。本模块负责在映射 `io::Error` 时把这类情况剔除出去。
//!
//! ## 契约（What）
//! - 每个失败的底层操作都携带一个 [`OperationKind`]，其 `code` 在版本间保持稳定，可直接
//!   用作日志字段或指标标签；
//! - [`SocketError::category`] 与错误分类表一一对应：配置错误、资源耗尽、终止性错误。

use std::io;

use thiserror::Error;

use crate::addr::AddressFamily;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const OPEN: OperationKind = OperationKind {
    code: "spark.socket.open_failed",
    message: "socket open",
};
pub const BIND: OperationKind = OperationKind {
    code: "spark.socket.bind_failed",
    message: "socket bind",
};
pub const LISTEN: OperationKind = OperationKind {
    code: "spark.socket.listen_failed",
    message: "socket listen",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.socket.accept_failed",
    message: "socket accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "spark.socket.connect_failed",
    message: "socket connect",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.socket.read_failed",
    message: "socket read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.socket.write_failed",
    message: "socket write",
};
pub const RECV_FROM: OperationKind = OperationKind {
    code: "spark.socket.recvfrom_failed",
    message: "socket recvfrom",
};
pub const SEND_TO: OperationKind = OperationKind {
    code: "spark.socket.sendto_failed",
    message: "socket sendto",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.socket.shutdown_failed",
    message: "socket shutdown",
};
pub const CLOSE: OperationKind = OperationKind {
    code: "spark.socket.close_failed",
    message: "socket close",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "spark.socket.configure_failed",
    message: "socket configure",
};
pub const LOCAL_ADDR: OperationKind = OperationKind {
    code: "spark.socket.local_addr_failed",
    message: "socket getsockname",
};
pub const PEER_ADDR: OperationKind = OperationKind {
    code: "spark.socket.peer_addr_failed",
    message: "socket getpeername",
};

const INVALID_ADDRESS_CODE: &str = "spark.socket.addr.invalid";
const FAMILY_UNSUPPORTED_CODE: &str = "spark.socket.addr.family_unsupported";
const BUFFER_TOO_SMALL_CODE: &str = "spark.socket.addr.buffer_too_small";
const MALFORMED_ADDRESS_CODE: &str = "spark.socket.addr.malformed";
const INVALID_CONFIG_CODE: &str = "spark.socket.config.invalid";
const EXHAUSTED_CODE: &str = "spark.socket.exhausted";
const CLOSED_CODE: &str = "spark.socket.closed";
const UNSUPPORTED_CODE: &str = "spark.socket.unsupported";
const INVALID_STATE_CODE: &str = "spark.socket.invalid_state";

/// 错误分类，对应“配置错误 / 资源耗尽 / 终止性 I/O 错误”三类处理策略。
///
/// - `Configuration`：调用方传参有误，重试无意义，应修正输入；
/// - `ResourceExhausted`：描述符或连接令牌不足，本层不会自动重试；
/// - `Terminal`：连接已不可用，调用方必须关闭套接字，本层绝不静默重开。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    ResourceExhausted,
    Terminal,
}

/// 套接字层统一错误类型。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SocketError {
    /// 地址文本无法解析为目标地址族。
    #[error("invalid address text `{text}`")]
    InvalidAddress { text: String },
    /// 请求的地址族未编译进当前构建。
    #[error("address family {0:?} is not compiled into this build")]
    FamilyUnsupported(AddressFamily),
    /// 目标缓冲区容量不足以容纳该地址族的二进制结构。
    #[error("sockaddr buffer too small: need {required} bytes, got {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },
    /// 二进制地址解码失败。
    #[error("malformed sockaddr bytes")]
    MalformedAddress,
    /// 配置项取值非法。
    #[error("invalid socket configuration: {reason}")]
    InvalidConfig { reason: String },
    /// 后端无法再分配描述符或连接令牌。
    #[error("{}: descriptor table exhausted", .op.message)]
    Exhausted { op: OperationKind },
    /// 套接字已关闭。
    #[error("{}: socket already closed", .op.message)]
    Closed { op: OperationKind },
    /// 当前后端无法表达该操作。
    #[error("{}: not supported by the {backend} backend", .op.message)]
    Unsupported {
        op: OperationKind,
        backend: &'static str,
    },
    /// 套接字处于不允许该操作的状态（例如未连接时写入）。
    #[error("{}: invalid socket state", .op.message)]
    InvalidState { op: OperationKind },
    /// 底层 I/O 错误。
    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::InvalidAddress { .. } => INVALID_ADDRESS_CODE,
            SocketError::FamilyUnsupported(_) => FAMILY_UNSUPPORTED_CODE,
            SocketError::BufferTooSmall { .. } => BUFFER_TOO_SMALL_CODE,
            SocketError::MalformedAddress => MALFORMED_ADDRESS_CODE,
            SocketError::InvalidConfig { .. } => INVALID_CONFIG_CODE,
            SocketError::Exhausted { .. } => EXHAUSTED_CODE,
            SocketError::Closed { .. } => CLOSED_CODE,
            SocketError::Unsupported { .. } => UNSUPPORTED_CODE,
            SocketError::InvalidState { .. } => INVALID_STATE_CODE,
            SocketError::Io { op, .. } => op.code,
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::InvalidAddress { .. }
            | SocketError::FamilyUnsupported(_)
            | SocketError::BufferTooSmall { .. }
            | SocketError::MalformedAddress
            | SocketError::InvalidConfig { .. }
            | SocketError::Unsupported { .. } => ErrorCategory::Configuration,
            SocketError::Exhausted { .. } => ErrorCategory::ResourceExhausted,
            SocketError::Closed { .. }
            | SocketError::InvalidState { .. }
            | SocketError::Io { .. } => ErrorCategory::Terminal,
        }
    }

    /// 若错误源自 `io::Error`，返回其 `ErrorKind`。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            SocketError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    pub(crate) fn closed(op: OperationKind) -> Self {
        SocketError::Closed { op }
    }

    pub(crate) fn invalid_state(op: OperationKind) -> Self {
        SocketError::InvalidState { op }
    }

    pub(crate) fn unsupported(op: OperationKind, backend: &'static str) -> Self {
        SocketError::Unsupported { op, backend }
    }

    pub(crate) fn from_kind(op: OperationKind, kind: io::ErrorKind) -> Self {
        SocketError::Io {
            op,
            source: io::Error::from(kind),
        }
    }
}

/// 将 IO 错误映射为 [`SocketError`]，资源类 `errno` 归入 [`SocketError::Exhausted`]。
///
/// 调用方必须先自行剔除 WouldBlock / InProgress 等暂态，本函数只处理真正的失败。
pub(crate) fn map_io_error(op: OperationKind, error: io::Error) -> SocketError {
    if is_exhaustion(&error) {
        return SocketError::Exhausted { op };
    }
    SocketError::Io { op, source: error }
}

/// 判断 `io::Error` 是否属于“稍后再试”的暂态。
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn is_exhaustion(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    // EMFILE / ENFILE / ENOBUFS / ENOMEM 在各 Unix 平台取值不同，交给 nix 统一比对。
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        if let Some(code) = error.raw_os_error() {
            return [Errno::EMFILE, Errno::ENFILE, Errno::ENOBUFS, Errno::ENOMEM]
                .iter()
                .any(|errno| *errno as i32 == code);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_exhaustion_maps_to_resource_category() {
        #[cfg(unix)]
        {
            let err = io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32);
            let mapped = map_io_error(OPEN, err);
            assert!(matches!(mapped, SocketError::Exhausted { .. }));
            assert_eq!(mapped.category(), ErrorCategory::ResourceExhausted);
            assert_eq!(mapped.code(), "spark.socket.exhausted");
        }
    }

    #[test]
    fn io_errors_keep_operation_code() {
        let mapped = map_io_error(CONNECT, io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(mapped.code(), "spark.socket.connect_failed");
        assert_eq!(mapped.category(), ErrorCategory::Terminal);
        assert_eq!(mapped.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(mapped.to_string().starts_with("socket connect"));
    }

    #[test]
    fn address_errors_are_configuration_errors() {
        let err = SocketError::BufferTooSmall {
            required: 28,
            capacity: 16,
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert_eq!(err.code(), "spark.socket.addr.buffer_too_small");
    }

    #[test]
    fn transient_kinds_are_detected() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
