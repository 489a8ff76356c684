use std::{io, net::SocketAddr};

use thiserror::Error;

/// 错误的治理分类，供上层决定是否重连或放弃。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 瞬时故障，重连可能成功。
    Retryable,
    /// 配置或协议层面的错误，重试无意义。
    NonRetryable,
    /// 超时。
    Timeout,
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const RESOLVE: OperationKind = OperationKind {
    code: "viaduct.connection.resolve_failed",
    message: "resolve",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "viaduct.connection.connect_failed",
    message: "connect",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "viaduct.connection.handshake_failed",
    message: "handshake",
};
pub const READ: OperationKind = OperationKind {
    code: "viaduct.connection.read_failed",
    message: "read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "viaduct.connection.write_failed",
    message: "write",
};

/// `CommsError` 汇总连接引擎可观察到的全部错误。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 每个变体都映射到稳定错误码 [`CommsError::code`] 与治理分类 [`CommsError::category`]；
/// - IO 类变体保留原始 `io::Error`，通过 `source()` 暴露完整链路；
/// - 连接生命周期中的错误只会以 [`crate::ConnectionEvent::Error`] 的形式上报一次。
///
/// ## 注意事项（Trade-offs）
/// - 对端断开与超时不属于错误，它们有独立的终止信号，不会出现在本枚举中。
#[derive(Debug, Error)]
pub enum CommsError {
    #[error("resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("resolve {host}:{port}: no address found")]
    NoAddress { host: String, port: u16 },
    #[error("connect {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{message}: {source}", message = .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("configuration parse: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("no tokio runtime available for the event context")]
    NoRuntime,
}

impl CommsError {
    pub(crate) fn io(kind: OperationKind, source: io::Error) -> Self {
        CommsError::Io { kind, source }
    }

    /// 稳定错误码，遵循 `viaduct.<域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            CommsError::Resolve { .. } => RESOLVE.code,
            CommsError::NoAddress { .. } => "viaduct.connection.no_address",
            CommsError::Connect { .. } => CONNECT.code,
            CommsError::Io { kind, .. } => kind.code,
            CommsError::InvalidConfig(_) => "viaduct.config.invalid",
            CommsError::ConfigParse(_) => "viaduct.config.parse_failed",
            CommsError::NoRuntime => "viaduct.context.no_runtime",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CommsError::Resolve { source, .. }
            | CommsError::Connect { source, .. }
            | CommsError::Io { source, .. } => categorize_io_error(source),
            CommsError::NoAddress { .. } => ErrorCategory::Retryable,
            CommsError::InvalidConfig(_) | CommsError::ConfigParse(_) | CommsError::NoRuntime => {
                ErrorCategory::NonRetryable
            }
        }
    }

    /// 底层 IO 错误（若有）。
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            CommsError::Resolve { source, .. }
            | CommsError::Connect { source, .. }
            | CommsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T, E = CommsError> = std::result::Result<T, E>;

/// 依据 `io::ErrorKind` 推导治理分类。
pub fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::BrokenPipe
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// 判断建连失败是否只针对当前候选地址，从而允许切换到下一个解析结果。
///
/// 仅“该地址不可达”一类错误触发回退；权限、参数等错误对所有候选同样成立，直接上报。
pub fn is_candidate_unreachable(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NotFound
            | ErrorKind::TimedOut
    )
}

/// 构造统一的流结束错误，`shutdown` 与流式读取的 EOF 均使用它。
pub fn end_of_stream() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")
}
