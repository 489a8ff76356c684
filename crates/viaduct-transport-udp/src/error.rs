use std::{io, net::IpAddr};

use thiserror::Error;
use viaduct_core::{ErrorCategory, OperationKind, categorize_io_error};

pub(crate) const OPEN: OperationKind = OperationKind {
    code: "viaduct.transport.udp.open_failed",
    message: "udp open",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "viaduct.transport.udp.configure_failed",
    message: "udp configure",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "viaduct.transport.udp.bind_failed",
    message: "udp bind",
};
pub(crate) const JOIN: OperationKind = OperationKind {
    code: "viaduct.transport.udp.join_failed",
    message: "udp join multicast group",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "viaduct.transport.udp.connect_failed",
    message: "udp connect",
};

/// UDP 套接字配置阶段的错误。
///
/// 公开的布尔接口（如 `receive_multicast`）只返回成败，
/// 需要原因时改用对应的 `try_*` 方法取得本错误。
#[derive(Debug, Error)]
pub enum UdpSetupError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("listen address {listen} is not in the same family as group {group}")]
    ListenFamilyMismatch { group: IpAddr, listen: IpAddr },
    #[error("socket is already open for the other address family")]
    SocketFamilyMismatch,
    #[error("resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("resolve {host}:{port}: no address found")]
    NoAddress { host: String, port: u16 },
    #[error("no tokio runtime available to register the socket")]
    NoRuntime,
    #[error("{message}: {source}", message = .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl UdpSetupError {
    pub(crate) fn io(kind: OperationKind) -> impl FnOnce(io::Error) -> Self {
        move |source| UdpSetupError::Io { kind, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            UdpSetupError::InvalidAddress(_) => "viaduct.transport.udp.invalid_address",
            UdpSetupError::NotMulticast(_) => "viaduct.transport.udp.not_multicast",
            UdpSetupError::ListenFamilyMismatch { .. } | UdpSetupError::SocketFamilyMismatch => {
                "viaduct.transport.udp.family_mismatch"
            }
            UdpSetupError::Resolve { .. } => "viaduct.transport.udp.resolve_failed",
            UdpSetupError::NoAddress { .. } => "viaduct.transport.udp.no_address",
            UdpSetupError::NoRuntime => "viaduct.transport.udp.no_runtime",
            UdpSetupError::Io { kind, .. } => kind.code,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            UdpSetupError::Resolve { source, .. } | UdpSetupError::Io { source, .. } => {
                categorize_io_error(source)
            }
            UdpSetupError::NoAddress { .. } => ErrorCategory::Retryable,
            _ => ErrorCategory::NonRetryable,
        }
    }
}
