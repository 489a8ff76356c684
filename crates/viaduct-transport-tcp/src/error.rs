use std::{io, net::SocketAddr};

use thiserror::Error;
use viaduct_core::{CommsError, ErrorCategory, OperationKind, categorize_io_error};

pub(crate) const BIND: OperationKind = OperationKind {
    code: "viaduct.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "viaduct.transport.tcp.accept_failed",
    message: "tcp accept",
};

/// TCP 监听侧的错误。
///
/// 单条连接上的错误经 [`viaduct_core::ConnectionEvent::Error`] 上报，不在此列。
#[derive(Debug, Error)]
pub enum TcpTransportError {
    #[error("{message} {addr}: {source}", message = BIND.message)]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{message}: {source}", message = ACCEPT.message)]
    Accept {
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Register(#[from] CommsError),
}

impl TcpTransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TcpTransportError::Bind { .. } => BIND.code,
            TcpTransportError::Accept { .. } => ACCEPT.code,
            TcpTransportError::Register(inner) => inner.code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TcpTransportError::Bind { source, .. } | TcpTransportError::Accept { source } => {
                categorize_io_error(source)
            }
            TcpTransportError::Register(inner) => inner.category(),
        }
    }
}

/// 流式介质上代表“对端已断开”的错误种类。
pub(crate) fn is_peer_disconnect(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}
