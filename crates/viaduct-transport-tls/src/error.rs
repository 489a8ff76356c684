use std::io;

use rustls::{AlertDescription, Error as RustlsError};
use rustls_pki_types::InvalidDnsNameError;
use thiserror::Error;
use viaduct_core::{ErrorCategory, categorize_io_error};

/// TLS 适配器的构造与角色错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 握手与读写失败由缓冲连接以 [`viaduct_core::CommsError`] 上报，本枚举只覆盖
///   适配器自身能判定的配置问题；
/// - `RoleMismatch` 在握手时以 `io::Error` 的内部错误形式出现，处理器可通过
///   [`categorize_tls_error`] 或向下转型取回。
///
/// ## 契约（What）
/// - 每个变体对应 `viaduct.transport.tls.*` 命名空间下的稳定错误码；
/// - 两类错误都属于配置错误，分类恒为 [`ErrorCategory::NonRetryable`]。
#[derive(Debug, Error)]
pub enum TlsAdaptorError {
    #[error("invalid tls server name `{name}`")]
    InvalidServerName {
        name: String,
        #[source]
        source: InvalidDnsNameError,
    },
    #[error("adaptor is configured as tls {configured}, cannot handshake as {requested}")]
    RoleMismatch {
        configured: &'static str,
        requested: &'static str,
    },
}

impl TlsAdaptorError {
    pub fn code(&self) -> &'static str {
        match self {
            TlsAdaptorError::InvalidServerName { .. } => "viaduct.transport.tls.invalid_server_name",
            TlsAdaptorError::RoleMismatch { .. } => "viaduct.transport.tls.role_mismatch",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::NonRetryable
    }
}

/// 细化握手与读写阶段 `io::Error` 的治理分类。
///
/// `tokio-rustls` 把协议错误包装为 `InvalidData` 的 `io::Error`；
/// 若能取回 `rustls::Error`，证书与完整性问题视为不可重试，其余沿用核心分类。
pub fn categorize_tls_error(error: &io::Error) -> ErrorCategory {
    if let Some(inner) = error.get_ref() {
        if let Some(tls) = inner.downcast_ref::<RustlsError>() {
            return categorize_rustls_error(tls);
        }
        if let Some(adaptor) = inner.downcast_ref::<TlsAdaptorError>() {
            return adaptor.category();
        }
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType
        | PeerIncompatible(_)
        | NoApplicationProtocol => ErrorCategory::NonRetryable,
        AlertReceived(alert) => alert_to_category(alert),
        _ => ErrorCategory::Retryable,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        CloseNotify | UserCanceled | NoRenegotiation | InternalError => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// 流式介质上代表“对端已断开”的错误种类；未发送 `close_notify` 的关闭同样以
/// `UnexpectedEof` 出现。
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
