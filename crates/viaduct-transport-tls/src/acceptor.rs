use std::{net::SocketAddr, sync::Arc};

use rustls::ServerConfig;
use viaduct_core::{ConnectionConfig, ConnectionHandler, ContextHandle};
use viaduct_transport_tcp::{TcpAcceptor, TcpTransportError};

use crate::adaptor::TlsAdaptor;

/// 绑定 TLS 监听端：每个入站流包装为服务端 [`TlsAdaptor`]，以 `start(true)` 完成握手。
///
/// 监听、退避与注册流程与明文 TCP 完全相同，因此直接复用 [`TcpAcceptor::bind_with`]；
/// 返回的监听端被丢弃时停止接受。
pub async fn bind_acceptor<F, H>(
    context: ContextHandle,
    addr: SocketAddr,
    config: ConnectionConfig,
    tls: Arc<ServerConfig>,
    factory: F,
) -> Result<TcpAcceptor, TcpTransportError>
where
    F: FnMut(SocketAddr) -> H + Send + 'static,
    H: ConnectionHandler<TlsAdaptor> + 'static,
{
    TcpAcceptor::bind_with(
        context,
        addr,
        config,
        move |stream| TlsAdaptor::accepted(stream, Arc::clone(&tls)),
        factory,
    )
    .await
}
