use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, warn};
use viaduct_core::{
    ConnectionConfig, ConnectionHandler, ContextHandle, ErrorCategory, SocketAdaptor,
};

use crate::{adaptor::TcpAdaptor, error::TcpTransportError};

/// 接受失败且属于资源类错误（如文件描述符耗尽）时的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 监听端：把每个入站流注册为以服务端角色启动的连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 提供“监听 → 接受 → 注册”的最小闭环，让服务端连接与客户端连接共享同一套
///   缓冲连接状态机与信号语义。
///
/// ## 逻辑 (How)
/// - `bind` 绑定监听器后在运行时上启动接受循环；循环持有一个 [`ContextHandle`]，
///   每接受一个流，就把“包装适配器 → 调用工厂得到处理器 → 注册 → `start(true)`”
///   作为闭包投递到事件上下文中执行；
/// - 处理器在上下文任务内创建，因此不要求 `Send`；工厂本身需要 `Send`，
///   以 `parking_lot::Mutex` 包裹后在投递闭包间共享。
///
/// ## 契约 (What)
/// - 丢弃 `TcpAcceptor`（或调用 [`TcpAcceptor::close`]）会停止接受循环并释放其上下文句柄；
///   已注册的连接不受影响；
/// - 上下文已销毁时接受循环自行退出。
///
/// ## 注意事项 (Trade-offs)
/// - 接受错误只记录告警，监听不会因此终止；无法归类为可重试的错误（如描述符耗尽）先退避再继续。
#[derive(Debug)]
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TcpAcceptor {
    /// 绑定明文 TCP 监听器。
    pub async fn bind<F, H>(
        context: ContextHandle,
        addr: SocketAddr,
        config: ConnectionConfig,
        factory: F,
    ) -> Result<Self, TcpTransportError>
    where
        F: FnMut(SocketAddr) -> H + Send + 'static,
        H: ConnectionHandler<TcpAdaptor> + 'static,
    {
        Self::bind_with(context, addr, config, TcpAdaptor::from_stream, factory).await
    }

    /// 绑定监听器，并用 `wrap` 把每个入站流包装为任意适配器（例如 TLS）。
    pub async fn bind_with<A, W, F, H>(
        context: ContextHandle,
        addr: SocketAddr,
        config: ConnectionConfig,
        wrap: W,
        factory: F,
    ) -> Result<Self, TcpTransportError>
    where
        A: SocketAdaptor,
        W: Fn(TcpStream) -> A + Send + 'static,
        F: FnMut(SocketAddr) -> H + Send + 'static,
        H: ConnectionHandler<A> + 'static,
    {
        config.validate()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TcpTransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TcpTransportError::Bind { addr, source })?;
        debug!(%local_addr, "tcp acceptor listening");

        let factory = Arc::new(Mutex::new(factory));
        let task = tokio::spawn(accept_loop(listener, context, config, wrap, factory));
        Ok(Self { local_addr, task })
    }

    /// 监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止接受新连接。
    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop<A, W, F, H>(
    listener: TcpListener,
    context: ContextHandle,
    config: ConnectionConfig,
    wrap: W,
    factory: Arc<Mutex<F>>,
) where
    A: SocketAdaptor,
    W: Fn(TcpStream) -> A,
    F: FnMut(SocketAddr) -> H + Send + 'static,
    H: ConnectionHandler<A> + 'static,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                let error = TcpTransportError::Accept { source };
                warn!(code = error.code(), %error, "accept failed");
                if error.category() == ErrorCategory::NonRetryable {
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                continue;
            }
        };
        let adaptor = wrap(stream);
        let factory = Arc::clone(&factory);
        let config = config.clone();
        let posted = context.post(move |ctx| {
            let handler = {
                let mut make = factory.lock();
                (*make)(peer)
            };
            match ctx.register(adaptor, config, handler) {
                Ok(handle) => {
                    debug!(connection = %handle.id(), %peer, "accepted connection registered");
                    handle.start(true);
                }
                Err(error) => warn!(%peer, code = error.code(), %error, "register accepted connection failed"),
            }
        });
        if !posted {
            debug!("event context gone, accept loop stops");
            break;
        }
    }
}
