use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use socket2::SockRef;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex as AsyncMutex,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, trace};
use viaduct_core::{ConnectionConfig, SocketAdaptor, end_of_stream};
use viaduct_transport_tcp::TcpAdaptor;

use crate::error::{TlsAdaptorError, is_peer_disconnect};

/// 以 `Arc` 共享的 TCP 流，供 TLS 会话读写。
///
/// 底层 `TcpAdaptor` 继续持有同一个流，`close` 与半关闭仍经由它完成。
#[derive(Debug)]
struct SharedTcp(Arc<TcpStream>);

impl AsyncRead for SharedTcp {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            ready!(self.0.poll_read_ready(cx))?;
            match self.0.try_read(buf.initialize_unfilled()) {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

impl AsyncWrite for SharedTcp {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            ready!(self.0.poll_write_ready(cx))?;
            match self.0.try_write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                result => return Poll::Ready(result),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(SockRef::from(&*self.0).shutdown(Shutdown::Write))
    }
}

type Stream = TlsStream<SharedTcp>;

/// 握手完成后的会话：读写两半各自加锁，互不阻塞。
struct Session {
    reader: AsyncMutex<ReadHalf<Stream>>,
    writer: AsyncMutex<WriteHalf<Stream>>,
    server_name: Option<String>,
    alpn_protocol: Option<Vec<u8>>,
}

enum Role {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server { .. } => "server",
        }
    }
}

/// TLS 适配器：在 [`TcpAdaptor`] 之上叠加 `rustls` 会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让加密连接与明文 TCP 共享同一套缓冲连接状态机：候选回退、超时、队列与信号
///   语义完全一致，差别只在握手与读写的加解密；
/// - 暴露 SNI 与 ALPN 元数据，供上层协议选择使用。
///
/// ## 逻辑（How）
/// - 建连委托给内部 `TcpAdaptor`；`handshake` 按配置的角色运行
///   `TlsConnector`/`TlsAcceptor`，成功后用 `tokio::io::split` 拆成读写两半，
///   分别以 `tokio::sync::Mutex` 包裹，满足“同时挂起一次读与一次写”的契约；
/// - `shutdown` 先发送 `close_notify`，再关闭 TCP 双向，结果恒为流结束错误；
/// - `close` 丢弃会话并关闭 TCP 流。
///
/// ## 契约（What）
/// - `client`：需要 `rustls::ClientConfig` 与用于证书校验的服务器名，只能以
///   `start(false)`/`connect` 的客户端角色握手；
/// - `server`/`accepted`：需要 `rustls::ServerConfig`，只能以 `start(true)` 握手；
/// - 角色不符时握手失败，内部错误为 [`TlsAdaptorError::RoleMismatch`]；
/// - 收到 `close_notify` 或 TCP 关闭时读取返回流结束错误，被判定为断开。
///
/// ## 风险与权衡（Trade-offs）
/// - 每次写出在全部明文交给会话后立即 `flush`，小包较多时密文记录会偏碎；
/// - 握手耗时计入连接超时，由缓冲连接的计时器统一约束。
pub struct TlsAdaptor {
    tcp: TcpAdaptor,
    role: Role,
    session: ArcSwapOption<Session>,
}

impl TlsAdaptor {
    /// 客户端角色；`server_name` 可以是 DNS 名或 IP 字面量。
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: impl Into<String>,
    ) -> Result<Self, TlsAdaptorError> {
        let name = server_name.into();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|source| TlsAdaptorError::InvalidServerName { name, source })?;
        Ok(Self::with_role(
            TcpAdaptor::new(),
            Role::Client {
                config,
                server_name,
            },
        ))
    }

    /// 服务端角色，流稍后通过 `connect_socket` 建立（较少见）。
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::with_role(TcpAdaptor::new(), Role::Server { config })
    }

    /// 包装监听器接受的流，作为服务端握手。
    pub fn accepted(stream: TcpStream, config: Arc<ServerConfig>) -> Self {
        Self::with_role(TcpAdaptor::from_stream(stream), Role::Server { config })
    }

    fn with_role(tcp: TcpAdaptor, role: Role) -> Self {
        Self {
            tcp,
            role,
            session: ArcSwapOption::empty(),
        }
    }

    /// 内部 TCP 适配器，可用于调整 `TCP_NODELAY` 或查询地址。
    pub fn tcp(&self) -> &TcpAdaptor {
        &self.tcp
    }

    pub fn is_established(&self) -> bool {
        self.session.load().is_some()
    }

    /// 客户端在握手中提供的 SNI，仅服务端可见。
    pub fn server_name(&self) -> Option<String> {
        self.session.load().as_ref()?.server_name.clone()
    }

    /// 协商得到的 ALPN 协议标识。
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.session.load().as_ref()?.alpn_protocol.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.tcp.peer_addr()
    }

    fn current(&self) -> io::Result<Arc<Session>> {
        self.session
            .load_full()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn role_mismatch(&self, is_server: bool) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            TlsAdaptorError::RoleMismatch {
                configured: self.role.name(),
                requested: if is_server { "server" } else { "client" },
            },
        )
    }
}

impl fmt::Debug for TlsAdaptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAdaptor")
            .field("role", &self.role.name())
            .field("peer", &self.tcp.peer_addr())
            .field("established", &self.is_established())
            .finish()
    }
}

#[async_trait]
impl SocketAdaptor for TlsAdaptor {
    type Socket = TcpStream;

    async fn handshake(&self, is_server: bool) -> io::Result<()> {
        if matches!(self.role, Role::Server { .. }) != is_server {
            return Err(self.role_mismatch(is_server));
        }
        self.tcp.handshake(is_server).await?;
        let io = SharedTcp(
            self.tcp
                .socket()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?,
        );

        let (stream, server_name, alpn_protocol): (Stream, _, _) = match &self.role {
            Role::Server { config } => {
                let stream = TlsAcceptor::from(Arc::clone(config)).accept(io).await?;
                let (_, connection) = stream.get_ref();
                let sni = connection.server_name().map(str::to_owned);
                let alpn = connection.alpn_protocol().map(<[u8]>::to_vec);
                (stream.into(), sni, alpn)
            }
            Role::Client {
                config,
                server_name,
            } => {
                let stream = TlsConnector::from(Arc::clone(config))
                    .connect(server_name.clone(), io)
                    .await?;
                let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                (stream.into(), None, alpn)
            }
        };
        debug!(
            role = self.role.name(),
            peer = ?self.tcp.peer_addr(),
            sni = ?server_name,
            "tls handshake complete"
        );

        let (reader, writer) = tokio::io::split(stream);
        self.session.store(Some(Arc::new(Session {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            server_name,
            alpn_protocol,
        })));
        Ok(())
    }

    async fn connect_socket(&self, candidate: SocketAddr) -> io::Result<()> {
        self.session.store(None);
        self.tcp.connect_socket(candidate).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let session = self.current()?;
        let mut reader = session.reader.lock().await;
        match reader.read(buf).await? {
            0 if !buf.is_empty() => Err(end_of_stream()),
            n => Ok(n),
        }
    }

    async fn write(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let session = self.current()?;
        let mut writer = session.writer.lock().await;
        let mut total = 0;
        for buf in bufs {
            writer.write_all(buf).await?;
            total += buf.len();
        }
        writer.flush().await?;
        Ok(total)
    }

    async fn shutdown(&self) -> io::Error {
        if let Some(session) = self.session.load_full() {
            let mut writer = session.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                trace!(error = %err, "tls close_notify not delivered");
            }
        }
        self.tcp.shutdown().await
    }

    fn close(&self) {
        self.session.store(None);
        self.tcp.close();
    }

    fn is_disconnect(&self, error: &io::Error) -> bool {
        is_peer_disconnect(error)
    }

    fn socket(&self) -> Option<Arc<TcpStream>> {
        self.tcp.socket()
    }

    fn configure(&self, config: &ConnectionConfig) {
        self.tcp.configure(config);
    }
}
