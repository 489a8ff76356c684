use std::{
    io,
    net::{Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::trace;
use viaduct_core::{ConnectionConfig, SocketAdaptor, end_of_stream};

use crate::error::is_peer_disconnect;

/// TCP 适配器：持有至多一个 `TcpStream`。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把 Tokio `TcpStream` 的建连、部分读取、整块写出与半关闭收敛到
///   [`SocketAdaptor`] 契约之下，使缓冲连接无需感知 TCP 细节。
///
/// ## 逻辑 (How)
/// - 流以 `ArcSwapOption` 保存：`connect_socket` 成功时安装，`close` 时摘除；
///   在途的读与写各自持有一份 `Arc`，借助 `readable`/`try_read` 与
///   `writable`/`try_write` 在 `&self` 上实现全双工，不需要互斥锁；
/// - 对端有序关闭时读到 0 字节，统一转换为 [`end_of_stream`] 错误；
/// - `shutdown` 通过 `socket2::SockRef` 同时关闭读写方向，结果总是流结束。
///
/// ## 契约 (What)
/// - `handshake`：TCP 无握手，仅按配置应用 `TCP_NODELAY`；
/// - `configure`：注册时以连接配置的 `no_delay` 覆盖构造时的取值；
/// - `connect_socket`：向单个候选地址建连，替换任何旧流；
/// - `is_disconnect`：EOF、复位、中止、断管与未连接均视为对端断开。
///
/// ## 注意事项 (Trade-offs)
/// - `close` 只摘除适配器自身的引用；套接字在在途操作被取消、其 `Arc` 释放后才真正关闭。
#[derive(Debug)]
pub struct TcpAdaptor {
    stream: ArcSwapOption<TcpStream>,
    no_delay: AtomicBool,
}

impl Default for TcpAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpAdaptor {
    /// 尚未建连的适配器，默认启用 `TCP_NODELAY`。
    pub fn new() -> Self {
        Self {
            stream: ArcSwapOption::empty(),
            no_delay: AtomicBool::new(true),
        }
    }

    /// 依据连接配置构造，`no_delay` 取自配置；注册时仍以连接自身的配置为准。
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let adaptor = Self::new();
        adaptor.no_delay.store(config.no_delay(), Ordering::Relaxed);
        adaptor
    }

    /// 包装一个已建立的流（通常来自监听器）。
    pub fn from_stream(stream: TcpStream) -> Self {
        let adaptor = Self::new();
        adaptor.stream.store(Some(Arc::new(stream)));
        adaptor
    }

    /// 设置 `TCP_NODELAY`；已有流时立即生效。
    pub fn set_no_delay(&self, enabled: bool) -> io::Result<()> {
        self.no_delay.store(enabled, Ordering::Relaxed);
        match self.stream.load_full() {
            Some(stream) => stream.set_nodelay(enabled),
            None => Ok(()),
        }
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.load().as_ref()?.peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.load().as_ref()?.local_addr().ok()
    }

    fn current(&self) -> io::Result<Arc<TcpStream>> {
        self.stream
            .load_full()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[async_trait]
impl SocketAdaptor for TcpAdaptor {
    type Socket = TcpStream;

    async fn handshake(&self, _is_server: bool) -> io::Result<()> {
        let stream = self.current()?;
        stream.set_nodelay(self.no_delay())
    }

    async fn connect_socket(&self, candidate: SocketAddr) -> io::Result<()> {
        let stream = TcpStream::connect(candidate).await?;
        trace!(%candidate, local = ?stream.local_addr().ok(), "tcp stream established");
        self.stream.store(Some(Arc::new(stream)));
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.current()?;
        loop {
            stream.readable().await?;
            match stream.try_read(buf) {
                Ok(0) if !buf.is_empty() => return Err(end_of_stream()),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    async fn write(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let stream = self.current()?;
        let mut total = 0;
        for buf in bufs {
            let mut offset = 0;
            while offset < buf.len() {
                stream.writable().await?;
                match stream.try_write(&buf[offset..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => offset += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(err) => return Err(err),
                }
            }
            total += buf.len();
        }
        Ok(total)
    }

    async fn shutdown(&self) -> io::Error {
        if let Some(stream) = self.stream.load_full()
            && let Err(err) = SockRef::from(&*stream).shutdown(Shutdown::Both)
        {
            trace!(error = %err, "tcp shutdown ignored");
        }
        end_of_stream()
    }

    fn close(&self) {
        if self.stream.swap(None).is_some() {
            trace!("tcp stream closed");
        }
    }

    fn is_disconnect(&self, error: &io::Error) -> bool {
        is_peer_disconnect(error)
    }

    fn socket(&self) -> Option<Arc<TcpStream>> {
        self.stream.load_full()
    }

    fn configure(&self, config: &ConnectionConfig) {
        self.no_delay.store(config.no_delay(), Ordering::Relaxed);
    }
}
