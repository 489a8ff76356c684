use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ConnectionConfig;

/// 传输适配器契约：一个实现对应一种传输介质，独占一个底层套接字。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - [`BufferedConnection`](crate::BufferedConnection) 只面向本 trait 编程，
///   TCP、UDP 与 TLS 之间的差异全部收敛在各自实现内部。
///
/// ## 契约（What）
/// - `handshake`：安全/协商握手；无握手的介质立即返回成功；
/// - `connect_socket`：向单个候选地址建连；无连接概念的介质立即返回成功；
/// - `read`：发起一次接收，只要有任意字节到达即返回；流式介质的对端关闭以
///   `UnexpectedEof` 错误表达，`Ok(0)` 仅代表空数据报；
/// - `write`：发起一次发送，返回前保证整个缓冲序列已交给内核；
/// - `shutdown`：尽力半关闭，**总是**以流结束错误收尾，使上层能统一处理；
/// - `close`：同步、幂等、不失败，释放底层句柄；
/// - `is_disconnect`：判定错误是否代表对端断开，无此概念的介质恒为 `false`；
/// - `socket`：暴露底层句柄以便做介质相关的配置；
/// - `configure`：注册时收到连接配置，只取与本介质相关的字段，缺省忽略。
///
/// ## 注意事项（Trade-offs）
/// - 所有异步方法以 `&self` 接收者定义：连接会同时挂起一次读与一次写，
///   实现方需要保证二者互不阻塞；
/// - 适配器被 `Arc` 共享给在途操作，`close` 之后在途操作由连接负责取消。
#[async_trait]
pub trait SocketAdaptor: Send + Sync + 'static {
    /// 底层套接字类型。
    type Socket: Send + Sync;

    async fn handshake(&self, is_server: bool) -> io::Result<()>;

    async fn connect_socket(&self, candidate: SocketAddr) -> io::Result<()>;

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, bufs: &[Bytes]) -> io::Result<usize>;

    async fn shutdown(&self) -> io::Error;

    fn close(&self);

    fn is_disconnect(&self, error: &io::Error) -> bool;

    fn socket(&self) -> Option<Arc<Self::Socket>>;

    fn configure(&self, _config: &ConnectionConfig) {}
}
