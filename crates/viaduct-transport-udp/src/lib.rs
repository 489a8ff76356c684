#![doc = r#"
# viaduct-transport-udp

## 模块使命（Why）
- **统一 UDP 通路**：为缓冲连接提供 UDP 版本的 [`SocketAdaptor`](viaduct_core::SocketAdaptor)，
  覆盖连接式单播、绑定单播、组播接收/发送与 IPv4 广播四类寻址模式。

## 核心契约（What）
- [`UdpAdaptor`] 的配置方法在注册前调用，返回 `bool`；需要失败原因时使用 `try_*`
  版本得到 [`UdpSetupError`]；
- 配置完成后由持有者调用 `start(false)` 标记可收发；
- 推荐的接收缓冲区大小为 [`UdpAdaptor::DEFAULT_RX_BUFFER_SIZE`]（2048 字节）。

## 实现策略（How）
- 套接字经 `socket2` 创建以便在绑定前设置地址复用，随后交给 Tokio 驱动；
- 未连接模式下接收会把发送方写入接收端点，发送则总是发往发送端点。
"#]

mod adaptor;
mod error;

pub use adaptor::{MulticastMembership, UdpAdaptor};
pub use error::UdpSetupError;
