#![doc = r#"
# viaduct-core

## 设计动机（Why）
- **定位**：传输无关的连接引擎核心，负责解析与建连、收发缓冲、建连/空闲超时，
  并把连接生命周期以信号的形式上报给唯一的上层处理器；
- **架构角色**：TCP、UDP 与 TLS 适配器分别位于 `viaduct-transport-*`，
  它们只需实现 [`SocketAdaptor`]；HTTP 等协议层只与 [`ConnectionHandler`] 与
  [`ConnectionHandle`] 打交道，不感知底层介质；
- **设计理念**：状态只在显式的 [`IoContext`] 中推进，异步操作的结果排队回到上下文，
  回调永不重入调用方的栈。

## 核心契约（What）
- **连接状态**：`Idle → Connecting → Connected → {Disconnecting → Closed | Error}`，
  见 [`ConnectionState`]；
- **信号**：`Connected`、`Received`、`Sent`，以及至多一次的终止信号
  `Disconnected`/`Error`/`ConnectionTimedOut`/`ReceiveTimedOut`，见 [`ConnectionEvent`]；
- **发送**：先进先出，同一时刻最多一个写操作在途；未连接时 `send` 返回 `false`；
- **接收**：`read_pending`/`read_data` 按到达顺序取出已完成读取的数据。

## 实现策略（How）
- 连接存放在上下文的代际槽位中，在途操作以 [`ConnectionId`] 引用连接；
  槽位释放后代际递增，迟到的完成事件被识别并丢弃；
- 每条连接只有一个截止计时器，在建连超时与空闲超时两个角色间复用；
- 配置通过 [`ConnectionConfig`] 提供，可由 TOML 片段反序列化。

## 风险与考量（Trade-offs）
- [`IoContext`] 不是 `Send`：处理器不要求 `Send`，因此上下文需要在创建它的任务内驱动；
- 引擎从不检查载荷内容，分帧与协议语义由上层负责。
"#]

mod adaptor;
mod config;
mod connection;
mod context;
mod error;
mod facade;
mod timer;

pub use adaptor::SocketAdaptor;
pub use config::{ConnectionConfig, DEFAULT_RX_BUFFER_SIZE};
pub use connection::{BufferedConnection, ConnectionState};
pub use context::{ConnectionId, ContextHandle, IoContext};
pub use error::{
    CommsError, ErrorCategory, OperationKind, Result, categorize_io_error, end_of_stream,
    is_candidate_unreachable,
};
pub use facade::{Connection, ConnectionEvent, ConnectionHandle, ConnectionHandler};

/// 稳定错误码对应的操作描述。
pub mod operation {
    pub use crate::error::{CONNECT, HANDSHAKE, READ, RESOLVE, WRITE};
}
