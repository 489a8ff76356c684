#![doc = r#"
# viaduct-transport-tcp

## 设计动机（Why）
- **定位**：在 Tokio 运行时上实现 [`SocketAdaptor`](viaduct_core::SocketAdaptor) 的 TCP 版本，
  并提供把入站流注册为连接的监听端；
- **架构角色**：缓冲连接负责解析、候选回退、计时与队列，本 crate 只负责单个流的
  建连、读写与关闭；TLS 适配器复用本 crate 的监听端完成接入。

## 核心契约（What）
- [`TcpAdaptor`]：读取为部分读取，任意字节到达即返回；写出保证整块交给内核；
  对端关闭以流结束错误表达并被判定为断开；
- [`TcpAcceptor`]：每个入站连接以服务端角色 `start(true)`，处理器由工厂按对端地址创建。

## 实现策略（How）
- 流保存在 `arc_swap::ArcSwapOption` 中，读写两条路径各持一份 `Arc` 并发进行；
- 半关闭与 `TCP_NODELAY` 通过 `socket2` 与 Tokio 原生接口完成；
- 监听错误映射为带稳定错误码的 [`TcpTransportError`]。

## 风险与考量（Trade-offs）
- 连接级错误不经本 crate 的错误类型，而是作为连接信号上报；
- 接受循环在上下文销毁或监听端被丢弃时退出，已注册的连接继续存活。
"#]

mod acceptor;
mod adaptor;
mod error;

pub use acceptor::TcpAcceptor;
pub use adaptor::TcpAdaptor;
pub use error::TcpTransportError;
