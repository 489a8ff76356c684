#![doc = r#"
# viaduct-transport-tls

## 设计动机（Why）
- 在 TCP 适配器之上叠加 `rustls` 会话，使加密连接复用缓冲连接的全部语义；
- 服务端接入直接复用 `viaduct-transport-tcp` 的监听循环。

## 核心契约（What）
- [`TlsAdaptor::client`]：携带 `ClientConfig` 与服务器名，在 `connect` 后完成客户端握手；
- [`TlsAdaptor::accepted`] / [`bind_acceptor`]：服务端角色，在 `start(true)` 时握手；
- 关闭时发送 `close_notify`；对端关闭以流结束错误表达；
- [`categorize_tls_error`] 把握手失败细分为可重试与不可重试两类。

## 实现策略（How）
- 会话建立后经 `tokio::io::split` 拆分为读写两半，各自由 `tokio::sync::Mutex` 保护；
- 加密提供者由使用方决定：通过 `rustls::crypto::CryptoProvider::install_default`
  或 `builder_with_provider` 指定，本 crate 启用 `aws_lc_rs` 特性。

## 风险与考量（Trade-offs）
- 证书热更、SNI 多证书解析等能力交给 `rustls` 配置本身，本 crate 不再封装。
"#]

mod acceptor;
mod adaptor;
mod error;

pub use acceptor::bind_acceptor;
pub use adaptor::TlsAdaptor;
pub use error::{TlsAdaptorError, categorize_tls_error};
