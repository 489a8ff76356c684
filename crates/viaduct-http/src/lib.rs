#![doc = r#"
# viaduct-http

## 设计动机（Why）
- 演示缓冲连接之上的协议消费者：HTTP/1.x 服务端按“请求 → 响应”驱动连接，
  并据请求决定保持连接或断开。

## 核心契约（What）
- [`RequestReceiver`]：可替换的增量请求解析器，判定为 `Valid`/`Invalid`/`Incomplete`；
- [`HeadRequestReceiver`]：内置的最小实现，支持请求行、头部与定长消息体；
- [`HttpConnection`]：把接收队列喂给解析器，非法请求回复 `400 Bad Request`，
  响应版本跟随请求；
- [`HttpResponder`]：以闭包回应请求的连接处理器，可直接交给监听端工厂。

## 风险与考量（Trade-offs）
- 分块传输编码与完整的 HTTP 语法不在本 crate 范围内，需要时替换接收器实现。
"#]

mod connection;
mod request;
mod response;

pub use connection::{HttpConnection, HttpResponder};
pub use request::{
    DEFAULT_MAX_HEAD_SIZE, HeadRequestReceiver, Request, RequestError, RequestReceiver, Verdict,
};
pub use response::{Response, Status};
