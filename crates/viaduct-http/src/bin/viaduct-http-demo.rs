//! 最小 HTTP 服务演示：对每个请求回显方法与路径。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=viaduct_core=debug,info cargo run --bin viaduct-http-demo -- 127.0.0.1:8080 \
//!     --config connection.toml
//! ```
//! - 第一个参数：监听地址，缺省 `127.0.0.1:8080`；
//! - `--config`：可选，TOML 格式的连接配置（`rx_buffer_size`、`connect_timeout_ms`、
//!   `receive_timeout_ms`、`no_delay`）。

use std::{env, fs, net::SocketAddr};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use viaduct_core::{ConnectionConfig, IoContext};
use viaduct_http::{HttpResponder, Request, Response, Status};
use viaduct_transport_tcp::TcpAcceptor;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn parse_args() -> Result<(SocketAddr, ConnectionConfig)> {
    let mut addr = SocketAddr::from(([127, 0, 0, 1], 8080));
    let mut config = ConnectionConfig::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config 之后必须提供文件路径")?;
                let text =
                    fs::read_to_string(&path).with_context(|| format!("读取配置 {path} 失败"))?;
                config = ConnectionConfig::from_toml_str(&text)?;
            }
            flag if flag.starts_with("--") => bail!("未知参数: {flag}"),
            value => {
                addr = value
                    .parse()
                    .with_context(|| format!("无法解析监听地址 `{value}`"))?;
            }
        }
    }
    Ok((addr, config))
}

fn respond(request: &Request, body: &[u8]) -> (Response, Bytes) {
    let text = format!(
        "{} {} ({} body bytes)\n",
        request.method(),
        request.target(),
        body.len()
    );
    let response = Response::new(Status::Ok, text.len())
        .with_header("Content-Type", "text/plain; charset=utf-8")
        .with_header("Server", "viaduct-http-demo");
    (response, Bytes::from(text))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let (addr, config) = parse_args()?;

    let mut ctx = IoContext::new()?;
    let acceptor = TcpAcceptor::bind(ctx.handle(), addr, config, |peer| {
        info!(%peer, "http client accepted");
        HttpResponder::new(respond)
    })
    .await?;
    info!(local_addr = %acceptor.local_addr(), "viaduct http demo listening");

    tokio::select! {
        _ = ctx.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("等待 Ctrl-C 失败")?;
            info!("shutting down");
        }
    }
    acceptor.close();
    Ok(())
}
