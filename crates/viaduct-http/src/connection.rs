use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};
use viaduct_core::{Connection, ConnectionEvent, ConnectionHandler, SocketAdaptor};

use crate::{
    request::{HeadRequestReceiver, Request, RequestReceiver, Verdict},
    response::{Response, Status},
};

/// 把缓冲连接的接收队列接到请求接收器上的胶水层。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 缓冲连接只交付无结构的字节块，本类型负责“喂给解析器 → 判定 → 回响应”的往返，
///   让业务处理器只面对完整请求。
///
/// ## 逻辑（How）
/// - [`receive`](Self::receive) 逐块取出 `read_data` 交给接收器，直到得到完整请求、
///   判定非法或接收队列为空；非法时立即回复 `400 Bad Request` 并断开；
/// - [`send_response`](Self::send_response) 把响应版本改为请求的版本，拼接头部与消息体后
///   一次性入队，随后清空接收器；请求要求保持连接时继续读取，否则断开。
///
/// ## 契约（What）
/// - `receive` 返回 `true` 时 [`request`](Self::request) 与 [`body`](Self::body) 可读，
///   调用方必须先回复响应，再次调用 `receive` 才会处理下一个请求；
/// - `send_response` 返回连接是否继续服务后续请求。
///
/// ## 风险与权衡（Trade-offs）
/// - 非法请求之后字节流已失去同步，无论请求是否要求保持连接都会断开。
#[derive(Debug, Default)]
pub struct HttpConnection<R = HeadRequestReceiver> {
    rx: R,
}

impl<R: RequestReceiver> HttpConnection<R> {
    pub fn new(rx: R) -> Self {
        Self { rx }
    }

    pub fn request(&self) -> &Request {
        self.rx.request()
    }

    pub fn body(&self) -> &[u8] {
        self.rx.body()
    }

    pub fn receiver(&self) -> &R {
        &self.rx
    }

    /// 取出接收队列中的数据，直到得到一个完整请求。
    pub fn receive<A: SocketAdaptor>(&mut self, conn: &mut Connection<'_, A>) -> bool {
        // 先处理上一次响应后残留的流水线字节。
        let mut verdict = self.rx.receive(&[]);
        loop {
            match verdict {
                Verdict::Valid => return true,
                Verdict::Invalid => {
                    warn!(connection = %conn.id(), "invalid http request, replying 400");
                    self.reject(conn);
                    return false;
                }
                Verdict::Incomplete => {}
            }
            if !conn.read_pending() {
                return false;
            }
            let data = conn.read_data();
            verdict = self.rx.receive(&data);
        }
    }

    /// 发送响应；消息体紧随头部。
    pub fn send_response<A: SocketAdaptor>(
        &mut self,
        conn: &mut Connection<'_, A>,
        mut response: Response,
        body: &[u8],
    ) -> bool {
        let (major, minor) = self.rx.request().version();
        response.set_version(major, minor);
        let keep_alive = self.rx.request().keep_alive();
        self.transmit(conn, &response, body, keep_alive)
    }

    fn reject<A: SocketAdaptor>(&mut self, conn: &mut Connection<'_, A>) {
        let mut response = Response::new(Status::BadRequest, 0);
        let (major, minor) = self.rx.request().version();
        response.set_version(major, minor);
        self.transmit(conn, &response, &[], false);
    }

    fn transmit<A: SocketAdaptor>(
        &mut self,
        conn: &mut Connection<'_, A>,
        response: &Response,
        body: &[u8],
        keep_alive: bool,
    ) -> bool {
        self.rx.clear();
        let head = response.message();
        let mut packet = BytesMut::with_capacity(head.len() + body.len());
        packet.put_slice(head.as_bytes());
        packet.put_slice(body);
        if !conn.send(packet.freeze()) {
            debug!(connection = %conn.id(), "response dropped, connection not open");
            return false;
        }
        debug!(
            connection = %conn.id(),
            status = response.status().code(),
            keep_alive,
            "http response queued"
        );
        if !keep_alive {
            conn.disconnect();
        }
        keep_alive
    }
}

/// 以闭包回应每个完整请求的连接处理器。
///
/// 闭包收到请求与消息体，返回响应头部与消息体；`Content-Length` 取自返回的 [`Response`]。
pub struct HttpResponder<F, R = HeadRequestReceiver> {
    http: HttpConnection<R>,
    respond: F,
}

impl<F> HttpResponder<F> {
    pub fn new(respond: F) -> Self {
        Self {
            http: HttpConnection::default(),
            respond,
        }
    }
}

impl<F, R> HttpResponder<F, R> {
    pub fn with_receiver(rx: R, respond: F) -> Self {
        Self {
            http: HttpConnection { rx },
            respond,
        }
    }
}

impl<A, F, R> ConnectionHandler<A> for HttpResponder<F, R>
where
    A: SocketAdaptor,
    R: RequestReceiver,
    F: FnMut(&Request, &[u8]) -> (Response, Bytes),
{
    fn on_event(&mut self, conn: &mut Connection<'_, A>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Received => {
                while self.http.receive(conn) {
                    let (response, body) = (self.respond)(self.http.request(), self.http.body());
                    if !self.http.send_response(conn, response, &body) {
                        break;
                    }
                }
            }
            ConnectionEvent::Error(error) => {
                warn!(connection = %conn.id(), code = error.code(), %error, "http connection failed");
            }
            ConnectionEvent::ReceiveTimedOut => {
                debug!(connection = %conn.id(), "idle http connection timed out");
            }
            _ => {}
        }
    }
}
