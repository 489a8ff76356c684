use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    adaptor::SocketAdaptor,
    config::ConnectionConfig,
    connection::{BufferedConnection, ConnectionState},
    context::{Command, Completion, ConnectionId, Disposition, Driver, Event, Scheduler},
    error::CommsError,
};

/// 连接向其处理器上报的信号。
///
/// `Disconnected`、`Error`、`ConnectionTimedOut` 与 `ReceiveTimedOut` 为终止信号，
/// 每条连接至多收到其中一个，之后不会再有任何信号。
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    /// 接收队列中至少有一段新数据。
    Received,
    /// 发送队列队首的一段数据已写出。
    Sent,
    Disconnected,
    Error(CommsError),
    ConnectionTimedOut,
    ReceiveTimedOut,
}

impl ConnectionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Disconnected
                | ConnectionEvent::Error(_)
                | ConnectionEvent::ConnectionTimedOut
                | ConnectionEvent::ReceiveTimedOut
        )
    }
}

/// 连接信号的接收方。
///
/// 回调在上下文任务中串行执行；回调内经 [`Connection`] 发起的发送、断开等操作
/// 只会排队，由上下文在本次回调返回后继续处理，不会重入回调。
pub trait ConnectionHandler<A: SocketAdaptor> {
    fn on_event(&mut self, connection: &mut Connection<'_, A>, event: ConnectionEvent);
}

impl<A, F> ConnectionHandler<A> for F
where
    A: SocketAdaptor,
    F: FnMut(&mut Connection<'_, A>, ConnectionEvent),
{
    fn on_event(&mut self, connection: &mut Connection<'_, A>, event: ConnectionEvent) {
        self(connection, event)
    }
}

/// 处理器回调期间对连接的可变视图。
pub struct Connection<'a, A: SocketAdaptor> {
    inner: &'a mut BufferedConnection<A>,
    scheduler: &'a Scheduler,
}

impl<'a, A: SocketAdaptor> Connection<'a, A> {
    pub fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.inner.config()
    }

    pub fn adaptor(&self) -> &A {
        self.inner.adaptor()
    }

    /// 排队发送一段数据；未连接时返回 `false` 且数据被丢弃。
    pub fn send(&mut self, data: impl Into<Bytes>) -> bool {
        self.inner.send(data.into(), self.scheduler)
    }

    pub fn read_pending(&self) -> bool {
        self.inner.read_pending()
    }

    pub fn read_data(&mut self) -> Bytes {
        self.inner.read_data(self.scheduler)
    }

    pub fn tx_queue_len(&self) -> usize {
        self.inner.tx_queue_len()
    }

    pub fn disconnect(&mut self) {
        self.inner.disconnect(self.scheduler)
    }

    /// 可脱离回调保存的外部句柄。
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(
            self.inner.id(),
            self.scheduler.events().clone(),
            Arc::clone(self.inner.status()),
        )
    }
}

/// 连接的外部句柄：可克隆、可跨线程，操作以指令形式投递给上下文。
///
/// 连接释放后句柄上的操作全部成为空操作；`state` 停留在最终状态。
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    events: mpsc::UnboundedSender<Event>,
    status: Arc<AtomicU8>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        events: mpsc::UnboundedSender<Event>,
        status: Arc<AtomicU8>,
    ) -> Self {
        Self { id, events, status }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 解析 `host` 并依次尝试各个地址。
    pub fn connect(&self, host: impl Into<String>, port: u16) -> bool {
        self.post(Command::Connect {
            host: host.into(),
            port,
        })
    }

    pub fn connect_addrs(&self, candidates: Vec<SocketAddr>) -> bool {
        self.post(Command::ConnectAddrs(candidates))
    }

    /// 适配器已就绪时直接握手；`is_server` 决定握手角色。
    pub fn start(&self, is_server: bool) -> bool {
        self.post(Command::Start { is_server })
    }

    /// 连接当前未处于 `Connected` 时立即返回 `false`。
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.post(Command::Send(data.into()))
    }

    pub fn disconnect(&self) -> bool {
        self.post(Command::Disconnect)
    }

    fn post(&self, command: Command) -> bool {
        self.events.send(Event::Command(self.id, command)).is_ok()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// 槽位中的连接与其处理器。
pub(crate) struct Entry<A: SocketAdaptor> {
    connection: BufferedConnection<A>,
    handler: Box<dyn ConnectionHandler<A>>,
}

impl<A: SocketAdaptor> Entry<A> {
    pub(crate) fn new(
        connection: BufferedConnection<A>,
        handler: Box<dyn ConnectionHandler<A>>,
    ) -> Self {
        Self {
            connection,
            handler,
        }
    }

    /// 逐个送出排队的信号；回调中产生的新信号也在本轮送出。
    fn deliver(&mut self, scheduler: &Scheduler) -> Disposition {
        while let Some(event) = self.connection.next_signal() {
            let mut view = Connection {
                inner: &mut self.connection,
                scheduler,
            };
            self.handler.on_event(&mut view, event);
        }
        if self.connection.is_finished() {
            Disposition::Released
        } else {
            Disposition::Live
        }
    }
}

impl<A: SocketAdaptor> Driver for Entry<A> {
    fn complete(&mut self, completion: Completion, scheduler: &Scheduler) -> Disposition {
        self.connection.on_completion(completion, scheduler);
        self.deliver(scheduler)
    }

    fn command(&mut self, command: Command, scheduler: &Scheduler) -> Disposition {
        self.connection.on_command(command, scheduler);
        self.deliver(scheduler)
    }
}
