use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::{
    adaptor::SocketAdaptor,
    config::ConnectionConfig,
    context::{Command, Completion, ConnectionId, Scheduler},
    error::{self, CommsError, OperationKind, is_candidate_unreachable},
    facade::ConnectionEvent,
    timer::{DeadlineTimer, TimerRole},
};

/// 连接状态机的状态。
///
/// `Idle → Connecting → Connected → {Disconnecting → Closed | Error}`，
/// 任意状态遇到未分类的 IO 错误都会进入 `Error`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Closed = 4,
    Error = 5,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Error,
        }
    }

    /// 是否已到达终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }
}

/// 进入 `Disconnecting` 的原因，决定关闭完成后上报哪个终止信号。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShutdownReason {
    Disconnect,
    ReceiveTimeout,
}

#[derive(Debug, Default)]
struct PendingOps {
    establish: Option<AbortHandle>,
    read: Option<AbortHandle>,
    write: Option<AbortHandle>,
    shutdown: Option<AbortHandle>,
}

impl PendingOps {
    fn abort_all(&mut self) {
        for handle in [
            self.establish.take(),
            self.read.take(),
            self.write.take(),
            self.shutdown.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// 建立在任意 [`SocketAdaptor`] 之上的缓冲连接。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 固定容量的接收缓冲区：读操作在途时缓冲区随操作一起被移走，完成后归还，
///   因此所有者永远不会读到尚未完成的填充；收到的字节被复制进接收队列，
///   由 `read_data` 按到达顺序取出；
/// - 接收队列非空时不再发起读取，所有者取空队列后才恢复，未消费的数据至多一个缓冲区；
/// - 发送队列先进先出，同一时刻最多一个写操作在途：队列由空变非空时派发，
///   或上一个写完成且队列仍有数据时派发；
/// - 终止信号（断开、错误、建连超时、接收超时）至多一次，其后不再产生任何事件。
///
/// ## 逻辑（How）
/// - 每个异步操作都在运行时上执行，结果以 [`Completion`] 回到上下文，
///   再由本结构体按当前状态决定是否采纳；状态不匹配的完成事件直接丢弃；
/// - 建连超时与空闲超时共用 [`DeadlineTimer`]；
/// - 解析得到的候选地址按顺序尝试，仅“该地址不可达”类错误才回退到下一个候选。
///
/// ## 注意事项（Trade-offs）
/// - `disconnect` 会等待已排队的数据写完再半关闭；超时触发的关闭则立即进行；
/// - `Disconnecting` 期间空闲计时器保持布防：写出停滞时到期即放弃剩余数据并关闭，
///   关闭本身停滞时再次到期即强制释放；未配置空闲超时则排空不设上限；
/// - 只在 `Connected` 状态继续发起读取，进入 `Disconnecting` 后不再补读。
pub struct BufferedConnection<A: SocketAdaptor> {
    id: ConnectionId,
    adaptor: Arc<A>,
    config: ConnectionConfig,
    state: ConnectionState,
    status: Arc<AtomicU8>,
    rx_buffer: Option<Vec<u8>>,
    rx_queue: VecDeque<Bytes>,
    tx_queue: VecDeque<Bytes>,
    candidates: VecDeque<SocketAddr>,
    timer: DeadlineTimer,
    ops: PendingOps,
    shutdown_reason: Option<ShutdownReason>,
    signals: VecDeque<ConnectionEvent>,
    finished: bool,
}

impl<A: SocketAdaptor> BufferedConnection<A> {
    pub(crate) fn new(
        id: ConnectionId,
        adaptor: A,
        config: ConnectionConfig,
        status: Arc<AtomicU8>,
    ) -> Self {
        let rx_buffer = vec![0u8; config.rx_buffer_size()];
        adaptor.configure(&config);
        Self {
            id,
            adaptor: Arc::new(adaptor),
            config,
            state: ConnectionState::Idle,
            status,
            rx_buffer: Some(rx_buffer),
            rx_queue: VecDeque::new(),
            tx_queue: VecDeque::new(),
            candidates: VecDeque::new(),
            timer: DeadlineTimer::default(),
            ops: PendingOps::default(),
            shutdown_reason: None,
            signals: VecDeque::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    pub(crate) fn status(&self) -> &Arc<AtomicU8> {
        &self.status
    }

    pub fn read_pending(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    /// 取出最早到达的一段数据；没有数据时返回空缓冲。队列取空后恢复接收。
    pub(crate) fn read_data(&mut self, scheduler: &Scheduler) -> Bytes {
        let data = self.rx_queue.pop_front().unwrap_or_default();
        if self.rx_queue.is_empty() {
            self.enable_reception(scheduler);
        }
        data
    }

    /// 仍在发送队列中的缓冲数量（含在途的一个）。
    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    pub(crate) fn next_signal(&mut self) -> Option<ConnectionEvent> {
        self.signals.pop_front()
    }

    /// 终止信号已送达处理器，槽位可以释放。
    pub(crate) fn is_finished(&self) -> bool {
        self.finished && self.signals.is_empty()
    }

    pub(crate) fn on_command(&mut self, command: Command, scheduler: &Scheduler) {
        match command {
            Command::Connect { host, port } => {
                self.connect(host, port, scheduler);
            }
            Command::ConnectAddrs(candidates) => {
                self.connect_addrs(candidates, scheduler);
            }
            Command::Start { is_server } => {
                self.start(is_server, scheduler);
            }
            Command::Send(data) => {
                if !self.send(data, scheduler) {
                    trace!(connection = %self.id, state = ?self.state, "send dropped: not connected");
                }
            }
            Command::Disconnect => self.disconnect(scheduler),
        }
    }

    pub(crate) fn on_completion(&mut self, completion: Completion, scheduler: &Scheduler) {
        match completion {
            Completion::Resolved { host, port, result } => {
                self.on_resolved(host, port, result, scheduler)
            }
            Completion::Connect { candidate, result } => {
                self.on_connect(candidate, result, scheduler)
            }
            Completion::Handshake(result) => self.on_handshake(result, scheduler),
            Completion::Read { result, buf } => self.on_read(result, buf, scheduler),
            Completion::Write(result) => self.on_write(result, scheduler),
            Completion::Shutdown(end) => self.on_shutdown(end),
            Completion::Timer { seq } => self.on_timer(seq, scheduler),
        }
    }

    /// 解析主机名后按顺序尝试各候选地址。
    pub(crate) fn connect(&mut self, host: String, port: u16, scheduler: &Scheduler) -> bool {
        if !self.begin_connecting(scheduler) {
            return false;
        }
        debug!(connection = %self.id, %host, port, "resolving");
        let handle = scheduler.spawn(self.id, async move {
            let result = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect::<Vec<_>>());
            Completion::Resolved { host, port, result }
        });
        self.ops.establish = Some(handle);
        true
    }

    /// 跳过解析，直接按给定顺序尝试候选地址。
    pub(crate) fn connect_addrs(&mut self, candidates: Vec<SocketAddr>, scheduler: &Scheduler) -> bool {
        if !self.begin_connecting(scheduler) {
            return false;
        }
        self.candidates = candidates.into();
        self.try_next_candidate(scheduler);
        true
    }

    /// 适配器已就绪（已接受的流、配置完成的 UDP 套接字）时直接握手并进入 `Connected`。
    pub(crate) fn start(&mut self, is_server: bool, scheduler: &Scheduler) -> bool {
        if !self.begin_connecting(scheduler) {
            return false;
        }
        self.spawn_handshake(is_server, scheduler);
        true
    }

    /// 排队发送；未处于 `Connected` 时拒绝并返回 `false`。
    pub(crate) fn send(&mut self, data: Bytes, scheduler: &Scheduler) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        self.tx_queue.push_back(data);
        if self.ops.write.is_none() {
            self.write_next(scheduler);
        }
        true
    }

    /// 主动断开；重复调用或在终态调用均为空操作。
    pub(crate) fn disconnect(&mut self, scheduler: &Scheduler) {
        match self.state {
            ConnectionState::Idle => {
                self.close();
                self.terminate(ConnectionEvent::Disconnected);
            }
            ConnectionState::Connecting => {
                self.timer.cancel();
                if let Some(handle) = self.ops.establish.take() {
                    handle.abort();
                }
                self.begin_shutdown(ShutdownReason::Disconnect);
                self.start_shutdown(scheduler);
            }
            ConnectionState::Connected => {
                self.begin_shutdown(ShutdownReason::Disconnect);
                if self.ops.write.is_none() {
                    self.start_shutdown(scheduler);
                }
                self.restart_receive_timer(scheduler);
            }
            ConnectionState::Disconnecting | ConnectionState::Closed | ConnectionState::Error => {
                trace!(connection = %self.id, state = ?self.state, "disconnect ignored");
            }
        }
    }

    fn begin_connecting(&mut self, scheduler: &Scheduler) -> bool {
        if self.state != ConnectionState::Idle {
            warn!(connection = %self.id, state = ?self.state, "connect requested outside idle state");
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        if let Some(timeout) = self.config.connect_timeout() {
            self.timer
                .arm(TimerRole::Connect, timeout, self.id, scheduler);
        }
        true
    }

    fn try_next_candidate(&mut self, scheduler: &Scheduler) {
        let Some(candidate) = self.candidates.pop_front() else {
            self.fail(CommsError::io(
                error::CONNECT,
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate address"),
            ));
            return;
        };
        trace!(connection = %self.id, %candidate, "connecting");
        let adaptor = Arc::clone(&self.adaptor);
        let handle = scheduler.spawn(self.id, async move {
            let result = adaptor.connect_socket(candidate).await;
            Completion::Connect { candidate, result }
        });
        self.ops.establish = Some(handle);
    }

    fn spawn_handshake(&mut self, is_server: bool, scheduler: &Scheduler) {
        let adaptor = Arc::clone(&self.adaptor);
        let handle = scheduler.spawn(self.id, async move {
            Completion::Handshake(adaptor.handshake(is_server).await)
        });
        self.ops.establish = Some(handle);
    }

    fn on_resolved(
        &mut self,
        host: String,
        port: u16,
        result: io::Result<Vec<SocketAddr>>,
        scheduler: &Scheduler,
    ) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        match result {
            Ok(candidates) if candidates.is_empty() => {
                self.fail(CommsError::NoAddress { host, port });
            }
            Ok(candidates) => {
                debug!(connection = %self.id, %host, count = candidates.len(), "resolved");
                self.candidates = candidates.into();
                self.try_next_candidate(scheduler);
            }
            Err(source) => self.fail(CommsError::Resolve { host, port, source }),
        }
    }

    fn on_connect(
        &mut self,
        candidate: SocketAddr,
        result: io::Result<()>,
        scheduler: &Scheduler,
    ) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        match result {
            Ok(()) => {
                debug!(connection = %self.id, %candidate, "socket connected");
                self.spawn_handshake(false, scheduler);
            }
            Err(source) if is_candidate_unreachable(&source) && !self.candidates.is_empty() => {
                warn!(connection = %self.id, %candidate, error = %source, "candidate unreachable, trying next");
                self.adaptor.close();
                self.try_next_candidate(scheduler);
            }
            Err(source) => self.fail(CommsError::Connect {
                addr: candidate,
                source,
            }),
        }
    }

    fn on_handshake(&mut self, result: io::Result<()>, scheduler: &Scheduler) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.ops.establish = None;
        match result {
            Ok(()) => {
                self.timer.cancel();
                self.candidates.clear();
                self.set_state(ConnectionState::Connected);
                debug!(connection = %self.id, "connected");
                self.enable_reception(scheduler);
                self.emit(ConnectionEvent::Connected);
                self.restart_receive_timer(scheduler);
            }
            Err(source) => self.fail(CommsError::io(error::HANDSHAKE, source)),
        }
    }

    fn enable_reception(&mut self, scheduler: &Scheduler) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(mut buf) = self.rx_buffer.take() else {
            return;
        };
        let adaptor = Arc::clone(&self.adaptor);
        let handle = scheduler.spawn(self.id, async move {
            let result = adaptor.read(&mut buf).await;
            Completion::Read { result, buf }
        });
        self.ops.read = Some(handle);
    }

    fn on_read(&mut self, result: io::Result<usize>, buf: Vec<u8>, scheduler: &Scheduler) {
        self.ops.read = None;
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.rx_buffer = Some(buf);
            return;
        }
        match result {
            Ok(received) => {
                if received > 0 {
                    trace!(connection = %self.id, received, "data received");
                    self.rx_queue
                        .push_back(Bytes::copy_from_slice(&buf[..received]));
                    self.emit(ConnectionEvent::Received);
                    self.restart_receive_timer(scheduler);
                }
                self.rx_buffer = Some(buf);
                if self.rx_queue.is_empty() {
                    self.enable_reception(scheduler);
                }
            }
            Err(source) => {
                self.rx_buffer = Some(buf);
                self.on_io_error(error::READ, source);
            }
        }
    }

    fn write_next(&mut self, scheduler: &Scheduler) {
        let Some(front) = self.tx_queue.front().cloned() else {
            return;
        };
        let adaptor = Arc::clone(&self.adaptor);
        let handle = scheduler.spawn(self.id, async move {
            let bufs = [front];
            Completion::Write(adaptor.write(&bufs).await)
        });
        self.ops.write = Some(handle);
    }

    fn on_write(&mut self, result: io::Result<usize>, scheduler: &Scheduler) {
        self.ops.write = None;
        let draining = self.state == ConnectionState::Disconnecting
            && self.shutdown_reason == Some(ShutdownReason::Disconnect)
            && self.ops.shutdown.is_none();
        if self.state != ConnectionState::Connected && !draining {
            return;
        }
        match result {
            Ok(sent) => {
                trace!(connection = %self.id, sent, "data sent");
                self.tx_queue.pop_front();
                self.emit(ConnectionEvent::Sent);
                self.restart_receive_timer(scheduler);
                if !self.tx_queue.is_empty() {
                    self.write_next(scheduler);
                } else if draining {
                    self.start_shutdown(scheduler);
                }
            }
            Err(source) => self.on_io_error(error::WRITE, source),
        }
    }

    fn on_io_error(&mut self, kind: OperationKind, source: io::Error) {
        if self.state == ConnectionState::Disconnecting {
            trace!(connection = %self.id, error = %source, "io ended while disconnecting");
            self.finish_shutdown();
        } else if self.adaptor.is_disconnect(&source) {
            debug!(connection = %self.id, error = %source, "peer disconnected");
            self.close();
            self.terminate(ConnectionEvent::Disconnected);
        } else {
            warn!(connection = %self.id, error = %source, op = kind.message, "io error");
            self.fail(CommsError::io(kind, source));
        }
    }

    fn begin_shutdown(&mut self, reason: ShutdownReason) {
        self.shutdown_reason = Some(reason);
        self.set_state(ConnectionState::Disconnecting);
    }

    fn start_shutdown(&mut self, scheduler: &Scheduler) {
        if self.ops.shutdown.is_some() {
            return;
        }
        let adaptor = Arc::clone(&self.adaptor);
        let handle = scheduler.spawn(self.id, async move {
            Completion::Shutdown(adaptor.shutdown().await)
        });
        self.ops.shutdown = Some(handle);
    }

    fn on_shutdown(&mut self, end: io::Error) {
        self.ops.shutdown = None;
        if self.state != ConnectionState::Disconnecting {
            return;
        }
        trace!(connection = %self.id, end = %end, "shutdown completed");
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        let event = match self.shutdown_reason.take() {
            Some(ShutdownReason::ReceiveTimeout) => ConnectionEvent::ReceiveTimedOut,
            _ => ConnectionEvent::Disconnected,
        };
        self.close();
        self.terminate(event);
    }

    fn restart_receive_timer(&mut self, scheduler: &Scheduler) {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return;
        }
        if let Some(timeout) = self.config.receive_timeout() {
            self.timer
                .arm(TimerRole::Receive, timeout, self.id, scheduler);
        }
    }

    fn on_timer(&mut self, seq: u64, scheduler: &Scheduler) {
        match (self.timer.fired(seq), self.state) {
            (Some(TimerRole::Connect), ConnectionState::Connecting) => {
                warn!(connection = %self.id, "connection timed out");
                self.close();
                self.terminate(ConnectionEvent::ConnectionTimedOut);
            }
            (Some(TimerRole::Receive), ConnectionState::Connected) => {
                debug!(connection = %self.id, "receive timed out");
                self.begin_shutdown(ShutdownReason::ReceiveTimeout);
                self.abort_write();
                self.start_shutdown(scheduler);
                self.restart_receive_timer(scheduler);
            }
            (Some(TimerRole::Receive), ConnectionState::Disconnecting) => {
                if self.ops.shutdown.is_some() {
                    warn!(connection = %self.id, "shutdown stalled, closing");
                    self.finish_shutdown();
                } else {
                    warn!(
                        connection = %self.id,
                        queued = self.tx_queue.len(),
                        "pending writes stalled, shutting down"
                    );
                    self.abort_write();
                    self.start_shutdown(scheduler);
                    self.restart_receive_timer(scheduler);
                }
            }
            (None, _) => trace!(connection = %self.id, seq, "cancelled timer ignored"),
            (Some(role), state) => {
                trace!(connection = %self.id, ?role, ?state, "timer fired outside its state")
            }
        }
    }

    /// 放弃在途的写；已经排进上下文的完成事件会因关闭已开始而被 `on_write` 丢弃。
    fn abort_write(&mut self) {
        if let Some(handle) = self.ops.write.take() {
            handle.abort();
        }
    }

    /// 取消所有在途操作与计时器并关闭适配器。
    fn close(&mut self) {
        self.timer.cancel();
        self.ops.abort_all();
        self.adaptor.close();
        self.tx_queue.clear();
    }

    fn fail(&mut self, error: CommsError) {
        warn!(connection = %self.id, code = error.code(), %error, "connection failed");
        self.close();
        self.terminate(ConnectionEvent::Error(error));
    }

    fn terminate(&mut self, event: ConnectionEvent) {
        if self.finished {
            return;
        }
        self.finished = true;
        let state = match event {
            ConnectionEvent::Error(_) | ConnectionEvent::ConnectionTimedOut => {
                ConnectionState::Error
            }
            _ => ConnectionState::Closed,
        };
        self.set_state(state);
        debug!(connection = %self.id, ?state, "terminal signal");
        self.signals.push_back(event);
    }

    fn emit(&mut self, event: ConnectionEvent) {
        if !self.finished {
            self.signals.push_back(event);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.status.store(state as u8, Ordering::Release);
    }
}

impl<A: SocketAdaptor> Drop for BufferedConnection<A> {
    fn drop(&mut self) {
        self.timer.cancel();
        self.ops.abort_all();
        self.adaptor.close();
    }
}
