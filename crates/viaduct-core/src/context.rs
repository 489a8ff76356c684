use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::AtomicU8,
    },
};

use bytes::Bytes;
use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::AbortHandle,
};
use tracing::{debug, trace};

use crate::{
    adaptor::SocketAdaptor,
    config::ConnectionConfig,
    connection::{BufferedConnection, ConnectionState},
    error::{CommsError, Result},
    facade::{ConnectionHandle, ConnectionHandler, Entry},
};

/// 连接在事件上下文中的代际句柄。
///
/// `index` 定位槽位，`generation` 在槽位被释放时递增；在途回调携带旧代际时会被直接丢弃，
/// 从而连接在 IO 未完成时被拆除也不会出现悬垂访问。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// 适配器操作完成后投递回上下文的结果。
pub(crate) enum Completion {
    Resolved {
        host: String,
        port: u16,
        result: io::Result<Vec<SocketAddr>>,
    },
    Connect {
        candidate: SocketAddr,
        result: io::Result<()>,
    },
    Handshake(io::Result<()>),
    Read {
        result: io::Result<usize>,
        buf: Vec<u8>,
    },
    Write(io::Result<usize>),
    Shutdown(io::Error),
    Timer {
        seq: u64,
    },
}

/// 外部持有者经 [`ConnectionHandle`] 投递的指令。
pub(crate) enum Command {
    Connect { host: String, port: u16 },
    ConnectAddrs(Vec<SocketAddr>),
    Start { is_server: bool },
    Send(Bytes),
    Disconnect,
}

type PostFn = Box<dyn FnOnce(&mut IoContext) + Send>;

pub(crate) enum Event {
    Completion(ConnectionId, Completion),
    Command(ConnectionId, Command),
    Post(PostFn),
    Wake,
}

/// 槽位处理一次事件后的去留。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Live,
    Released,
}

/// 类型擦除后的槽位条目，使同一上下文可以容纳不同适配器的连接。
pub(crate) trait Driver {
    fn complete(&mut self, completion: Completion, scheduler: &Scheduler) -> Disposition;

    fn command(&mut self, command: Command, scheduler: &Scheduler) -> Disposition;
}

/// 把适配器操作派发到运行时，并把结果作为事件送回上下文。
#[derive(Clone)]
pub(crate) struct Scheduler {
    runtime: Handle,
    events: mpsc::UnboundedSender<Event>,
}

impl Scheduler {
    pub(crate) fn spawn<F>(&self, id: ConnectionId, operation: F) -> AbortHandle
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let events = self.events.clone();
        self.runtime
            .spawn(async move {
                let completion = operation.await;
                // 上下文已销毁时结果无人接收，直接丢弃。
                let _ = events.send(Event::Completion(id, completion));
            })
            .abort_handle()
    }

    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<Event> {
        &self.events
    }
}

struct Slot {
    generation: u32,
    entry: Option<Box<dyn Driver>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Slots {
    fn insert_with<F>(&mut self, build: F) -> ConnectionId
    where
        F: FnOnce(ConnectionId) -> Box<dyn Driver>,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ConnectionId {
            index,
            generation: slot.generation,
        };
        slot.entry = Some(build(id));
        self.live += 1;
        id
    }

    fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Box<dyn Driver>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Box<dyn Driver>> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_some())
    }
}

/// 事件处理上下文：连接状态唯一的修改者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有连接的状态机都只在 [`IoContext::run`] 所在的任务里推进，
///   适配器操作在运行时上并发执行，但其结果一律以事件形式排队回到这里；
/// - 上下文是显式依赖而非进程级单例，同一进程可以并存多组互不相干的连接。
///
/// ## 契约（What）
/// - [`IoContext::register`]：把适配器、配置与事件处理器装入新槽位，返回外部句柄；
/// - [`IoContext::run_until_idle`]：推进事件直到所有连接都已释放；
/// - [`IoContext::run`]：在此基础上还会等待所有 [`ContextHandle`] 被丢弃（监听器持有它）；
/// - [`IoContext::poll`]：只处理已排队的事件，不等待。
///
/// ## 注意事项（Trade-offs）
/// - 处理器无需 `Send`，因此 `IoContext` 本身也不是 `Send`，需要在创建它的任务里驱动；
/// - 终止信号送达后槽位立即释放，代际递增，之后的旧句柄操作全部成为空操作。
pub struct IoContext {
    scheduler: Scheduler,
    events: mpsc::UnboundedReceiver<Event>,
    slots: Slots,
    handles: Arc<()>,
}

impl IoContext {
    /// 绑定到当前 Tokio 运行时。
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| CommsError::NoRuntime)?;
        Ok(Self::with_runtime(runtime))
    }

    /// 绑定到指定运行时；适配器操作都会派发到它上面。
    pub fn with_runtime(runtime: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            scheduler: Scheduler {
                runtime,
                events: tx,
            },
            events: rx,
            slots: Slots::default(),
            handles: Arc::new(()),
        }
    }

    /// 可跨任务传递的投递句柄。
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            events: self.scheduler.events.clone(),
            token: Some(Arc::clone(&self.handles)),
        }
    }

    /// 注册一条新连接，初始状态为 [`ConnectionState::Idle`]。
    pub fn register<A, H>(
        &mut self,
        adaptor: A,
        config: ConnectionConfig,
        handler: H,
    ) -> Result<ConnectionHandle>
    where
        A: SocketAdaptor,
        H: ConnectionHandler<A> + 'static,
    {
        config.validate()?;
        let status = Arc::new(AtomicU8::new(ConnectionState::Idle as u8));
        let shared = Arc::clone(&status);
        let id = self.slots.insert_with(move |id| {
            let connection = BufferedConnection::new(id, adaptor, config, shared);
            Box::new(Entry::new(connection, Box::new(handler)))
        });
        debug!(connection = %id, "connection registered");
        Ok(ConnectionHandle::new(
            id,
            self.scheduler.events.clone(),
            status,
        ))
    }

    /// 仍处于活动状态的连接数量。
    pub fn connection_count(&self) -> usize {
        self.slots.live
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.slots.contains(id)
    }

    /// 处理当前已排队的全部事件，返回处理的数量。
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            processed += 1;
        }
        processed
    }

    pub async fn run_until_idle(&mut self) {
        self.poll();
        while self.slots.live > 0 {
            match self.events.recv().await {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    pub async fn run(&mut self) {
        loop {
            self.poll();
            if self.slots.live == 0 && Arc::strong_count(&self.handles) == 1 {
                break;
            }
            match self.events.recv().await {
                Some(event) => self.dispatch(event),
                None => break,
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let (id, disposition) = match event {
            Event::Completion(id, completion) => {
                let Some(entry) = self.slots.get_mut(id) else {
                    trace!(connection = %id, "completion for released connection dropped");
                    return;
                };
                (id, entry.complete(completion, &self.scheduler))
            }
            Event::Command(id, command) => {
                let Some(entry) = self.slots.get_mut(id) else {
                    trace!(connection = %id, "command for released connection dropped");
                    return;
                };
                (id, entry.command(command, &self.scheduler))
            }
            Event::Post(post) => {
                post(self);
                return;
            }
            Event::Wake => return,
        };
        if disposition == Disposition::Released {
            self.slots.remove(id);
            debug!(connection = %id, "connection released");
        }
    }
}

/// 投递到 [`IoContext`] 的句柄，可在其它任务或线程中使用。
///
/// 只要仍有句柄存活，[`IoContext::run`] 就不会因为暂时没有连接而返回。
#[derive(Clone)]
pub struct ContextHandle {
    events: mpsc::UnboundedSender<Event>,
    token: Option<Arc<()>>,
}

impl ContextHandle {
    /// 在上下文任务中执行 `f`；上下文已销毁时返回 `false`。
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut IoContext) + Send + 'static,
    {
        self.events.send(Event::Post(Box::new(f))).is_ok()
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        // 先释放计数再唤醒 `run`，使其重新检查是否已无句柄存活。
        drop(self.token.take());
        let _ = self.events.send(Event::Wake);
    }
}
