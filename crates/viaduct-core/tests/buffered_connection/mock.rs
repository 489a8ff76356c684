//! 可编排的内存适配器：建连结果按候选地址预设，入站数据经通道注入，出站数据被记录。

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use viaduct_core::{SocketAdaptor, end_of_stream};

/// 某个候选地址的建连行为，也用于编排写出与关闭。
#[derive(Clone, Copy, Debug)]
pub enum Dial {
    Accept,
    Fail(io::ErrorKind),
    Hang,
}

#[derive(Default)]
pub struct Probe {
    pub attempts: Mutex<Vec<SocketAddr>>,
    pub reads: AtomicUsize,
    pub written: Mutex<Vec<Bytes>>,
    pub writes_in_flight: AtomicUsize,
    pub max_writes_in_flight: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Probe {
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().clone()
    }
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
}

pub struct MockAdaptor {
    dials: HashMap<SocketAddr, Dial>,
    writes: Dial,
    shutdowns: Dial,
    inbound: AsyncMutex<Inbound>,
    probe: Arc<Probe>,
}

impl MockAdaptor {
    /// 返回适配器、入站注入端与观测探针；丢弃注入端等价于对端关闭。
    pub fn new() -> (Self, mpsc::UnboundedSender<Vec<u8>>, Arc<Probe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(Probe::default());
        let adaptor = Self {
            dials: HashMap::new(),
            writes: Dial::Accept,
            shutdowns: Dial::Accept,
            inbound: AsyncMutex::new(Inbound {
                rx,
                leftover: Vec::new(),
            }),
            probe: Arc::clone(&probe),
        };
        (adaptor, tx, probe)
    }

    pub fn dial(mut self, addr: SocketAddr, behavior: Dial) -> Self {
        self.dials.insert(addr, behavior);
        self
    }

    /// `Dial::Hang` 模拟不再读取的对端：写操作永不完成。
    pub fn writes(mut self, behavior: Dial) -> Self {
        self.writes = behavior;
        self
    }

    pub fn shutdowns(mut self, behavior: Dial) -> Self {
        self.shutdowns = behavior;
        self
    }
}

#[async_trait]
impl SocketAdaptor for MockAdaptor {
    type Socket = ();

    async fn handshake(&self, _is_server: bool) -> io::Result<()> {
        Ok(())
    }

    async fn connect_socket(&self, candidate: SocketAddr) -> io::Result<()> {
        self.probe.attempts.lock().push(candidate);
        match self.dials.get(&candidate).copied().unwrap_or(Dial::Accept) {
            Dial::Accept => Ok(()),
            Dial::Fail(kind) => Err(io::Error::from(kind)),
            Dial::Hang => std::future::pending().await,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        let mut inbound = self.inbound.lock().await;
        if inbound.leftover.is_empty() {
            match inbound.rx.recv().await {
                Some(chunk) => inbound.leftover = chunk,
                None => return Err(end_of_stream()),
            }
        }
        let n = buf.len().min(inbound.leftover.len());
        buf[..n].copy_from_slice(&inbound.leftover[..n]);
        inbound.leftover.drain(..n);
        Ok(n)
    }

    async fn write(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let now = self.probe.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe
            .max_writes_in_flight
            .fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        match self.writes {
            Dial::Accept => {}
            Dial::Fail(kind) => {
                self.probe.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::from(kind));
            }
            Dial::Hang => std::future::pending().await,
        }
        let mut total = 0;
        for buf in bufs {
            total += buf.len();
            self.probe.written.lock().push(buf.clone());
        }
        self.probe.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(total)
    }

    async fn shutdown(&self) -> io::Error {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        match self.shutdowns {
            Dial::Hang => std::future::pending().await,
            Dial::Fail(kind) => io::Error::from(kind),
            Dial::Accept => end_of_stream(),
        }
    }

    fn close(&self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_disconnect(&self, error: &io::Error) -> bool {
        matches!(
            error.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
        )
    }

    fn socket(&self) -> Option<Arc<()>> {
        None
    }
}
