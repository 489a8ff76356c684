use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV6, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tokio::{net::UdpSocket, runtime::Handle};
use tracing::{debug, trace, warn};
use viaduct_core::{ConnectionConfig, SocketAdaptor, end_of_stream};

use crate::error::{BIND, CONFIGURE, CONNECT, JOIN, OPEN, UdpSetupError};

/// 已加入的组播组记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MulticastMembership {
    group: IpAddr,
    interface: Option<IpAddr>,
    interface_index: u32,
}

impl MulticastMembership {
    pub fn group(&self) -> IpAddr {
        self.group
    }

    /// 加入组时指定的本地接口；`None` 表示由系统选择。
    pub fn interface(&self) -> Option<IpAddr> {
        self.interface
    }

    /// IPv6 加入组时使用的接口索引，取自监听地址的 `%<index>` 后缀；`0` 为系统默认接口。
    pub fn interface_index(&self) -> u32 {
        self.interface_index
    }
}

/// UDP 适配器：一个套接字，外加接收端点与发送端点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让同一套缓冲连接既能跑在“连接式”单播上，也能跑在绑定单播、组播与广播上；
///   模式差异全部体现在配置阶段与读写时选用的目标地址。
///
/// ## 契约（What）
/// - 配置阶段（注册到上下文之前）通过 `&mut self` 方法完成：
///   `receive_multicast`、`transmit_multicast`、`receive_broadcast`、`transmit_broadcast`、
///   `connect`、`bind`；每个方法返回 `bool`，对应的 `try_*` 版本返回具体错误；
/// - 只有 `connect` 成功后 `is_connected` 才为真：此时读写都面向隐式对端；
///   否则读取记录发送方到接收端点，写出发往发送端点；
/// - 配置成功后由持有者调用 `start` 把连接标记为可收发，适配器本身没有握手；
/// - `shutdown` 总是以流结束收尾，`is_disconnect` 恒为 `false`。
///
/// ## 逻辑（How）
/// - 套接字首次需要时经 `socket2` 创建（地址族由该次操作的地址决定），
///   设为非阻塞后交给 Tokio；之后的复用、绑定、广播与组播选项都作用在同一个描述符上；
/// - 配置失败的回滚规则：本次调用新打开的套接字会被关闭；调用前已打开的套接字保持打开；
///   接收端点与组成员记录只在整步成功后写入；加入组播组总是最后一步，
///   所以失败时不会残留组成员关系。
///
/// ## 注意事项（Trade-offs）
/// - `connect` 同步解析主机名并只尝试第一个结果，不做候选回退；
/// - 每个发送缓冲对应一个数据报，超出 MTU 的缓冲由内核决定是否分片。
#[derive(Debug)]
pub struct UdpAdaptor {
    socket: ArcSwapOption<UdpSocket>,
    ipv6: bool,
    rx_endpoint: Mutex<SocketAddr>,
    tx_endpoint: SocketAddr,
    is_connected: AtomicBool,
    multicast: Option<MulticastMembership>,
    broadcast: bool,
}

impl Default for UdpAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpAdaptor {
    /// UDP 连接推荐的接收缓冲区大小。
    pub const DEFAULT_RX_BUFFER_SIZE: usize = 2048;

    pub fn new() -> Self {
        Self {
            socket: ArcSwapOption::empty(),
            ipv6: false,
            rx_endpoint: Mutex::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            tx_endpoint: SocketAddr::from((Ipv4Addr::BROADCAST, 0)),
            is_connected: AtomicBool::new(false),
            multicast: None,
            broadcast: false,
        }
    }

    /// 接收缓冲区取 [`UdpAdaptor::DEFAULT_RX_BUFFER_SIZE`] 的默认配置。
    pub fn recommended_config() -> ConnectionConfig {
        ConnectionConfig::default().with_rx_buffer_size(Self::DEFAULT_RX_BUFFER_SIZE)
    }

    pub fn is_open(&self) -> bool {
        self.socket.load().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// 最近一次收到数据报的发送方；绑定后、收到数据前为绑定地址。
    pub fn rx_endpoint(&self) -> SocketAddr {
        *self.rx_endpoint.lock()
    }

    pub fn tx_endpoint(&self) -> SocketAddr {
        self.tx_endpoint
    }

    pub fn multicast_membership(&self) -> Option<MulticastMembership> {
        self.multicast.filter(|_| self.is_open())
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast && self.is_open()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.load().as_ref()?.local_addr().ok()
    }

    /// 在 `port` 上接收组播组 `multicast_address` 的数据报。
    ///
    /// `listen_address` 非空时绑定到该地址并在对应接口上加入组，必须与组地址同一地址族。
    /// IPv6 以数字区域后缀指定接口（如 `fe80::1%3`）；没有后缀时在系统默认接口上加入。
    pub fn receive_multicast(
        &mut self,
        port: u16,
        multicast_address: &str,
        listen_address: &str,
    ) -> bool {
        report(
            "receive_multicast",
            self.try_receive_multicast(port, multicast_address, listen_address),
        )
    }

    pub fn try_receive_multicast(
        &mut self,
        port: u16,
        multicast_address: &str,
        listen_address: &str,
    ) -> Result<(), UdpSetupError> {
        let group = parse_multicast(multicast_address)?;
        let (interface, interface_index) = if listen_address.is_empty() {
            (None, 0)
        } else {
            let (listen, index) = parse_listen(listen_address)?;
            if listen.is_ipv6() != group.is_ipv6() {
                return Err(UdpSetupError::ListenFamilyMismatch { group, listen });
            }
            (Some(listen), index)
        };
        let local = interface.unwrap_or_else(|| unspecified(group.is_ipv6()));
        let rx_endpoint = match local {
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, interface_index)),
            IpAddr::V4(_) => SocketAddr::new(local, port),
        };

        let opened = self.open(group.is_ipv6())?;
        let result = self
            .bind_reusable(rx_endpoint)
            .and_then(|socket| join_group(&socket, group, interface, interface_index));
        self.settle(opened, result)?;
        *self.rx_endpoint.lock() = rx_endpoint;
        self.multicast = Some(MulticastMembership {
            group,
            interface,
            interface_index,
        });
        debug!(%group, %rx_endpoint, "udp multicast reception enabled");
        Ok(())
    }

    /// 以组播方式向 `multicast_address:port` 发送；成功后仍需 `start` 才能收发。
    pub fn transmit_multicast(&mut self, port: u16, multicast_address: &str) -> bool {
        report(
            "transmit_multicast",
            self.try_transmit_multicast(port, multicast_address),
        )
    }

    pub fn try_transmit_multicast(
        &mut self,
        port: u16,
        multicast_address: &str,
    ) -> Result<(), UdpSetupError> {
        let group = parse_multicast(multicast_address)?;
        let opened = self.open(group.is_ipv6())?;
        let result = self.current().and_then(|socket| set_reuse(&socket));
        self.settle(opened, result)?;
        self.tx_endpoint = SocketAddr::new(group, port);
        debug!(tx_endpoint = %self.tx_endpoint, "udp multicast transmission enabled");
        Ok(())
    }

    /// 在 `port` 上接收 IPv4 广播。
    pub fn receive_broadcast(&mut self, port: u16) -> bool {
        report("receive_broadcast", self.try_receive_broadcast(port))
    }

    pub fn try_receive_broadcast(&mut self, port: u16) -> Result<(), UdpSetupError> {
        let rx_endpoint = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let opened = self.open(false)?;
        let result = self.bind_reusable(rx_endpoint).map(drop);
        self.settle(opened, result)?;
        *self.rx_endpoint.lock() = rx_endpoint;
        debug!(%rx_endpoint, "udp broadcast reception enabled");
        Ok(())
    }

    /// 向 `255.255.255.255:port` 广播；成功后仍需 `start` 才能收发。
    pub fn transmit_broadcast(&mut self, port: u16) -> bool {
        report("transmit_broadcast", self.try_transmit_broadcast(port))
    }

    pub fn try_transmit_broadcast(&mut self, port: u16) -> Result<(), UdpSetupError> {
        let opened = self.open(false)?;
        let result = self.current().and_then(|socket| {
            set_reuse(&socket)?;
            socket
                .set_broadcast(true)
                .map_err(UdpSetupError::io(CONFIGURE))
        });
        self.settle(opened, result)?;
        self.tx_endpoint = SocketAddr::from((Ipv4Addr::BROADCAST, port));
        self.broadcast = true;
        debug!(tx_endpoint = %self.tx_endpoint, "udp broadcast transmission enabled");
        Ok(())
    }

    /// 解析 `host` 并把套接字连接到第一个结果，不尝试其余候选。
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        report("connect", self.try_connect(host, port))
    }

    pub fn try_connect(&mut self, host: &str, port: u16) -> Result<(), UdpSetupError> {
        let candidate = (host, port)
            .to_socket_addrs()
            .map_err(|source| UdpSetupError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| UdpSetupError::NoAddress {
                host: host.to_owned(),
                port,
            })?;

        let opened = self.open(candidate.is_ipv6())?;
        let result = self.current().and_then(|socket| {
            SockRef::from(&*socket)
                .connect(&SockAddr::from(candidate))
                .map_err(UdpSetupError::io(CONNECT))
        });
        self.settle(opened, result)?;
        self.tx_endpoint = candidate;
        self.is_connected.store(true, Ordering::Release);
        debug!(peer = %candidate, "udp socket connected");
        Ok(())
    }

    /// 绑定单播模式：在 `addr` 上接收，写出发往 [`UdpAdaptor::set_tx_endpoint`] 设定的地址。
    pub fn bind(&mut self, addr: SocketAddr) -> bool {
        report("bind", self.try_bind(addr))
    }

    pub fn try_bind(&mut self, addr: SocketAddr) -> Result<(), UdpSetupError> {
        let opened = self.open(addr.is_ipv6())?;
        let result = self.bind_reusable(addr).map(drop);
        self.settle(opened, result)?;
        *self.rx_endpoint.lock() = addr;
        Ok(())
    }

    pub fn set_tx_endpoint(&mut self, endpoint: SocketAddr) {
        self.tx_endpoint = endpoint;
    }

    /// 按需打开套接字，返回是否由本次调用新打开。
    fn open(&mut self, ipv6: bool) -> Result<bool, UdpSetupError> {
        if self.is_open() {
            if self.ipv6 != ipv6 {
                return Err(UdpSetupError::SocketFamilyMismatch);
            }
            return Ok(false);
        }
        Handle::try_current().map_err(|_| UdpSetupError::NoRuntime)?;
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(UdpSetupError::io(OPEN))?;
        socket
            .set_nonblocking(true)
            .map_err(UdpSetupError::io(OPEN))?;
        let socket = UdpSocket::from_std(socket.into()).map_err(UdpSetupError::io(OPEN))?;
        self.socket.store(Some(Arc::new(socket)));
        self.ipv6 = ipv6;
        trace!(ipv6, "udp socket opened");
        Ok(true)
    }

    fn current(&self) -> Result<Arc<UdpSocket>, UdpSetupError> {
        self.socket.load_full().ok_or_else(|| UdpSetupError::Io {
            kind: OPEN,
            source: io::Error::from(io::ErrorKind::NotConnected),
        })
    }

    fn bind_reusable(&self, addr: SocketAddr) -> Result<Arc<UdpSocket>, UdpSetupError> {
        let socket = self.current()?;
        set_reuse(&socket)?;
        SockRef::from(&*socket)
            .bind(&SockAddr::from(addr))
            .map_err(UdpSetupError::io(BIND))?;
        Ok(socket)
    }

    /// 失败时关闭本次调用新打开的套接字。
    fn settle(
        &mut self,
        opened: bool,
        result: Result<(), UdpSetupError>,
    ) -> Result<(), UdpSetupError> {
        if result.is_err() && opened {
            self.socket.store(None);
            trace!("udp socket opened by failed setup closed again");
        }
        result
    }
}

#[async_trait]
impl SocketAdaptor for UdpAdaptor {
    type Socket = UdpSocket;

    async fn handshake(&self, _is_server: bool) -> io::Result<()> {
        Ok(())
    }

    async fn connect_socket(&self, _candidate: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self
            .socket
            .load_full()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if self.is_connected() {
            return socket.recv(buf).await;
        }
        let (received, sender) = socket.recv_from(buf).await?;
        *self.rx_endpoint.lock() = sender;
        trace!(%sender, received, "udp datagram received");
        Ok(received)
    }

    async fn write(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let socket = self
            .socket
            .load_full()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let connected = self.is_connected();
        let mut total = 0;
        for buf in bufs {
            total += if connected {
                socket.send(buf).await?
            } else {
                socket.send_to(buf, self.tx_endpoint).await?
            };
        }
        Ok(total)
    }

    async fn shutdown(&self) -> io::Error {
        if let Some(socket) = self.socket.load_full()
            && let Err(err) = SockRef::from(&*socket).shutdown(Shutdown::Both)
        {
            trace!(error = %err, "udp shutdown ignored");
        }
        end_of_stream()
    }

    fn close(&self) {
        if self.socket.swap(None).is_some() {
            self.is_connected.store(false, Ordering::Release);
            trace!("udp socket closed");
        }
    }

    fn is_disconnect(&self, _error: &io::Error) -> bool {
        false
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.load_full()
    }
}

fn report(operation: &'static str, result: Result<(), UdpSetupError>) -> bool {
    match result {
        Ok(()) => true,
        Err(error) => {
            warn!(operation, code = error.code(), %error, "udp setup rejected");
            false
        }
    }
}

fn parse_ip(text: &str) -> Result<IpAddr, UdpSetupError> {
    text.trim()
        .parse()
        .map_err(|_| UdpSetupError::InvalidAddress(text.to_owned()))
}

/// 监听地址，IPv6 可带 `%<index>` 数字区域后缀。
fn parse_listen(text: &str) -> Result<(IpAddr, u32), UdpSetupError> {
    let invalid = || UdpSetupError::InvalidAddress(text.to_owned());
    match text.trim().split_once('%') {
        Some((ip, zone)) => {
            let ip: Ipv6Addr = ip.parse().map_err(|_| invalid())?;
            let index = zone.parse().map_err(|_| invalid())?;
            Ok((IpAddr::V6(ip), index))
        }
        None => Ok((parse_ip(text)?, 0)),
    }
}

fn parse_multicast(text: &str) -> Result<IpAddr, UdpSetupError> {
    let group = parse_ip(text)?;
    if !group.is_multicast() {
        return Err(UdpSetupError::NotMulticast(group));
    }
    Ok(group)
}

fn unspecified(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

fn set_reuse(socket: &UdpSocket) -> Result<(), UdpSetupError> {
    SockRef::from(socket)
        .set_reuse_address(true)
        .map_err(UdpSetupError::io(CONFIGURE))
}

fn join_group(
    socket: &UdpSocket,
    group: IpAddr,
    interface: Option<IpAddr>,
    interface_index: u32,
) -> Result<(), UdpSetupError> {
    let joined = match group {
        IpAddr::V4(group) => {
            let interface = match interface {
                Some(IpAddr::V4(local)) => local,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(group, interface)
        }
        IpAddr::V6(group) => socket.join_multicast_v6(&group, interface_index),
    };
    joined.map_err(UdpSetupError::io(JOIN))
}
