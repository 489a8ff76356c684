//! `BufferedConnection` 在内存适配器上的生命周期与顺序性验证。
//!
//! # 教案式说明
//! - **Why**：状态机的正确性与具体介质无关，使用可编排的适配器可以精确控制建连结果、
//!   入站数据与时间流逝，覆盖真实网络难以稳定复现的分支；
//! - **How**：每个用例注册一条连接，由记录型处理器收集信号并按需做出反应，
//!   `run_until_idle` 返回即代表终止信号已送达、槽位已释放；
//! - **What**：断言信号序列、出站顺序、在途写数量与适配器调用次数。

mod mock;

use std::{
    cell::RefCell,
    net::SocketAddr,
    rc::Rc,
    sync::atomic::Ordering,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use tracing_test::traced_test;
use viaduct_core::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionHandler, ConnectionState, IoContext,
};

use mock::{Dial, MockAdaptor};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Seen {
    Connected,
    Received,
    Sent,
    Disconnected,
    Error(&'static str),
    ConnectionTimedOut,
    ReceiveTimedOut,
}

impl From<&ConnectionEvent> for Seen {
    fn from(event: &ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Connected => Seen::Connected,
            ConnectionEvent::Received => Seen::Received,
            ConnectionEvent::Sent => Seen::Sent,
            ConnectionEvent::Disconnected => Seen::Disconnected,
            ConnectionEvent::Error(err) => Seen::Error(err.code()),
            ConnectionEvent::ConnectionTimedOut => Seen::ConnectionTimedOut,
            ConnectionEvent::ReceiveTimedOut => Seen::ReceiveTimedOut,
        }
    }
}

type Log = Rc<RefCell<Vec<Seen>>>;
type Reaction = Box<dyn FnMut(&mut Connection<'_, MockAdaptor>, &Seen)>;

struct Recorder {
    seen: Log,
    react: Reaction,
    terminated: bool,
}

impl ConnectionHandler<MockAdaptor> for Recorder {
    fn on_event(&mut self, connection: &mut Connection<'_, MockAdaptor>, event: ConnectionEvent) {
        assert!(!self.terminated, "终止信号之后不应再有信号: {event:?}");
        self.terminated = event.is_terminal();
        let seen = Seen::from(&event);
        self.seen.borrow_mut().push(seen.clone());
        (self.react)(connection, &seen);
    }
}

fn recorder(
    react: impl FnMut(&mut Connection<'_, MockAdaptor>, &Seen) + 'static,
) -> (Recorder, Log) {
    let seen = Log::default();
    let recorder = Recorder {
        seen: Rc::clone(&seen),
        react: Box::new(react),
        terminated: false,
    };
    (recorder, seen)
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn count(seen: &Log, wanted: &Seen) -> usize {
    seen.borrow().iter().filter(|s| *s == wanted).count()
}

#[tokio::test]
async fn queued_sends_are_written_in_order_one_at_a_time() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|conn, event| match event {
        Seen::Connected => {
            for chunk in ["alpha", "beta", "gamma"] {
                assert!(conn.send(chunk));
            }
        }
        Seen::Sent if conn.tx_queue_len() == 0 => conn.disconnect(),
        _ => {}
    });

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    assert!(handle.connect_addrs(vec![addr(7000)]));
    ctx.run_until_idle().await;

    assert_eq!(
        probe.written(),
        vec![
            Bytes::from_static(b"alpha"),
            Bytes::from_static(b"beta"),
            Bytes::from_static(b"gamma"),
        ]
    );
    assert_eq!(probe.max_writes_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.borrow(),
        vec![
            Seen::Connected,
            Seen::Sent,
            Seen::Sent,
            Seen::Sent,
            Seen::Disconnected
        ]
    );
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(ctx.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn received_data_is_returned_in_arrival_order() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, inbound, _probe) = MockAdaptor::new();
    for chunk in ["hello", " wor", "ld"] {
        inbound.send(chunk.as_bytes().to_vec())?;
    }

    let pieces = Rc::new(RefCell::new(Vec::<Bytes>::new()));
    let collected = Rc::clone(&pieces);
    let (handler, _seen) = recorder(move |conn, event| {
        if *event != Seen::Received {
            return;
        }
        while conn.read_pending() {
            collected.borrow_mut().push(conn.read_data());
        }
        let total: usize = collected.borrow().iter().map(Bytes::len).sum();
        if total == "hello world".len() {
            conn.disconnect();
        }
    });

    let config = ConnectionConfig::default().with_rx_buffer_size(4);
    let handle = ctx.register(adaptor, config, handler)?;
    assert!(handle.start(false));
    ctx.run_until_idle().await;

    let pieces = pieces.borrow();
    let joined: Vec<u8> = pieces.iter().flat_map(|b| b.iter().copied()).collect();
    assert_eq!(joined, b"hello world");
    assert!(pieces.iter().all(|piece| piece.len() <= 4));
    assert_eq!(
        *pieces,
        vec![
            Bytes::from_static(b"hell"),
            Bytes::from_static(b"o"),
            Bytes::from_static(b" wor"),
            Bytes::from_static(b"ld"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn peer_close_is_reported_once_and_later_disconnects_are_ignored() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, inbound, probe) = MockAdaptor::new();
    drop(inbound);
    let (handler, seen) = recorder(|_, _| {});

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    assert!(handle.start(false));
    ctx.run_until_idle().await;

    handle.disconnect();
    handle.disconnect();
    assert!(!handle.send("late"));
    ctx.poll();

    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert!(!ctx.contains(handle.id()));
    Ok(())
}

#[tokio::test]
async fn disconnect_twice_emits_a_single_terminal_signal() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            conn.disconnect();
            conn.disconnect();
            assert_eq!(conn.state(), ConnectionState::Disconnecting);
            assert!(!conn.send("after disconnect"));
        }
    });

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.start(true);
    ctx.run_until_idle().await;
    handle.disconnect();
    ctx.poll();

    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert!(probe.written().is_empty());
    Ok(())
}

#[tokio::test]
async fn disconnect_while_idle_closes_immediately() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let handler = move |conn: &mut Connection<'_, MockAdaptor>, event: ConnectionEvent| {
        assert!(!conn.is_connected());
        sink.borrow_mut().push(Seen::from(&event));
    };

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    assert_eq!(handle.state(), ConnectionState::Idle);
    assert!(!handle.send("too early"));
    handle.disconnect();
    ctx.run_until_idle().await;

    assert_eq!(*events.borrow(), vec![Seen::Disconnected]);
    assert!(probe.attempts().is_empty());
    assert!(probe.closes.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn unreachable_candidate_falls_back_to_the_next_one() {
    let mut ctx = IoContext::new().expect("事件上下文");
    let bad = addr(7001);
    let good = addr(7002);
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor
        .dial(bad, Dial::Fail(std::io::ErrorKind::ConnectionRefused))
        .dial(good, Dial::Accept);
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            conn.disconnect();
        }
    });

    let handle = ctx
        .register(adaptor, ConnectionConfig::default(), handler)
        .expect("注册连接");
    handle.connect_addrs(vec![bad, good]);
    ctx.run_until_idle().await;

    assert_eq!(probe.attempts(), vec![bad, good]);
    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    assert!(logs_contain("candidate unreachable"));
}

#[tokio::test]
async fn non_unreachable_connect_error_does_not_fall_back() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let denied = addr(7003);
    let good = addr(7004);
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor.dial(denied, Dial::Fail(std::io::ErrorKind::PermissionDenied));
    let (handler, seen) = recorder(|_, _| {});

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.connect_addrs(vec![denied, good]);
    ctx.run_until_idle().await;

    assert_eq!(probe.attempts(), vec![denied]);
    assert_eq!(
        *seen.borrow(),
        vec![Seen::Error("viaduct.connection.connect_failed")]
    );
    assert_eq!(handle.state(), ConnectionState::Error);
    Ok(())
}

#[tokio::test]
async fn exhausted_candidates_report_an_error() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let only = addr(7005);
    let (adaptor, _inbound, _probe) = MockAdaptor::new();
    let adaptor = adaptor.dial(only, Dial::Fail(std::io::ErrorKind::ConnectionRefused));
    let (handler, seen) = recorder(|_, _| {});

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.connect_addrs(vec![only]);
    ctx.run_until_idle().await;

    assert_eq!(
        *seen.borrow(),
        vec![Seen::Error("viaduct.connection.connect_failed")]
    );
    Ok(())
}

#[tokio::test]
async fn ip_literal_host_is_resolved_without_lookup_failure() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            conn.disconnect();
        }
    });

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.connect("127.0.0.1", 8089);
    ctx.run_until_idle().await;

    assert_eq!(probe.attempts(), vec![addr(8089)]);
    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_is_signalled_exactly_once() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let target = addr(7006);
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor.dial(target, Dial::Hang);
    let (handler, seen) = recorder(|_, _| {});

    let config = ConnectionConfig::default().with_connect_timeout(Duration::from_millis(50));
    let handle = ctx.register(adaptor, config, handler)?;
    let started = tokio::time::Instant::now();
    handle.connect_addrs(vec![target]);
    ctx.run_until_idle().await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(*seen.borrow(), vec![Seen::ConnectionTimedOut]);
    assert_eq!(count(&seen, &Seen::Connected), 0);
    assert_eq!(handle.state(), ConnectionState::Error);
    assert!(probe.closes.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn idle_connection_reports_receive_timeout_once() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|_, _| {});

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    handle.start(false);
    ctx.run_until_idle().await;

    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::ReceiveTimedOut]);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn writes_every_half_timeout_keep_the_connection_alive() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|_, _| {});

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    handle.start(false);

    let writer = handle.clone();
    let pacer = tokio::spawn(async move {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(writer.send("ping"));
        }
        writer.disconnect();
    });
    ctx.run_until_idle().await;
    pacer.await?;

    assert_eq!(count(&seen, &Seen::ReceiveTimedOut), 0);
    assert_eq!(count(&seen, &Seen::Sent), 10);
    assert_eq!(seen.borrow().last(), Some(&Seen::Disconnected));
    assert_eq!(probe.written().len(), 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn incoming_data_restarts_the_receive_timer() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, inbound, _probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Received {
            while conn.read_pending() {
                conn.read_data();
            }
        }
    });

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    handle.start(false);

    let feeder = tokio::spawn(async move {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let _ = inbound.send(b"tick".to_vec());
        }
        inbound
    });
    let started = tokio::time::Instant::now();
    ctx.run_until_idle().await;
    let _inbound = feeder.await?;

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(count(&seen, &Seen::Received), 5);
    assert_eq!(seen.borrow().last(), Some(&Seen::ReceiveTimedOut));
    Ok(())
}

#[tokio::test]
async fn start_skips_connect_and_reports_connected() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            assert!(conn.is_connected());
            let handle = conn.handle();
            assert!(handle.is_connected());
            assert!(handle.disconnect());
        }
    });

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.start(true);
    handle.start(true);
    ctx.run_until_idle().await;

    assert!(probe.attempts().is_empty());
    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    Ok(())
}

#[tokio::test]
async fn zero_sized_receive_buffer_is_rejected() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, _probe) = MockAdaptor::new();
    let config = ConnectionConfig::default().with_rx_buffer_size(0);
    let result = ctx.register(adaptor, config, |_: &mut Connection<'_, MockAdaptor>, _: ConnectionEvent| {});
    assert!(result.is_err());
    assert_eq!(ctx.connection_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn undrained_data_pauses_reception_until_read() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, inbound, probe) = MockAdaptor::new();
    for chunk in ["one", "two", "three"] {
        inbound.send(chunk.as_bytes().to_vec())?;
    }
    let (handler, seen) = recorder(|_, _| {});

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.start(false);
    let closer = handle.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.disconnect();
    });
    ctx.run_until_idle().await;
    stopper.await?;

    assert_eq!(
        *seen.borrow(),
        vec![Seen::Connected, Seen::Received, Seen::Disconnected]
    );
    assert_eq!(probe.reads.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn draining_the_queue_resumes_reception() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, inbound, probe) = MockAdaptor::new();
    for chunk in ["one", "two", "three"] {
        inbound.send(chunk.as_bytes().to_vec())?;
    }
    let mut drained = 0;
    let (handler, seen) = recorder(move |conn, event| {
        if *event != Seen::Received {
            return;
        }
        assert!(conn.read_pending());
        conn.read_data();
        assert!(!conn.read_pending());
        drained += 1;
        if drained == 3 {
            conn.disconnect();
        }
    });

    let handle = ctx.register(adaptor, ConnectionConfig::default(), handler)?;
    handle.start(false);
    ctx.run_until_idle().await;

    assert_eq!(count(&seen, &Seen::Received), 3);
    // 第四次读取在取空队列时发起，可能在断开取消它之前尚未被轮询。
    let reads = probe.reads.load(Ordering::SeqCst);
    assert!((3..=4).contains(&reads), "reads = {reads}");
    assert_eq!(seen.borrow().last(), Some(&Seen::Disconnected));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_with_a_stalled_write_closes_after_the_receive_timeout() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor.writes(Dial::Hang);
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            assert!(conn.send("never drained"));
            assert!(conn.send("still queued"));
            conn.disconnect();
            assert_eq!(conn.state(), ConnectionState::Disconnecting);
        }
    });

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    let started = tokio::time::Instant::now();
    handle.start(false);
    ctx.run_until_idle().await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    assert!(probe.written().is_empty());
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(ctx.connection_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_shutdown_is_abandoned_after_the_receive_timeout() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor.shutdowns(Dial::Hang);
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            conn.disconnect();
        }
    });

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    handle.start(false);
    ctx.run_until_idle().await;

    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::Disconnected]);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert!(probe.closes.load(Ordering::SeqCst) >= 1);
    assert_eq!(handle.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn receive_timeout_aborts_an_in_flight_write_without_extra_signals() -> Result<()> {
    let mut ctx = IoContext::new()?;
    let (adaptor, _inbound, probe) = MockAdaptor::new();
    let adaptor = adaptor.writes(Dial::Hang);
    let (handler, seen) = recorder(|conn, event| {
        if *event == Seen::Connected {
            assert!(conn.send("stuck"));
        }
    });

    let config = ConnectionConfig::default().with_receive_timeout(Duration::from_millis(100));
    let handle = ctx.register(adaptor, config, handler)?;
    handle.start(false);
    ctx.run_until_idle().await;

    assert_eq!(*seen.borrow(), vec![Seen::Connected, Seen::ReceiveTimedOut]);
    assert_eq!(count(&seen, &Seen::Sent), 0);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    assert!(probe.written().is_empty());
    assert_eq!(handle.state(), ConnectionState::Closed);
    Ok(())
}
