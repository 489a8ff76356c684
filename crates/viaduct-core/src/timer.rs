use std::time::Duration;

use tokio::task::AbortHandle;

use crate::context::{Completion, ConnectionId, Scheduler};

/// 截止计时器当前承担的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerRole {
    Connect,
    Receive,
}

/// 每条连接唯一的截止计时器，建连超时与空闲超时复用同一实例。
///
/// 每次布防递增 `seq`；到期事件携带布防时的序号，序号不匹配即视为已取消。
#[derive(Debug, Default)]
pub(crate) struct DeadlineTimer {
    seq: u64,
    armed: Option<(TimerRole, AbortHandle)>,
}

impl DeadlineTimer {
    pub(crate) fn arm(
        &mut self,
        role: TimerRole,
        after: Duration,
        id: ConnectionId,
        scheduler: &Scheduler,
    ) {
        self.cancel();
        let seq = self.seq;
        let handle = scheduler.spawn(id, async move {
            tokio::time::sleep(after).await;
            Completion::Timer { seq }
        });
        self.armed = Some((role, handle));
    }

    pub(crate) fn cancel(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        if let Some((_, handle)) = self.armed.take() {
            handle.abort();
        }
    }

    /// 消费一次到期事件；返回 `None` 表示该事件属于已取消的布防。
    pub(crate) fn fired(&mut self, seq: u64) -> Option<TimerRole> {
        if seq != self.seq {
            return None;
        }
        let (role, _) = self.armed.take()?;
        self.seq = self.seq.wrapping_add(1);
        Some(role)
    }
}
