//! 结果信号（OutcomeSignal）
//!
//! 进程内广播：worker 每处理完一个事件（成功、重试或失败）发出一条 `Outcome`。
//! saga 屏障据此提前唤醒轮询；信号只是加速手段，丢失（无订阅者、滞后）不影响正确性，
//! 最终状态始终以仓储查询为准。
//!
use crate::event::{EventId, EventStatus};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub event_id: EventId,
    pub event_type: String,
    pub correlation_id: Option<String>,
    /// 处理后的状态
    pub status: EventStatus,
}

#[derive(Clone, Debug)]
pub struct OutcomeSignal {
    tx: broadcast::Sender<Outcome>,
}

impl OutcomeSignal {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, outcome: Outcome) {
        // 无订阅者时发送失败，忽略
        let _ = self.tx.send(outcome);
    }

    /// 订阅后续结果；滞后丢弃的消息会被跳过
    pub fn subscribe(&self) -> BoxStream<'static, Outcome> {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|r| async move { r.ok() }))
    }
}

impl Default for OutcomeSignal {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
