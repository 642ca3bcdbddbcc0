//! 完成屏障（CompletionBarrier）
//!
//! 等待同一关联 ID 下的一组兄弟事件全部结束：周期性地查询仓储，
//! 按“每个期望类型至少一条 `Completed`”判定成功，任一兄弟 `Failed` 即判定失败，
//! 超过截止时长返回 `TimedOut`。
//!
//! 若提供了 `OutcomeSignal`，相关事件的处理结果会提前唤醒下一次查询；
//! 判定始终只依据仓储查询结果。查询出错视为本轮无进展，继续等待。
//!
use crate::config::BarrierConfig;
use crate::event::{EventRecord, EventStatus};
use crate::repository::{EventQuery, EventRepository};
use crate::signal::{Outcome, OutcomeSignal};
use bon::Builder;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 一组兄弟事件：关联 ID + 期望的事件类型集合
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiblingSet {
    correlation_id: String,
    expected: Vec<String>,
}

impl SiblingSet {
    pub fn new<T>(correlation_id: impl Into<String>, expected: T) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let mut expected: Vec<String> = expected.into_iter().map(Into::into).collect();
        expected.sort();
        expected.dedup();
        Self {
            correlation_id: correlation_id.into(),
            expected,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn expected(&self) -> &[String] {
        &self.expected
    }

    /// 只关心已结束的兄弟事件
    pub fn query(&self) -> EventQuery {
        EventQuery::correlated(
            self.correlation_id.clone(),
            self.expected.iter().cloned(),
            [EventStatus::Completed, EventStatus::Failed],
        )
    }

    fn is_relevant(&self, outcome: &Outcome) -> bool {
        outcome.status.is_terminal()
            && outcome.correlation_id.as_deref() == Some(self.correlation_id.as_str())
            && self.expected.iter().any(|t| *t == outcome.event_type)
    }
}

/// 单次查询的判定结果
#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    Waiting { outstanding: Vec<String> },
    Completed,
    Failed { failed: Vec<EventRecord> },
}

/// 屏障的最终结果
#[derive(Clone, Debug, PartialEq)]
pub enum BarrierOutcome {
    Completed,
    Failed { failed: Vec<EventRecord> },
    /// 截止时仍未完成的类型
    TimedOut { outstanding: Vec<String> },
    Cancelled,
}

/// 依据查询到的事件判定兄弟集合的进度（重复的完成记录只按类型计一次）
pub fn evaluate(set: &SiblingSet, records: &[EventRecord]) -> Progress {
    let siblings = records.iter().filter(|r| {
        r.correlation_id() == Some(set.correlation_id())
            && set.expected.iter().any(|t| t == r.event_type())
    });

    let failed: Vec<EventRecord> = siblings
        .clone()
        .filter(|r| r.status() == EventStatus::Failed)
        .cloned()
        .collect();
    if !failed.is_empty() {
        return Progress::Failed { failed };
    }

    let outstanding: Vec<String> = set
        .expected
        .iter()
        .filter(|t| {
            !siblings
                .clone()
                .any(|r| r.event_type() == t.as_str() && r.status() == EventStatus::Completed)
        })
        .cloned()
        .collect();

    if outstanding.is_empty() {
        Progress::Completed
    } else {
        Progress::Waiting { outstanding }
    }
}

#[derive(Builder)]
pub struct CompletionBarrier {
    repository: Arc<dyn EventRepository>,
    #[builder(default)]
    config: BarrierConfig,
    signal: Option<OutcomeSignal>,
}

impl CompletionBarrier {
    pub fn config(&self) -> &BarrierConfig {
        &self.config
    }

    /// 等待兄弟集合结束、超时或被取消
    pub async fn wait(&self, set: &SiblingSet, token: &CancellationToken) -> BarrierOutcome {
        // 先订阅再查询，避免错过查询与休眠之间到达的结果
        let mut wake = self.signal.as_ref().map(OutcomeSignal::subscribe);
        let deadline = Instant::now() + self.config.deadline;
        let mut outstanding = set.expected().to_vec();

        loop {
            match self.repository.search(&set.query()).await {
                Ok(records) => match evaluate(set, &records) {
                    Progress::Completed => return BarrierOutcome::Completed,
                    Progress::Failed { failed } => return BarrierOutcome::Failed { failed },
                    Progress::Waiting { outstanding: rest } => {
                        debug!(
                            correlation_id = set.correlation_id(),
                            outstanding = ?rest,
                            "siblings still running"
                        );
                        outstanding = rest;
                    }
                },
                Err(err) => {
                    warn!(
                        correlation_id = set.correlation_id(),
                        error = %err,
                        "sibling search failed, retrying"
                    );
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return BarrierOutcome::TimedOut { outstanding };
            }

            let next_poll = (now + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = token.cancelled() => return BarrierOutcome::Cancelled,
                _ = tokio::time::sleep_until(next_poll) => {}
                _ = next_relevant(wake.as_mut(), set) => {}
            }
        }
    }
}

/// 等待一条相关的结果；无信号源或信号源关闭时永不返回
async fn next_relevant(wake: Option<&mut BoxStream<'static, Outcome>>, set: &SiblingSet) {
    let Some(stream) = wake else {
        return std::future::pending().await;
    };

    while let Some(outcome) = stream.next().await {
        if set.is_relevant(&outcome) {
            return;
        }
    }
    std::future::pending().await
}
