//! 内存版事件仓储（InMemoryEventRepository）
//!
//! 所有读写都在同一把互斥锁内完成，`claim_batch` 的“检查 + 迁移”因此是原子的，
//! 满足多 worker 并发领取时“同一事件只被一个调用者拿到”的要求。
//! 典型用途：测试、示例与单进程部署。
//!
use super::{EventQuery, EventRepository};
use crate::clock::{Clock, SystemClock};
use crate::error::{EventingError, EventingResult};
use crate::event::{EventId, EventRecord, EventStatus, NewEvent};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Table {
    /// 按入队顺序保存
    rows: Vec<EventRecord>,
    index: HashMap<EventId, usize>,
    dedup: HashMap<String, EventId>,
}

impl Table {
    fn row_mut(&mut self, id: &EventId) -> EventingResult<&mut EventRecord> {
        let idx = *self
            .index
            .get(id)
            .ok_or(EventingError::NotFound { id: *id })?;
        Ok(&mut self.rows[idx])
    }
}

pub struct InMemoryEventRepository {
    table: Mutex<Table>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventRepository {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 当前存量（含终态）
    pub fn len(&self) -> usize {
        self.lock().map(|t| t.rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> EventingResult<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|e| EventingError::repository(format!("event table poisoned: {e}")))
    }
}

impl Default for InMemoryEventRepository {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn enqueue(&self, event: NewEvent) -> EventingResult<EventId> {
        let now = self.clock.now();
        let mut table = self.lock()?;

        if let Some(existing) = event.dedup_key().and_then(|k| table.dedup.get(k)) {
            return Ok(*existing);
        }

        let record = EventRecord::pending(event, now);
        let id = record.id();
        if let Some(key) = record.dedup_key() {
            table.dedup.insert(key.to_string(), id);
        }
        let idx = table.rows.len();
        table.rows.push(record);
        table.index.insert(id, idx);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> EventingResult<Vec<EventRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut table = self.lock()?;

        let mut candidates: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_claimable(now))
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|idx| table.rows[*idx].available_at());

        let mut claimed = Vec::with_capacity(batch_size.min(candidates.len()));
        for idx in candidates {
            if claimed.len() == batch_size {
                break;
            }
            let row = &mut table.rows[idx];
            if row.claim(now, lease, &self.policy) {
                claimed.push(row.clone());
            }
        }

        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        id: &EventId,
        attempt: u32,
        lease: Duration,
    ) -> EventingResult<bool> {
        let now = self.clock.now();
        let mut table = self.lock()?;
        Ok(table.row_mut(id)?.renew_lease(attempt, now, lease))
    }

    async fn mark_completed(&self, id: &EventId, attempt: u32) -> EventingResult<()> {
        let now = self.clock.now();
        let mut table = self.lock()?;
        table.row_mut(id)?.complete(attempt, now)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<EventStatus> {
        let now = self.clock.now();
        let mut table = self.lock()?;
        table.row_mut(id)?.fail(attempt, now, error, &self.policy)
    }

    async fn mark_failed_permanently(
        &self,
        id: &EventId,
        attempt: u32,
        error: &str,
    ) -> EventingResult<()> {
        let now = self.clock.now();
        let mut table = self.lock()?;
        table.row_mut(id)?.fail_permanently(attempt, now, error)
    }

    async fn cancel(&self, id: &EventId, reason: &str) -> EventingResult<bool> {
        let now = self.clock.now();
        let mut table = self.lock()?;
        Ok(table.row_mut(id)?.cancel(now, reason))
    }

    async fn search(&self, query: &EventQuery) -> EventingResult<Vec<EventRecord>> {
        let table = self.lock()?;
        Ok(table
            .rows
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &EventId) -> EventingResult<Option<EventRecord>> {
        let table = self.lock()?;
        Ok(table.index.get(id).map(|idx| table.rows[*idx].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn repo(max_retries: u32) -> (InMemoryEventRepository, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let policy = RetryPolicy::new(
            max_retries,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        (
            InMemoryEventRepository::with_clock(policy, clock.clone()),
            clock,
        )
    }

    fn new_event(ty: &str, correlation: &str) -> NewEvent {
        NewEvent::builder()
            .event_type(ty)
            .payload(json!({"workspace_id": correlation}))
            .correlation_id(correlation)
            .build()
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn claim_marks_running_and_respects_batch_size() {
        let (repo, _) = repo(3);
        for _ in 0..3 {
            repo.enqueue(new_event("ImportNotebooks", "w1")).await.unwrap();
        }

        let first = repo.claim_batch(2, LEASE).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.status() == EventStatus::Running && e.attempts() == 1));

        let second = repo.claim_batch(2, LEASE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(repo.claim_batch(2, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_lease_is_reclaimed_after_expiry() {
        let (repo, clock) = repo(3);
        let id = repo.enqueue(new_event("ImportWorkflows", "w1")).await.unwrap();
        repo.claim_batch(1, LEASE).await.unwrap();

        clock.advance(Duration::from_secs(29));
        assert!(repo.claim_batch(1, LEASE).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(2));
        let reclaimed = repo.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id(), id);
        assert_eq!(reclaimed[0].attempts(), 2);

        // 旧持有者的续租被 fencing 拒绝
        assert!(!repo.renew_lease(&id, 1, LEASE).await.unwrap());
        assert!(repo.renew_lease(&id, 2, LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let (repo, _) = repo(3);
        let id = repo.enqueue(new_event("ImportDataModels", "w1")).await.unwrap();
        repo.claim_batch(1, LEASE).await.unwrap();

        repo.mark_completed(&id, 1).await.unwrap();
        let first = repo.get(&id).await.unwrap().unwrap();
        repo.mark_completed(&id, 1).await.unwrap();
        let second = repo.get(&id).await.unwrap().unwrap();

        assert_eq!(first.status(), EventStatus::Completed);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mark_failed_applies_backoff_then_fails_at_limit() {
        let (repo, clock) = repo(2);
        let id = repo.enqueue(new_event("ImportNotebookServers", "w1")).await.unwrap();

        repo.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(repo.mark_failed(&id, 1, "pod pending").await.unwrap(), EventStatus::Pending);
        assert!(repo.claim_batch(1, LEASE).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(repo.claim_batch(1, LEASE).await.unwrap().len(), 1);
        assert_eq!(repo.mark_failed(&id, 2, "pod pending").await.unwrap(), EventStatus::Failed);

        clock.advance(Duration::from_secs(3600));
        assert!(repo.claim_batch(1, LEASE).await.unwrap().is_empty());
        let ev = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(ev.attempts(), 2);
        assert_eq!(ev.last_error(), Some("pod pending"));
    }

    #[tokio::test]
    async fn dedup_key_returns_existing_event() {
        let (repo, _) = repo(3);
        let a = repo
            .enqueue(new_event("WorkspaceDeleted", "w1").with_dedup_key("WorkspaceDeleted:w1"))
            .await
            .unwrap();
        let b = repo
            .enqueue(new_event("WorkspaceDeleted", "w1").with_dedup_key("WorkspaceDeleted:w1"))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn search_filters_by_type_status_and_correlation() {
        let (repo, _) = repo(3);
        let done = repo.enqueue(new_event("ImportNotebooks", "w1")).await.unwrap();
        repo.enqueue(new_event("ImportWorkflows", "w1")).await.unwrap();
        repo.enqueue(new_event("ImportNotebooks", "w2")).await.unwrap();
        repo.claim_batch(10, LEASE).await.unwrap();
        repo.mark_completed(&done, 1).await.unwrap();

        let query = EventQuery::correlated(
            "w1",
            ["ImportNotebooks", "ImportWorkflows"],
            [EventStatus::Completed, EventStatus::Failed],
        );
        let found = repo.search(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), done);

        let all_w1 = repo
            .search(&EventQuery::builder().correlation_id("w1").build())
            .await
            .unwrap();
        assert_eq!(all_w1.len(), 2);
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (repo, _) = repo(3);
        let err = repo.mark_completed(&EventId::new(), 1).await.unwrap_err();
        assert!(matches!(err, EventingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stale_holder_cannot_overwrite_reclaimed_outcome() {
        let (repo, clock) = repo(2);
        let id = repo.enqueue(new_event("ImportNotebooks", "w1")).await.unwrap();
        let first = repo.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(first[0].attempts(), 1);

        clock.advance(LEASE + Duration::from_secs(1));
        let second = repo.claim_batch(1, LEASE).await.unwrap();
        assert_eq!(second[0].attempts(), 2);

        // 第一个 worker 在租约过期后才返回失败（此时已是最后一次预算）
        let err = repo.mark_failed(&id, 1, "slow store").await.unwrap_err();
        assert!(matches!(err, EventingError::StaleAttempt { current: 2, .. }));
        assert!(
            repo.mark_failed_permanently(&id, 1, "slow store")
                .await
                .is_err()
        );

        repo.mark_completed(&id, 2).await.unwrap();
        let ev = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(ev.status(), EventStatus::Completed);
        assert_eq!(ev.last_error(), None);
    }

    #[tokio::test]
    async fn cancel_only_affects_open_events() {
        let (repo, _) = repo(3);
        let running = repo.enqueue(new_event("ImportNotebooks", "w1")).await.unwrap();
        repo.claim_batch(1, LEASE).await.unwrap();
        let pending = repo.enqueue(new_event("ImportWorkflows", "w1")).await.unwrap();

        assert!(repo.cancel(&running, "import timed out").await.unwrap());
        assert!(repo.cancel(&pending, "import timed out").await.unwrap());
        assert!(!repo.cancel(&running, "import timed out").await.unwrap());

        assert!(repo.claim_batch(8, LEASE).await.unwrap().is_empty());
        assert!(!repo.renew_lease(&running, 1, LEASE).await.unwrap());
        assert!(repo.mark_completed(&running, 1).await.is_err());
        let ev = repo.get(&running).await.unwrap().unwrap();
        assert_eq!(ev.status(), EventStatus::Failed);
        assert_eq!(ev.last_error(), Some("import timed out"));
    }
}
