/// 应用层上下文（Application Context）
///
/// 承载一次应用层调用（命令/查询）所需的横切信息，例如：
/// - 关联追踪 `correlation_id` 与执行者 `actor_id`（日志与审计使用）；
/// - 幂等键（`idempotency_key`）：用于在基础设施层实现请求幂等（如 API 层重复提交保护）。
///
/// 典型用法：
/// ```rust
/// use biohub_application::context::AppContext;
///
/// let ctx = AppContext {
///     correlation_id: Some("cor-123".into()),
///     actor_id: Some("u-1".into()),
///     idempotency_key: Some("idem-xyz".into()),
/// };
/// assert_eq!(ctx.actor(), "u-1");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppContext {
    /// 关联 ID（链路追踪）
    pub correlation_id: Option<String>,
    /// 执行者
    pub actor_id: Option<String>,
    /// 幂等键（可选）：为空则由上层或基础设施决定是否参与幂等
    pub idempotency_key: Option<String>,
}

impl AppContext {
    /// 执行者，缺省为 `system`
    pub fn actor(&self) -> &str {
        self.actor_id.as_deref().unwrap_or("system")
    }
}
