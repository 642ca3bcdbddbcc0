use proc_macro::TokenStream;

mod integration_event;
mod utils;

/// 集成事件宏
/// - 作用于具名字段结构体，合并默认派生 `Debug, Clone, PartialEq, Serialize, Deserialize`
/// - 自动实现 `::biohub_eventing::IntegrationEvent`
/// - 支持参数：
///   - `#[integration_event(name = "ImportWorkspace")]` 指定类型标签，缺省为去掉 `Event` 后缀的结构体名
///   - `#[integration_event(correlation = workspace_id)]` 以该字段作为关联 ID
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}
