//! Event trait - 型付きイベントの定義
//!
//! # Trait Bounds
//! - `DeserializeOwned`: handler 引数（JSON）からの復元のため
//! - `Send + Sync + 'static`: Arc に格納してワーカー間で共有するため

use serde::de::DeserializeOwned;

/// Binds an outbox `type` to a Rust type decoded from the handler argument.
///
/// With the default argument (the serialised [`crate::domain::Message`]),
/// the type decodes from `{ "id", "type", "before", "after", "at", ... }`.
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct OrderCreated {
///     after: OrderPayload,
/// }
///
/// impl Event for OrderCreated {
///     const TYPE: &'static str = "order_created";
/// }
/// ```
pub trait Event: DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
