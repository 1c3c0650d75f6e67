//! HandlerRegistry - event type ごとの handler 列
//!
//! 同じ type に複数の handler を登録でき、登録順に呼ばれる。
//! 構築時のみ可変、実行時は読み取り専用（Configuration に凍結される）。

use std::collections::HashMap;
use std::sync::Arc;

use super::event::Event;
use super::handler::{EventHandler, Handler, TypedHandler};

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    pub fn register_typed<T: Event, H: Handler<T> + 'static>(&mut self, handler: H) {
        self.register(T::TYPE, Arc::new(TypedHandler::<T, H>::new(handler)));
    }

    /// Handlers for `event_type` in registration order. Empty when none.
    pub fn get(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of event types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}
