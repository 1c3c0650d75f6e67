//! Typed handler API
//!
//! - **handler**: `EventHandler`（object-safe）と型付き `Handler<T>`、closure 用 `FnHandler`
//! - **event**: `Event` trait（`const TYPE` で event type と型を対応付け）
//! - **registry**: event type -> handler 列

pub mod event;
pub mod handler;
pub mod registry;

pub use event::Event;
pub use handler::{EventHandler, FnHandler, Handler, TypedHandler, handler_fn};
pub use registry::HandlerRegistry;
