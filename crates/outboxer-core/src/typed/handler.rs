//! Handler traits
//!
//! # 型消去
//! `Handler<T>` は型付き、`EventHandler` は object-safe。
//! `TypedHandler<T, H>` が JSON 引数を `T` に decode して橋渡しする。

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::event::Event;
use crate::error::HandlerError;

/// Object-safe handler stored in the registry.
///
/// `argument` is the serialised message, or the result of the configured
/// `message_to_arguments` transform.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, argument: &Value) -> Result<(), HandlerError>;
}

/// Typed handler for one [`Event`].
#[async_trait]
pub trait Handler<T: Event>: Send + Sync {
    async fn handle(&self, event: T) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T, H> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Event, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Event, H: Handler<T>> EventHandler for TypedHandler<T, H> {
    async fn handle(&self, argument: &Value) -> Result<(), HandlerError> {
        let event = T::deserialize(argument)
            .map_err(|e| format!("decode {}: {e}", T::TYPE))?;
        self.handler.handle(event).await
    }
}

/// Synchronous closure handler.
pub struct FnHandler<F>(F);

/// Wraps a closure as an [`EventHandler`].
///
/// ```ignore
/// builder.on("event_created", handler_fn(|arg| {
///     println!("{arg}");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, argument: &Value) -> Result<(), HandlerError> {
        (self.0)(argument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Payload {
        foo: String,
    }

    #[derive(Debug, Deserialize)]
    struct EventCreated {
        id: i64,
        after: Payload,
    }

    impl Event for EventCreated {
        const TYPE: &'static str = "event_created";
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Handler<EventCreated> for Recorder {
        async fn handle(&self, event: EventCreated) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push((event.id, event.after.foo));
            Ok(())
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_message_argument() {
        let typed = TypedHandler::new(Recorder::default());
        let argument = json!({ "id": 3, "type": "event_created", "after": { "foo": "bar" } });

        typed.handle(&argument).await.unwrap();

        assert_eq!(
            *typed.handler.seen.lock().unwrap(),
            vec![(3, "bar".to_string())]
        );
    }

    #[tokio::test]
    async fn typed_handler_reports_decode_errors() {
        let typed = TypedHandler::new(Recorder::default());
        let err = typed.handle(&json!({ "id": "nope" })).await.unwrap_err();
        assert!(err.to_string().starts_with("decode event_created"));
    }

    #[tokio::test]
    async fn closure_handler_passes_errors_through() {
        let handler = handler_fn(|arg: &Value| {
            if arg["fail"] == json!(true) {
                return Err("asked to fail".into());
            }
            Ok(())
        });
        assert!(handler.handle(&json!({})).await.is_ok());
        let err = handler.handle(&json!({ "fail": true })).await.unwrap_err();
        assert_eq!(err.to_string(), "asked to fail");
    }
}
