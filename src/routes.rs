//! # Route Table
//!
//! The source this crate is modeled on discovers exposed handlers via a
//! decorator plus runtime reflection over the isle's own attributes (D1).
//! Rust has no equivalent runtime introspection, so a `RouteTable` is built
//! once, at construction, from explicit registrations — the "explicit
//! builder calls" option D1 names.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::errors::IsleError;

/// A handler invocation's positional and keyword arguments, matching the
/// wire envelope's `args`/`kwargs` request convention.
type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, IsleError>> + Send>>;

type HandlerFn = dyn Fn(Vec<Value>, Map<String, Value>) -> HandlerFuture + Send + Sync;

/// A finite, enumerated mapping from route name to exposed handler.
///
/// Unexposed methods simply have no entry and so cannot be invoked via a
/// request (P5).
#[derive(Default)]
pub struct RouteTable {
    handlers: HashMap<String, Box<HandlerFn>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Expose `name` as a callable route.
    pub fn route<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, IsleError>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Box::new(move |args, kwargs| Box::pin(handler(args, kwargs))));
        self
    }

    /// True if `name` is an exposed route.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Invoke the handler named `name` with the given arguments.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, IsleError> {
        match self.handlers.get(name) {
            Some(handler) => handler(args, kwargs).await,
            None => Err(IsleError::UnknownDestination {
                destination: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn exposes_only_registered_routes() {
        let mut table = RouteTable::new();
        table.route("add", |args, _kwargs| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });

        assert!(table.contains("add"));
        assert!(!table.contains("sub"));

        let result = table.call("add", vec![json!(3), json!(6)], Map::new()).await;
        assert_eq!(result.unwrap(), json!(9));
    }

    #[tokio::test]
    async fn calling_unexposed_route_errors() {
        let table = RouteTable::new();
        let err = table.call("ghost", vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, IsleError::UnknownDestination { .. }));
    }
}
