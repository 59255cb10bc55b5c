//! # TempIsle
//!
//! A scoped isle for foreign execution contexts that want to issue
//! `call_path`/`request_response` without running a full event loop. On
//! construction it registers itself in the manager's membership map with
//! no task handle; on drop it removes itself. Choosing `std::sync::Mutex`
//! for the manager's membership registry (see `manager.rs`) is what makes
//! this `Drop` impl synchronous — the direct analogue of the source's
//! `__enter__`/`__exit__` context manager, without needing async `Drop`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::connection::Connection;
use crate::errors::IsleError;
use crate::isle::IsleCore;
use crate::manager::Manager;
use crate::routes::RouteTable;

/// A scoped isle borrowed by a foreign execution context. Dropping it
/// removes its membership; while live, it can `call_path` any other isle
/// exactly as a first-class isle would.
pub struct TempIsle {
    manager: Arc<Manager>,
    core: IsleCore,
}

impl TempIsle {
    pub(crate) fn enter(manager: Arc<Manager>, identifier: impl Into<String>) -> Result<Self, IsleError> {
        let identifier = identifier.into();
        let (isle_conn, manager_conn) = Connection::pair();
        manager.register_membership(identifier.clone(), manager_conn)?;
        let core = IsleCore::new(identifier, manager.id().to_string(), isle_conn, RouteTable::new());
        Ok(Self { manager, core })
    }

    pub fn identifier(&self) -> &str {
        self.core.identifier()
    }

    /// Issue a request-response call along `path` (call order, reversed
    /// internally to build `receiver`; see `IsleCore::call_path`).
    pub async fn call_path(
        &mut self,
        path: &[&str],
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, IsleError> {
        self.core.call_path(path, args, kwargs, timeout).await
    }
}

impl Drop for TempIsle {
    fn drop(&mut self) {
        self.manager.remove_membership(self.core.identifier());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isle::IsleBehavior;
    use crate::manager::ManagerBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct Gibson;

    #[async_trait]
    impl IsleBehavior for Gibson {
        fn routes(&self) -> RouteTable {
            let mut table = RouteTable::new();
            table.route("secret", |args, _kwargs| async move {
                let password = args.first().and_then(Value::as_str).unwrap_or("");
                if password == "love" {
                    Ok(json!("Access granted"))
                } else {
                    Ok(json!("Permission denied"))
                }
            });
            table
        }
    }

    #[tokio::test]
    async fn temp_isle_calls_a_registered_isle_and_cleans_up_on_drop() {
        let dir = tempdir().unwrap();
        let manager = ManagerBuilder::new()
            .log_path(dir.path().join("log.txt"))
            .install_signal_handler(false)
            .build();
        manager.add_isle("gibson", Gibson).unwrap();

        let manager_for_loop = manager.clone();
        let run = tokio::spawn(async move { manager_for_loop.start().await });

        {
            let mut temp = manager.enter_temp_isle("foreign").unwrap();
            let result = temp
                .call_path(
                    &["gibson", "secret"],
                    vec![json!("love")],
                    Map::new(),
                    Duration::from_secs(3),
                )
                .await
                .unwrap();
            assert_eq!(result, json!("Access granted"));
        }
        // The TempIsle has been dropped; re-entering under the same
        // identifier must succeed, proving membership was removed.
        let _ = manager.enter_temp_isle("foreign").unwrap();

        manager.request_shutdown();
        run.await.unwrap();
    }
}
