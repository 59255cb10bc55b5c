//! End-to-end request/response through the manager: one isle exposes
//! `add`/`sub`, a foreign execution context calls it via `TempIsle`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map};
use tempfile::tempdir;

use isle_runtime::{IsleBehavior, ManagerBuilder, RouteTable};

struct AddSub;

#[async_trait]
impl IsleBehavior for AddSub {
    fn routes(&self) -> RouteTable {
        let mut table = RouteTable::new();
        table.route("add", |args, _kwargs| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        table.route("sub", |args, _kwargs| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a - b))
        });
        table
    }
}

#[tokio::test]
async fn add_sub_round_trip_through_the_manager() -> Result<()> {
    let dir = tempdir()?;
    let manager = ManagerBuilder::new()
        .log_path(dir.path().join("log.txt"))
        .install_signal_handler(false)
        .build();

    manager.add_isle("calc", AddSub)?;
    let manager_for_loop = manager.clone();
    let run = tokio::spawn(async move { manager_for_loop.start().await });

    {
        let mut caller = manager.enter_temp_isle("caller")?;
        let sum = caller
            .call_path(&["calc", "add"], vec![json!(4), json!(9)], Map::new(), Duration::from_secs(3))
            .await?;
        assert_eq!(sum, json!(13));

        let difference = caller
            .call_path(&["calc", "sub"], vec![json!(9), json!(4)], Map::new(), Duration::from_secs(3))
            .await?;
        assert_eq!(difference, json!(5));
    }

    manager.request_shutdown();
    run.await?;
    Ok(())
}
