//! # Isle Runtime Demo - Main Entry Point
//!
//! A small binary that wires up a [`Manager`](isle_runtime::Manager) and a
//! couple of isles and runs one of two bundled scenarios to completion:
//!
//! - `add-sub`: an isle exposing `add`/`sub` is called through the explicit
//!   call-proxy from a second isle, which prints both results and then
//!   requests shutdown.
//! - `network`: a [`Server`](isle_runtime::peer::Server) isle accepts one
//!   connection and exchanges a packet with a directly-connected peer,
//!   demonstrating the TCP overlay end to end.
//!
//! ## Logging
//!
//! Structured logging follows this crate's lineage: a detailed layer
//! (file, or stderr with `--log-path stderr`) at the level selected by
//! `-v`/`-vv`/`-vvv`, plus an optional colorized stdout summary layer
//! unless `--quiet` is given.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use isle_runtime::cli::{Args, Scenario};
use isle_runtime::isle::{IsleBehavior, IsleCore};
use isle_runtime::logging::ColorizedFormatter;
use isle_runtime::peer::{Peer, Server};
use isle_runtime::{ManagerBuilder, RouteTable};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if args.log_path.as_os_str() == "stderr" {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let log_dir = args
            .log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let log_filename = args
            .log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("log.txt"));
        let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!(scenario = %args.scenario, "starting isle runtime demo");

    match args.scenario {
        Scenario::AddSub => run_add_sub(&args).await?,
        Scenario::Network => run_network(&args).await?,
    }

    info!("isle runtime demo completed");
    Ok(())
}

struct AddSub;

#[async_trait]
impl IsleBehavior for AddSub {
    fn routes(&self) -> RouteTable {
        let mut table = RouteTable::new();
        table.route("add", |args, _kwargs| async move {
            let a = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            let b = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(a + b))
        });
        table.route("sub", |args, _kwargs| async move {
            let a = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
            let b = args.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(a - b))
        });
        table
    }
}

/// Calls `calc.add`/`calc.sub` through the explicit call-proxy, prints both
/// results, then requests the manager shut down.
struct Caller;

#[async_trait]
impl IsleBehavior for Caller {
    async fn on_loop(&mut self, core: &mut IsleCore) {
        let sum = core
            .call_path(&["calc", "add"], vec![json!(4), json!(9)], Default::default(), Duration::from_secs(3))
            .await;
        let difference = core
            .call_path(&["calc", "sub"], vec![json!(4), json!(9)], Default::default(), Duration::from_secs(3))
            .await;
        info!(?sum, ?difference, "calc results");
        println!("4 + 9 = {sum:?}");
        println!("4 - 9 = {difference:?}");

        let packet = core.create_packet(
            vec![core.manager_id().to_string()],
            json!({"command": "shutdown"}),
        );
        core.send_packet(packet);
        core.stop();
    }
}

async fn run_add_sub(args: &Args) -> Result<()> {
    let manager = ManagerBuilder::new()
        .id(args.manager_id.clone())
        .log_path(args.log_path.clone())
        .build();

    manager.add_isle("calc", AddSub)?;
    manager.add_isle("caller", Caller)?;
    manager.start().await;
    Ok(())
}

/// A tiny isle that sends one packet to a remote server peer and prints
/// whatever comes back.
struct Client {
    peer: Peer,
    sent: bool,
}

#[async_trait]
impl IsleBehavior for Client {
    async fn on_loop(&mut self, core: &mut IsleCore) {
        if !self.sent {
            let packet = core.create_packet(vec!["server".to_string()], json!({"hello": 1}));
            if self.peer.queue_packet(&packet).is_ok() {
                self.sent = true;
            }
        }
    }
}

async fn run_network(args: &Args) -> Result<()> {
    let manager = ManagerBuilder::new()
        .id(args.manager_id.clone())
        .log_path(args.log_path.clone())
        .build();

    let server = Server::bind("127.0.0.1:0", manager.clone()).await?;
    let server_addr = server.local_addr();
    manager.add_isle("server", server)?;

    match Peer::connect(server_addr).await {
        Ok(peer) => {
            manager.add_isle("client", Client { peer, sent: false })?;
        }
        Err(e) => info!(error = %e, "could not connect the network demo's client peer"),
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.request_shutdown();
    manager.start().await;
    Ok(())
}
