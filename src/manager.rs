//! # Manager
//!
//! The manager owns isle lifecycle and routes every packet by inspecting
//! `receiver`'s tail. Membership (`isles`) and deferred admissions
//! (`pending_additions`) share `std::sync::Mutex` guards rather than
//! `tokio::sync::Mutex` — every critical section here is non-blocking
//! (`HashMap` bookkeeping, non-blocking channel polls, a synchronous log
//! append) so a standard mutex is both sufficient and, crucially, lets
//! `TempIsle::drop` remove its own membership entry synchronously without
//! needing an async runtime at drop time.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::{Connection, ManagerConnection};
use crate::errors::IsleError;
use crate::isle::{Isle, IsleBehavior, COOPERATIVE_YIELD};
use crate::packet::Packet;
use crate::temp_isle::TempIsle;

/// An admitted isle's manager-side bookkeeping: its half of the
/// Connection, and the task running its event loop. `task` is `None` for
/// `TempIsle`s, which have no execution context of their own.
struct IsleEntry {
    connection: ManagerConnection,
    task: Option<JoinHandle<()>>,
}

/// Builds, registers, and spawns an isle once the manager decides to admit
/// it. Boxed so isles of heterogeneous `IsleBehavior` types can share one
/// `pending_additions` list, and deferred so the task is only spawned at
/// admission time (mirroring the source's "construct, then later start a
/// thread for it" two-step).
type Admitter = Box<dyn FnOnce(&str) -> (ManagerConnection, JoinHandle<()>) + Send>;

struct PendingIsle {
    identifier: String,
    admit: Admitter,
}

/// Configures and constructs a [`Manager`].
pub struct ManagerBuilder {
    id: String,
    log_path: PathBuf,
    install_signal_handler: bool,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            id: crate::defaults::MANAGER_ID.to_string(),
            log_path: PathBuf::from(crate::defaults::LOG_PATH),
            install_signal_handler: true,
        }
    }
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager's own identifier, addressed by isles as the tail of a
    /// manager-bound packet's `receiver`. Defaults to `"islemanager"`.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Where the routing log is appended. Defaults to `log.txt` in the
    /// working directory.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    /// Whether `Manager::start` installs a `Ctrl-C` handler that flips
    /// `running` to false. D4 requires this be disable-able so tests don't
    /// install a process-wide signal handler.
    pub fn install_signal_handler(mut self, install: bool) -> Self {
        self.install_signal_handler = install;
        self
    }

    pub fn build(self) -> Arc<Manager> {
        Arc::new(Manager {
            id: self.id,
            log_path: self.log_path,
            install_signal_handler: self.install_signal_handler,
            isles: Mutex::new(HashMap::new()),
            pending_additions: Mutex::new(Vec::new()),
            prepared: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            running: AtomicBool::new(true),
            log_buffer: Mutex::new(String::new()),
        })
    }
}

/// The central router. Owns isle lifecycle, the membership registry, and
/// the `log.txt` routing log.
pub struct Manager {
    id: String,
    log_path: PathBuf,
    install_signal_handler: bool,
    isles: Mutex<HashMap<String, IsleEntry>>,
    pending_additions: Mutex<Vec<PendingIsle>>,
    prepared: Mutex<HashMap<u64, PendingIsle>>,
    next_token: AtomicU64,
    running: AtomicBool,
    log_buffer: Mutex<String>,
}

impl Manager {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register and spawn a new isle immediately. Identifier collisions are
    /// rejected (spec's recommended, not mandated, policy — see DESIGN.md):
    /// silently overwriting a running isle would leak its task with no way
    /// to join or route to it again.
    pub fn add_isle<B: IsleBehavior>(
        &self,
        identifier: impl Into<String>,
        behavior: B,
    ) -> Result<(), IsleError> {
        let identifier = identifier.into();
        let mut isles = self.isles.lock().unwrap();
        if isles.contains_key(&identifier) {
            return Err(IsleError::DuplicateIsle(identifier));
        }
        let (isle_conn, manager_conn) = Connection::pair();
        let isle = Isle::new(identifier.clone(), self.id.clone(), isle_conn, behavior);
        let task = isle.spawn();
        isles.insert(identifier, IsleEntry { connection: manager_conn, task: Some(task) });
        Ok(())
    }

    /// Build (but do not yet spawn) an isle, and return a token an
    /// already-running isle can embed in an `{command: "addIsle",
    /// pending_token}` packet (see SPEC_FULL.md §4.5, D5). The isle is
    /// only spawned once that packet is routed and admitted.
    pub fn prepare_add_isle<B: IsleBehavior>(&self, identifier: impl Into<String>, behavior: B) -> u64 {
        let identifier = identifier.into();
        let admit_identifier = identifier.clone();
        let admit: Admitter = Box::new(move |manager_id: &str| {
            let (isle_conn, manager_conn) = Connection::pair();
            let isle = Isle::new(admit_identifier, manager_id.to_string(), isle_conn, behavior);
            let task = isle.spawn();
            (manager_conn, task)
        });
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.prepared
            .lock()
            .unwrap()
            .insert(token, PendingIsle { identifier, admit });
        token
    }

    /// Enter a scoped [`TempIsle`] for a foreign execution context (see
    /// `temp_isle.rs`).
    pub fn enter_temp_isle(self: &Arc<Self>, identifier: impl Into<String>) -> Result<TempIsle, IsleError> {
        TempIsle::enter(self.clone(), identifier)
    }

    pub(crate) fn register_membership(
        &self,
        identifier: String,
        connection: ManagerConnection,
    ) -> Result<(), IsleError> {
        let mut isles = self.isles.lock().unwrap();
        if isles.contains_key(&identifier) {
            return Err(IsleError::DuplicateIsle(identifier));
        }
        isles.insert(identifier, IsleEntry { connection, task: None });
        Ok(())
    }

    pub(crate) fn remove_membership(&self, identifier: &str) {
        self.isles.lock().unwrap().remove(identifier);
    }

    /// Run the routing loop until `running` becomes false, then run the
    /// shutdown sequence. Returns only after every admitted isle's task has
    /// been joined.
    pub async fn start(self: &Arc<Self>) {
        if self.install_signal_handler {
            let manager = self.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    manager.running.store(false, Ordering::SeqCst);
                }
            });
        }

        while self.running.load(Ordering::SeqCst) {
            self.route_once();
            tokio::time::sleep(COOPERATIVE_YIELD).await;
        }
        self.stop().await;
    }

    /// Flip `running` to false without waiting for a signal. Exposed so a
    /// manager-addressed `{command: "shutdown"}` or an embedding
    /// application can request shutdown directly.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn route_once(&self) {
        let mut isles = self.isles.lock().unwrap();
        let ids: Vec<String> = isles.keys().cloned().collect();

        for id in &ids {
            loop {
                let packet = match isles.get_mut(id).and_then(|entry| entry.connection.router_receive()) {
                    Some(p) => p,
                    None => break,
                };
                self.write_to_log_buffer(&packet);
                if has_key(&packet.data, "exception") {
                    self.flush_log();
                }

                match packet.receiver.last().cloned() {
                    None => {
                        warn!(identifier = %packet.identifier, "dropping malformed packet with empty receiver");
                    }
                    Some(dest) if dest == self.id => {
                        self.handle_manager_packet(packet);
                    }
                    Some(dest) if isles.contains_key(&dest) => {
                        if let Some(target) = isles.get(&dest) {
                            target.connection.router_send(packet);
                        }
                    }
                    Some(dest) => {
                        let reply = Packet::with_identifier(
                            vec![self.id.clone()],
                            packet.sender.clone(),
                            json!({"exception": format!("unknown destination: {dest}")}),
                            Some(packet.identifier.clone()),
                        );
                        self.write_to_log_buffer(&reply);
                        if let Some(origin) = isles.get(id) {
                            origin.connection.router_send(reply);
                        }
                    }
                }
            }
            self.flush_log();
        }

        let drained: Vec<PendingIsle> = self.pending_additions.lock().unwrap().drain(..).collect();
        for pending in drained {
            if isles.contains_key(&pending.identifier) {
                warn!(identifier = %pending.identifier, "dropping duplicate pending isle admission");
                continue;
            }
            let (connection, task) = (pending.admit)(&self.id);
            isles.insert(pending.identifier, IsleEntry { connection, task: Some(task) });
        }
    }

    /// `{command: "shutdown"}` flips `running`. `{command: "addIsle",
    /// pending_token}` moves the matching prepared isle onto
    /// `pending_additions`, to be admitted under the same lock the routing
    /// loop already holds. Anything else is dropped with a warning.
    fn handle_manager_packet(&self, packet: Packet) {
        let command = packet.data.get("command").and_then(Value::as_str);
        match command {
            Some("shutdown") => self.request_shutdown(),
            Some("addIsle") => {
                let token = packet.data.get("pending_token").and_then(Value::as_u64);
                match token.and_then(|t| self.prepared.lock().unwrap().remove(&t)) {
                    Some(pending) => self.pending_additions.lock().unwrap().push(pending),
                    None => warn!("addIsle command referenced an unknown pending_token"),
                }
            }
            Some(other) => warn!(command = other, "dropping unrecognized manager command"),
            None => warn!("dropping manager packet without a command"),
        }
    }

    fn write_to_log_buffer(&self, packet: &Packet) {
        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let line = format!(
            "{}, {:?}, {:?}, {}, {}\n",
            unix_seconds, packet.sender, packet.receiver, packet.identifier, packet.data
        );
        self.log_buffer.lock().unwrap().push_str(&line);
    }

    /// Append the accumulated log buffer to `log.txt`. Write failures are
    /// non-fatal: the buffer is left intact so the same content is retried
    /// on the next flush.
    fn flush_log(&self) {
        let mut buffer = self.log_buffer.lock().unwrap();
        if buffer.is_empty() {
            return;
        }
        match OpenOptions::new().create(true).append(true).open(&self.log_path) {
            Ok(mut file) => match file.write_all(buffer.as_bytes()) {
                Ok(()) => buffer.clear(),
                Err(e) => warn!(error = %e, "failed to write routing log, will retry"),
            },
            Err(e) => warn!(error = %e, "failed to open routing log, will retry"),
        }
    }

    /// Flush, deliver a shutdown packet to every registered isle, flush
    /// again, then join every spawned task. `TempIsle` entries (whose task
    /// is `None`) are skipped, never joined.
    async fn stop(&self) {
        self.flush_log();
        {
            let isles = self.isles.lock().unwrap();
            for (identifier, entry) in isles.iter() {
                let shutdown = Packet::new(
                    vec![self.id.clone()],
                    vec![identifier.clone()],
                    Value::String("shutdown".to_string()),
                );
                self.write_to_log_buffer(&shutdown);
                entry.connection.router_send(shutdown);
            }
        }
        self.flush_log();

        let tasks: Vec<JoinHandle<()>> = {
            let mut isles = self.isles.lock().unwrap();
            isles.values_mut().filter_map(|entry| entry.task.take()).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn has_key(data: &Value, key: &str) -> bool {
    matches!(data, Value::Object(map) if map.contains_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isle::IsleBehavior;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct Echo;

    #[async_trait]
    impl IsleBehavior for Echo {
        fn routes(&self) -> crate::routes::RouteTable {
            let mut table = crate::routes::RouteTable::new();
            table.route("ping", |_args, _kwargs| async move { Ok(json!("pong")) });
            table
        }
    }

    struct Idle;

    #[async_trait]
    impl IsleBehavior for Idle {}

    #[tokio::test]
    async fn add_isle_rejects_duplicate_identifier() {
        let dir = tempdir().unwrap();
        let manager = ManagerBuilder::new()
            .log_path(dir.path().join("log.txt"))
            .install_signal_handler(false)
            .build();

        manager.add_isle("dup", Idle).unwrap();
        let err = manager.add_isle("dup", Idle).unwrap_err();
        assert!(matches!(err, IsleError::DuplicateIsle(ref id) if id == "dup"));
        manager.request_shutdown();
        manager.start().await;
    }

    #[tokio::test]
    async fn unknown_destination_gets_synthesized_exception() {
        let dir = tempdir().unwrap();
        let manager = ManagerBuilder::new()
            .log_path(dir.path().join("log.txt"))
            .install_signal_handler(false)
            .build();

        let (mut caller_conn, manager_conn) = Connection::pair();
        manager
            .register_membership("caller".to_string(), manager_conn)
            .unwrap();

        caller_conn.owner_send(Packet::new(
            vec!["caller".to_string()],
            vec!["ghost".to_string()],
            json!({"args": [], "kwargs": {}}),
        ));

        manager.route_once();

        let reply = caller_conn.owner_receive().expect("expected a synthesized reply");
        assert_eq!(reply.sender, vec!["islemanager".to_string()]);
        assert_eq!(
            reply.data,
            json!({"exception": "unknown destination: ghost"})
        );
    }

    #[tokio::test]
    async fn islet_request_returns_value_end_to_end() {
        let dir = tempdir().unwrap();
        let manager = ManagerBuilder::new()
            .log_path(dir.path().join("log.txt"))
            .install_signal_handler(false)
            .build();

        manager.add_isle("calc", Echo).unwrap();
        let manager_for_loop = manager.clone();
        let run = tokio::spawn(async move { manager_for_loop.start().await });

        let (mut caller_conn, manager_conn) = Connection::pair();
        manager
            .register_membership("caller".to_string(), manager_conn)
            .unwrap();

        let request = Packet::new(
            vec!["caller".to_string()],
            vec!["ping".to_string(), "calc".to_string()],
            json!({"args": [], "kwargs": {}}),
        );
        let identifier = request.identifier.clone();
        caller_conn.owner_send(request);

        let reply = loop {
            if let Some(p) = caller_conn.owner_receive() {
                break p;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(reply.identifier, identifier);
        assert_eq!(reply.data, json!({"return": "pong"}));

        manager.request_shutdown();
        run.await.unwrap();
    }
}
