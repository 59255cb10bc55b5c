//! # Isle
//!
//! `IsleCore` holds every piece of state the specification assigns to an
//! isle (identifier, route table, connection, running flag, side-buffer);
//! `IsleBehavior` is the trait a concrete isle implements for its
//! per-tick work and optional packet interception, mirroring the
//! `IpcTransport`-style async trait used for transports elsewhere in this
//! crate's lineage. `Isle<B>` ties the two together and drives the event
//! loop.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::connection::IsleConnection;
use crate::errors::IsleError;
use crate::packet::Packet;
use crate::routes::RouteTable;

/// Every tick sleeps at least this long between dispatch passes, giving
/// other execution contexts a chance to run.
pub use crate::defaults::COOPERATIVE_YIELD;

/// Default deadline for `request_response` when the caller does not
/// specify one.
pub use crate::defaults::REQUEST_TIMEOUT as DEFAULT_REQUEST_TIMEOUT;

/// The state and messaging operations every isle has, independent of its
/// behavior.
pub struct IsleCore {
    identifier: String,
    manager_id: String,
    conn: IsleConnection,
    routes: RouteTable,
    /// Packets observed by `request_response` while waiting for a specific
    /// reply, stashed instead of being re-enqueued onto the live inbound
    /// queue. Re-injected, in arrival order, into the next `drain_incoming`
    /// pass. This is the side-buffer mandated by D3 to avoid the livelock
    /// risk of the original busy-wait-and-reenqueue approach.
    side_buffer: Vec<Packet>,
    running: bool,
}

impl IsleCore {
    pub fn new(
        identifier: impl Into<String>,
        manager_id: impl Into<String>,
        conn: IsleConnection,
        routes: RouteTable,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            manager_id: manager_id.into(),
            conn,
            routes,
            side_buffer: Vec::new(),
            running: true,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Set from within the isle's own execution context (e.g. in response
    /// to application-level logic in `on_loop`). Setting this from another
    /// context does not cancel an in-flight `request_response`.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Inject a packet as though it had just arrived on the inbound queue
    /// this tick, without it passing through the manager. Socket-backed
    /// isles (`peer::Peer`) use this to feed decoded wire frames into the
    /// same §4.3.1 dispatch predicates that manager-routed packets go
    /// through. Shares the D3 side-buffer, so ordering relative to any
    /// in-flight `request_response` wait is preserved.
    pub fn inject_incoming(&mut self, packet: Packet) {
        self.side_buffer.push(packet);
    }

    /// Build a packet addressed away from this isle, with `sender` seeded
    /// to this isle's own identifier.
    pub fn create_packet(&self, receiver: Vec<String>, data: Value) -> Packet {
        Packet::new(vec![self.identifier.clone()], receiver, data)
    }

    /// Emit a packet toward the manager without awaiting a reply. Returns
    /// the packet's identifier.
    pub fn send_packet(&self, packet: Packet) -> String {
        let identifier = packet.identifier.clone();
        self.conn.owner_send(packet);
        identifier
    }

    /// Ask the manager to admit a new isle, deferred to its
    /// `pending-additions` list under the membership mutex. `pending_token`
    /// identifies an isle the caller has already registered with
    /// `Manager::prepare_add_isle` — packets cannot carry a live isle
    /// instance, so the token stands in for D5's out-of-band control
    /// channel.
    pub fn request_add_isle(&self, pending_token: u64) {
        let packet = self.create_packet(
            vec![self.manager_id.clone()],
            json!({"command": "addIsle", "pending_token": pending_token}),
        );
        self.conn.owner_send(packet);
    }

    /// The explicit call-proxy surface (D2): `path` is given in call order
    /// (`["A", "B", "C"]` for the sugar `call.A.B.C(...)`), and is reversed
    /// to build `receiver` so the final destination is first (P7).
    pub async fn call_path(
        &mut self,
        path: &[&str],
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, IsleError> {
        let receiver: Vec<String> = path.iter().rev().map(|s| s.to_string()).collect();
        let data = json!({"args": args, "kwargs": kwargs});
        let packet = self.create_packet(receiver, data);
        self.request_response(packet, timeout).await
    }

    /// §4.3.2: send `packet` and wait for a matching reply. Non-matching
    /// packets observed while waiting are stashed (D3) rather than
    /// re-enqueued, and become visible to the next `drain_incoming` pass in
    /// the order they arrived.
    pub async fn request_response(
        &mut self,
        packet: Packet,
        timeout: Duration,
    ) -> Result<Value, IsleError> {
        let identifier = packet.identifier.clone();
        let destination = packet.receiver.clone();
        self.conn.owner_send(packet);

        let deadline = Instant::now() + timeout;
        loop {
            match self.conn.owner_receive() {
                Some(reply) if reply.identifier == identifier => {
                    if let Some(value) = reply.data.get("return") {
                        return Ok(value.clone());
                    }
                    if let Some(exception) = reply.data.get("exception") {
                        return Err(IsleError::HandlerError {
                            route: destination.join("."),
                            message: exception.to_string(),
                        });
                    }
                    return Err(IsleError::MalformedPacket(
                        "reply carried neither return nor exception".to_string(),
                    ));
                }
                Some(other) => self.side_buffer.push(other),
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
            if Instant::now() >= deadline {
                return Err(IsleError::Timeout { identifier });
            }
        }
    }

    /// §4.3.1: the default incoming-packet dispatch, in predicate order.
    async fn dispatch_default(&mut self, packet: Packet) {
        if is_late_reply(&packet) {
            debug!(identifier = %packet.identifier, "dropping late reply");
            return;
        }

        if let Some(route) = islet_target(&packet, &self.identifier, &self.routes) {
            self.dispatch_islet(packet, route).await;
            return;
        }

        if packet.data == Value::String("shutdown".to_string()) {
            self.running = false;
            return;
        }

        let reply = packet.reply(json!({"exception": "no-taker"}));
        self.conn.owner_send(reply);
    }

    async fn dispatch_islet(&mut self, packet: Packet, route: String) {
        let args = match packet.data.get("args").and_then(Value::as_array) {
            Some(a) => a.clone(),
            None => {
                let reply = packet.reply(json!({
                    "exception": format!("invocation shape error calling {route}: missing args")
                }));
                self.conn.owner_send(reply);
                return;
            }
        };
        let kwargs = match packet.data.get("kwargs").and_then(Value::as_object) {
            Some(k) => k.clone(),
            None => {
                let reply = packet.reply(json!({
                    "exception": format!("invocation shape error calling {route}: missing kwargs")
                }));
                self.conn.owner_send(reply);
                return;
            }
        };

        let reply_data = match self.routes.call(&route, args, kwargs).await {
            Ok(value) => json!({"return": value}),
            Err(err) => json!({"exception": err.to_string()}),
        };
        let reply = packet.reply(reply_data);
        self.conn.owner_send(reply);
    }
}

fn is_late_reply(packet: &Packet) -> bool {
    matches!(&packet.data, Value::Object(map) if map.contains_key("return") || map.contains_key("exception"))
}

/// A packet targets a local route when exactly two hops remain, the tail
/// is this isle's id, and the second-to-last hop names an exposed handler
/// (P5: unexposed names do not match, and fall through to the `no-taker`
/// catch-all like any other unmatched shape).
fn islet_target(packet: &Packet, own_id: &str, routes: &RouteTable) -> Option<String> {
    if packet.receiver.len() != 2 {
        return None;
    }
    if packet.receiver.last().map(String::as_str) != Some(own_id) {
        return None;
    }
    let route = &packet.receiver[0];
    if !routes.contains(route) {
        return None;
    }
    Some(route.clone())
}

/// Per-tick behavior a concrete isle supplies. Default method bodies are
/// no-ops, matching the shape of `IpcTransport`'s optional multi-client
/// methods elsewhere in this crate's lineage.
#[async_trait]
pub trait IsleBehavior: Send + 'static {
    /// Build the routes this isle exposes. Called once, at construction.
    fn routes(&self) -> RouteTable {
        RouteTable::new()
    }

    /// The user-overridable per-tick work, run before incoming packets are
    /// dispatched.
    async fn on_loop(&mut self, _core: &mut IsleCore) {}

    /// Intercept a packet before the default §4.3.1 dispatch runs.
    /// Returning `true` means the packet was fully handled. Peer-style
    /// isles use this to forward manager-addressed packets onto a socket
    /// TX buffer instead of treating them as islet requests.
    async fn on_packet(&mut self, _core: &mut IsleCore, _packet: &Packet) -> bool {
        false
    }

    /// Runs exactly once after the event loop exits.
    async fn on_shutdown(&mut self, _core: &mut IsleCore) {}
}

/// Ties an `IsleCore` to its behavior and drives the event loop.
pub struct Isle<B: IsleBehavior> {
    core: IsleCore,
    behavior: B,
}

impl<B: IsleBehavior> Isle<B> {
    pub fn new(
        identifier: impl Into<String>,
        manager_id: impl Into<String>,
        conn: IsleConnection,
        behavior: B,
    ) -> Self {
        let routes = behavior.routes();
        Self {
            core: IsleCore::new(identifier, manager_id, conn, routes),
            behavior,
        }
    }

    /// Run the event loop to completion: `on_loop`, incoming-packet
    /// dispatch, cooperative yield, repeating until `running` is false,
    /// then `on_shutdown` exactly once.
    pub async fn run_to_completion(mut self) {
        while self.core.running {
            self.behavior.on_loop(&mut self.core).await;
            self.drain_incoming().await;
            if !self.core.running {
                break;
            }
            tokio::time::sleep(COOPERATIVE_YIELD).await;
        }
        self.behavior.on_shutdown(&mut self.core).await;
    }

    /// Spawn this isle's event loop as its own execution context.
    pub fn spawn(self) -> tokio::task::JoinHandle<()>
    where
        B: Send,
    {
        tokio::task::spawn(self.run_to_completion())
    }

    async fn drain_incoming(&mut self) {
        let mut drained: Vec<Packet> = std::mem::take(&mut self.core.side_buffer);
        while let Some(packet) = self.core.conn.owner_receive() {
            drained.push(packet);
        }
        for packet in drained {
            if self.behavior.on_packet(&mut self.core, &packet).await {
                continue;
            }
            self.core.dispatch_default(packet).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

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
    async fn islet_dispatch_returns_value() {
        let (isle_conn, manager_conn) = Connection::pair();
        let isle = Isle::new("calc", "islemanager", isle_conn, AddSub);
        let handle = isle.spawn();

        let mut manager_conn = manager_conn;
        let request = Packet::new(
            vec!["caller".to_string()],
            vec!["add".to_string(), "calc".to_string()],
            json!({"args": [3, 6], "kwargs": {}}),
        );
        let identifier = request.identifier.clone();
        manager_conn.router_send(request);

        let reply = loop {
            if let Some(p) = manager_conn.router_receive() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(reply.identifier, identifier);
        assert_eq!(reply.data, json!({"return": 9}));

        manager_conn.router_send(Packet::new(vec![], vec!["calc".to_string()], Value::String("shutdown".to_string())));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_receiver_gets_no_taker_reply() {
        let (isle_conn, manager_conn) = Connection::pair();
        let isle = Isle::new("lonely", "islemanager", isle_conn, AddSub);
        let handle = isle.spawn();

        let mut manager_conn = manager_conn;
        manager_conn.router_send(Packet::new(
            vec!["caller".to_string()],
            vec!["lonely".to_string()],
            json!({"anything": true}),
        ));

        let reply = loop {
            if let Some(p) = manager_conn.router_receive() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(reply.data, json!({"exception": "no-taker"}));

        manager_conn.router_send(Packet::new(vec![], vec!["lonely".to_string()], Value::String("shutdown".to_string())));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shape_matching_but_unexposed_route_falls_through_to_no_taker() {
        let (isle_conn, manager_conn) = Connection::pair();
        let isle = Isle::new("calc", "islemanager", isle_conn, AddSub);
        let handle = isle.spawn();

        let mut manager_conn = manager_conn;
        manager_conn.router_send(Packet::new(
            vec!["caller".to_string()],
            vec!["multiply".to_string(), "calc".to_string()],
            json!({"args": [3, 6], "kwargs": {}}),
        ));

        let reply = loop {
            if let Some(p) = manager_conn.router_receive() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(reply.data, json!({"exception": "no-taker"}));

        manager_conn.router_send(Packet::new(vec![], vec!["calc".to_string()], Value::String("shutdown".to_string())));
        handle.await.unwrap();
    }
}
