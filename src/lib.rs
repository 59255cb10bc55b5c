//! # Isle Runtime
//!
//! A small in-process actor/microservice runtime. Independent units of
//! computation ("isles") each run on their own execution context,
//! communicate exclusively by asynchronous messages ("packets"), and are
//! coordinated by a central router ("manager"). A packet-transport overlay
//! lets isles on different hosts communicate over TCP sockets using a
//! length-safe framed encoding (COBS).

pub mod cli;
pub mod connection;
pub mod errors;
pub mod isle;
pub mod logging;
pub mod manager;
pub mod packet;
pub mod peer;
pub mod routes;
pub mod temp_isle;

pub use connection::{Connection, IsleConnection, ManagerConnection};
pub use errors::IsleError;
pub use isle::{Isle, IsleBehavior, IsleCore};
pub use manager::{Manager, ManagerBuilder};
pub use packet::Packet;
pub use routes::RouteTable;
pub use temp_isle::TempIsle;

/// The current version of the isle runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Default manager identifier, addressed as the tail of a
    /// manager-bound packet's `receiver` (spec.md §9: configurable, but
    /// this is the default every other example uses).
    pub const MANAGER_ID: &str = "islemanager";

    /// Default deadline for `request_response` when the caller does not
    /// specify one.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Cooperative-yield interval every isle's and the manager's event
    /// loop sleeps for between ticks.
    pub const COOPERATIVE_YIELD: Duration = Duration::from_millis(10);

    /// Default path for the manager's routing log.
    pub const LOG_PATH: &str = "log.txt";
}
