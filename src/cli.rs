//! # Command-Line Interface
//!
//! A small `clap`-derived argument surface for the demo binary. CLI entry
//! points are explicitly out of scope as a *feature surface* (spec.md §1),
//! so this stays intentionally small — just enough to configure the
//! manager's identity, log destination, verbosity, and which bundled demo
//! scenario to run.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};

/// Replicates the clap v3-era coloring for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Isle Runtime - a small in-process actor/microservice demo
///
/// Wires up a manager and a couple of isles and runs one of the bundled
/// demo scenarios to completion (or until Ctrl-C).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Which bundled demo scenario to run.
    #[arg(value_enum, default_value_t = Scenario::AddSub)]
    pub scenario: Scenario,

    /// The manager's own identifier, addressed as the tail of a
    /// manager-bound packet's `receiver`.
    #[arg(long, default_value = crate::defaults::MANAGER_ID)]
    pub manager_id: String,

    /// Where the routing log is appended.
    #[arg(long, default_value = crate::defaults::LOG_PATH)]
    pub log_path: std::path::PathBuf,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: info
    ///  -vv: debug
    ///  -vvv: trace
    /// By default, only WARNING and ERROR messages are shown.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence the colorized stdout summary; diagnostic logs still go to
    /// stderr.
    #[arg(short, long)]
    pub quiet: bool,
}

/// A bundled demo scenario, each exercising a different part of the
/// runtime end to end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Two isles: one exposes `add`/`sub`, the other calls it via the
    /// call-proxy and prints the results.
    #[value(name = "add-sub")]
    AddSub,

    /// A server isle accepts one connection and exchanges a packet with a
    /// directly-connected peer, demonstrating the network overlay.
    #[value(name = "network")]
    Network,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::AddSub => write!(f, "add-sub"),
            Scenario::Network => write!(f, "network"),
        }
    }
}
