//! A primary/backup replicated key-value store arbitrated by a view service.
//!
//! The view service is the single authority on replica roles: it hands out
//! numbered [`View`]s naming a primary and a backup, and only advances to a
//! new view once the current primary has acknowledged the current one. The
//! PB servers consult it to decide whether they may serve a request and who
//! to replicate writes to.
//!
//! Known limitations, deliberate in this design: the per-server dedup table
//! is never evicted; a Put holds the server's state lock across the forward
//! RPC to the backup; and timeout-based failure detection cannot tell a
//! partitioned-but-alive server from a crashed one.

use std::time::Duration;

pub mod client;
pub mod error;
pub mod server;
pub mod view;
pub mod viewservice;

pub mod proto {
    tonic::include_proto!("pbkv");
}

pub use client::Clerk;
pub use error::{Error, Result};
pub use server::PbServer;
pub use view::View;
pub use viewservice::{ViewClient, ViewServer};

/// How often servers ping the view service, and how often it sweeps for
/// dead servers.
pub const PING_INTERVAL: Duration = Duration::from_millis(100);

/// A server missing this many consecutive ping intervals is declared dead.
pub const DEAD_PINGS: u32 = 5;

/// The liveness cutoff used by the view service's sweep.
pub fn dead_interval() -> Duration {
    PING_INTERVAL * DEAD_PINGS
}
