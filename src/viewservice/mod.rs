//! The view service arbitrates replica membership.
//!
//! It tracks which servers are alive via their pings, decides who is primary
//! and who is backup, and sequences every role change through numbered
//! [`crate::View`]s. A proposed view only becomes current once the primary of
//! the current view has acknowledged it, which is what keeps two servers from
//! acting as primary at the same time.

mod client;
mod server;

pub use client::ViewClient;
pub use server::ViewServer;
