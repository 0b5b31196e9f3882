//! Adaptive feed poller.
//!
//! Polls RSS, Atom and JSON feeds on a per-source schedule learned from each
//! source's publishing history, backing off on errors and routing around
//! anti-bot walls through a rotating proxy pool.

pub mod config;
pub mod feed;
pub mod poller;
pub mod reconcile;
pub mod schedule;
pub mod storage;
pub mod util;
