//! Core of the forever web dashboard: control-socket RPC, process
//! discovery, shared log tails and the refresh loop that feeds viewers.

pub mod beats;
pub mod config;
pub mod dashboard;
pub mod events;
pub mod refresh;
pub mod registry;
pub mod render;
pub mod rpc;
pub mod stat;
pub mod tail;
pub mod viewers;
