//! Library crate for edge-scan-rs exposing reusable modules.
pub mod bench;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod probe;
pub mod ranking;
pub mod scanner;
pub mod server;
pub mod sources;
pub mod speed;
pub mod subnets;
pub mod trace;
pub mod types;
