//! nethang - network impairment path engine
//!
//! Shapes forwarded traffic per "path" (a traffic selector with uplink and
//! downlink impairment settings) using `iptables` packet marks and
//! `tc` HTB classes with netem leaves.

pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod path;
pub mod store;
pub mod sync;

pub use engine::{Engine, EngineEvent, PathWatch, ToolStatus};
pub use error::{Error, ErrorKind, Failure, Result};
