pub mod command;
pub mod iptables;
pub mod monitor;
pub mod shaper;
pub mod stats;
pub mod tc;
