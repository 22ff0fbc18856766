// Partlog Kernel
//
// Offset management and event-log engine for a partitioned message broker.

pub mod boot;
pub mod broker;
pub mod config;
pub mod log;
pub mod offset;
pub mod store;
pub mod topic;
