//! I/O helpers for the gate: config, git, journals, state, mirror, approval.

pub mod approval;
pub mod config;
pub mod fsutil;
pub mod git;
pub mod init;
pub mod journal;
pub mod mirror;
pub mod process;
pub mod report_out;
pub mod state_store;
