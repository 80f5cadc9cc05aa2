//! Workflow gate for agent-proposed commands.
//!
//! Every command an agent wants to run is classified, checked against the
//! task's phase sequence and the authorization ledger, covered by a
//! version-control checkpoint when it writes, and recorded in a hash-chained
//! audit log. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, phase table,
//!   id derivation, audit chain). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, git, journals, state file,
//!   context mirror, approvals). Isolated behind traits to enable fakes in tests.
//!
//! Component modules ([`ledger`], [`audit`], [`checkpoint`], [`report`]) compose
//! the two; [`engine`] orchestrates them and [`commands`] maps the trigger
//! vocabulary onto the engine.

pub mod audit;
pub mod checkpoint;
pub mod clock;
pub mod commands;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
