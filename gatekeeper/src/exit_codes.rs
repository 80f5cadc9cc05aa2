//! Stable exit codes for `gate` CLI commands.

use crate::core::types::DenialReason;
use crate::error::GateError;

/// Command succeeded or the proposal was approved.
pub const OK: i32 = 0;
/// Invalid input, layout or config, or any error without a denial kind.
pub const INVALID: i32 = 1;
/// `denied:phase-violation`.
pub const PHASE_VIOLATION: i32 = 3;
/// `denied:unauthorized`.
pub const UNAUTHORIZED: i32 = 4;
/// `denied:checkpoint-failed`.
pub const CHECKPOINT_FAILED: i32 = 5;
/// `denied:storage-failed`.
pub const STORAGE_FAILED: i32 = 6;

pub fn for_denial(reason: DenialReason) -> i32 {
    match reason {
        DenialReason::PhaseViolation => PHASE_VIOLATION,
        DenialReason::Unauthorized => UNAUTHORIZED,
        DenialReason::CheckpointFailed => CHECKPOINT_FAILED,
        DenialReason::StorageFailed => STORAGE_FAILED,
    }
}

pub fn for_error(err: &GateError) -> i32 {
    err.denial_reason().map_or(INVALID, for_denial)
}
