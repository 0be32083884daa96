//! The pipeline-position status bitmask shared by outbox, inbox, and
//! perspective rows.
//!
//! Status is advisory, not a state machine: completions are applied by
//! bitwise-OR into the existing column (`spec.md` §4.1 step 3), so a row
//! can carry `PUBLISHED | RECEPTOR_PROCESSED` simultaneously once both
//! have happened. `FAILED` can be set alongside any earlier bit; it does
//! not clear them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StatusFlags: i32 {
        const STORED                         = 1 << 0;
        const PUBLISHED                      = 1 << 1;
        const DELIVERED                      = 1 << 2;
        const RECEPTOR_PROCESSED             = 1 << 3;
        const PERSPECTIVE_PROCESSED_INLINE   = 1 << 4;
        const PERSPECTIVE_PROCESSED_ASYNC    = 1 << 5;
        const FAILED                         = 1 << 6;
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        StatusFlags::STORED
    }
}

impl StatusFlags {
    /// Apply a completion: OR the given status into this one. Per
    /// `spec.md` §4.1 step 3, a completion with status `0` (empty) still
    /// counts as a completion — the caller applies it to clear the lease
    /// even though it changes no bits.
    pub fn apply_completion(self, completed: StatusFlags) -> StatusFlags {
        self | completed
    }

    /// Apply a failure: OR the completed status in, then set `FAILED`.
    pub fn apply_failure(self, completed_status: StatusFlags) -> StatusFlags {
        self | completed_status | StatusFlags::FAILED
    }

    pub fn is_failed(self) -> bool {
        self.contains(StatusFlags::FAILED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_idempotence() {
        let once = StatusFlags::STORED.apply_completion(StatusFlags::PUBLISHED);
        let twice = once.apply_completion(StatusFlags::PUBLISHED);
        assert_eq!(once, twice);
    }

    #[test]
    fn zero_status_completion_changes_no_bits() {
        let before = StatusFlags::STORED | StatusFlags::PUBLISHED;
        let after = before.apply_completion(StatusFlags::empty());
        assert_eq!(before, after);
    }

    #[test]
    fn failure_sets_failed_without_clearing_prior_bits() {
        let before = StatusFlags::STORED | StatusFlags::PUBLISHED;
        let after = before.apply_failure(StatusFlags::DELIVERED);
        assert!(after.contains(StatusFlags::STORED));
        assert!(after.contains(StatusFlags::PUBLISHED));
        assert!(after.contains(StatusFlags::DELIVERED));
        assert!(after.is_failed());
    }

    #[test]
    fn bits_ordered_by_pipeline_position() {
        assert!(StatusFlags::STORED.bits() < StatusFlags::PUBLISHED.bits());
        assert!(StatusFlags::PUBLISHED.bits() < StatusFlags::DELIVERED.bits());
        assert!(StatusFlags::DELIVERED.bits() < StatusFlags::RECEPTOR_PROCESSED.bits());
        assert!(
            StatusFlags::RECEPTOR_PROCESSED.bits()
                < StatusFlags::PERSPECTIVE_PROCESSED_INLINE.bits()
        );
        assert!(
            StatusFlags::PERSPECTIVE_PROCESSED_INLINE.bits()
                < StatusFlags::PERSPECTIVE_PROCESSED_ASYNC.bits()
        );
        assert!(StatusFlags::PERSPECTIVE_PROCESSED_ASYNC.bits() < StatusFlags::FAILED.bits());
    }
}
