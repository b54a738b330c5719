//! Contains common, primitive identifier types.
//!
//! Handlers on the event bus are keyed with a `slotmap` key so that a removed
//! handler's id is never handed out again. Function states get a process-wide
//! monotonic id, which is how a runner tells a hot-swapped state apart from an
//! in-place argument update.

use slotmap::new_key_type;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

new_key_type! {
    /// Uniquely and safely identifies a handler registered on the event bus.
    pub struct HandlerId;
}

/// Identifies one pushed function state.
///
/// Every `push` creates a new id. `update_state` keeps the id, so argument
/// changes made by a function rescheduling itself are not reported as a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StateId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ids_are_unique_and_increasing() {
        let a = StateId::next();
        let b = StateId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
