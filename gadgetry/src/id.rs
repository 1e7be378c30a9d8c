//! Process-wide invocation id allocation.
//!
//! Gadget calls that do not carry an id in their start marker get one minted
//! here. The counter is shared by every parser instance in the process, so
//! two concurrent streams can never hand out the same id.

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns the next invocation id, formatted `gadget_<N>`.
///
/// Ids are strictly increasing across the whole process run.
#[must_use]
pub fn next_invocation_id() -> String {
    format!("gadget_{}", next_raw())
}

/// Returns the next raw counter value (starting at 1).
#[must_use]
pub fn next_raw() -> u64 {
    COUNTER.fetch_add(1, Ordering::SeqCst) + 1
}

/// Resets the counter. Test harnesses only: real runs never reset, ids must
/// stay unique for the lifetime of the process.
#[doc(hidden)]
pub fn reset() {
    COUNTER.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let a = next_raw();
        let b = next_raw();
        let c = next_raw();
        assert!(a < b && b < c);
    }

    #[test]
    fn minted_ids_have_gadget_prefix() {
        let id = next_invocation_id();
        assert!(id.starts_with("gadget_"));
        let n: u64 = id["gadget_".len()..].parse().unwrap();
        assert!(n >= 1);
    }
}
