//! Cooperating memory consumers.
//!
//! Operators that hold execution memory implement [`MemoryConsumer`] so
//! the task manager can ask them to shrink when another consumer in the
//! same task runs short. Consumers are identified by pointer identity;
//! the manager never inspects their internals.

use std::fmt;
use std::sync::Arc;

use crate::error::MemoryResult;

/// Stable identity of a consumer within a task.
///
/// Derived from the consumer's address, so it is unique while the
/// consumer is alive and can be recomputed from any shared handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConsumerId(usize);

impl ConsumerId {
    /// Identity used for bookkeeping that is not tied to a live
    /// consumer, such as tearing down leaked pages.
    pub const ANONYMOUS: ConsumerId = ConsumerId(0);

    /// Identity of a live consumer.
    pub fn of(consumer: &dyn MemoryConsumer) -> Self {
        ConsumerId((consumer as *const dyn MemoryConsumer).cast::<()>() as usize)
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An operator that reserves execution memory and can give some back.
///
/// `spill` is invoked by the task manager while it arbitrates a
/// shortfall, so implementations must not call back into acquisition on
/// the same manager from inside it; releasing memory and freeing pages
/// is fine.
pub trait MemoryConsumer: Send + Sync {
    /// Write out up to `size` bytes of state and release the memory
    /// backing it. `trigger` identifies the consumer whose demand
    /// prompted the request, when there is one. Returns the number of
    /// bytes actually released, which may be zero when there is nothing
    /// left to shrink.
    fn spill(&self, size: u64, trigger: Option<ConsumerId>) -> MemoryResult<u64>;

    /// Short human-readable name used in diagnostics.
    fn label(&self) -> String {
        "consumer".to_string()
    }
}

/// Shared handle to a consumer.
pub type SharedConsumer = Arc<dyn MemoryConsumer>;

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Noop;

    impl MemoryConsumer for Noop {
        fn spill(&self, _size: u64, _trigger: Option<ConsumerId>) -> MemoryResult<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_identity_is_stable_and_distinct() {
        let a: SharedConsumer = Arc::new(Noop);
        let b: SharedConsumer = Arc::new(Noop);

        assert_eq!(ConsumerId::of(a.as_ref()), ConsumerId::of(a.as_ref()));
        assert_ne!(ConsumerId::of(a.as_ref()), ConsumerId::of(b.as_ref()));
    }

    #[test]
    fn test_anonymous_identity() {
        assert!(ConsumerId::ANONYMOUS.is_anonymous());

        let a: SharedConsumer = Arc::new(Noop);
        assert!(!ConsumerId::of(a.as_ref()).is_anonymous());
    }

    #[test]
    fn test_display_is_hexadecimal() {
        let a: SharedConsumer = Arc::new(Noop);
        let shown = ConsumerId::of(a.as_ref()).to_string();
        assert!(shown.starts_with("0x"));

        assert_eq!(ConsumerId::ANONYMOUS.to_string(), "0x0");
    }

    #[test]
    fn test_default_label() {
        let a: SharedConsumer = Arc::new(Noop);
        assert_eq!(a.label(), "consumer");
    }
}
