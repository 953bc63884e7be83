//! Process-unique, non-cryptographic identifiers.
//!
//! The source this crate generalizes identified requests, nodes, and
//! connections with symbol-based unique ids; an incrementing counter gives
//! the same intra-process value-equality guarantee without pulling in a
//! UUID dependency (see `spec.md` §9).

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

macro_rules! counted_id {
    ($name:ident, $counter:ident, $atomic:ty, $repr:ty) => {
        static $counter: $atomic = <$atomic>::new(0);

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($repr);

        impl $name {
            pub(crate) fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub fn value(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

counted_id!(NodeId, NODE_COUNTER, AtomicU32, u32);
counted_id!(ConnectionId, CONNECTION_COUNTER, AtomicU32, u32);
counted_id!(RequestId, REQUEST_COUNTER, AtomicU64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_monotonic() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert!(b.value() > a.value());
        assert_ne!(a, b);
    }
}
