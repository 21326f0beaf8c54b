use core::fmt;
use core::num::NonZeroU64;

use crate::error::{CoreError, CoreResult};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Create an id from a 0-based index by storing index+1.
            pub fn from_index(index: u64) -> CoreResult<Self> {
                index
                    .checked_add(1)
                    .and_then(NonZeroU64::new)
                    .map(Self)
                    .ok_or(CoreError::IdExhausted { what: $label })
            }

            /// Recover the 0-based index.
            pub fn index(self) -> u64 {
                self.0.get() - 1
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.index())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.index())
            }
        }
    };
}

define_id!(
    /// Node in the cached remote file tree. Never reused, so a stale id held
    /// after a removal simply fails to resolve.
    NodeId,
    "NodeId"
);
define_id!(
    /// One request issued to the remote data interface.
    RequestId,
    "RequestId"
);
define_id!(
    /// Subscriber to file tree notices.
    ListenerId,
    "ListenerId"
);

/// Cases are the only tree listeners, so they share the listener id space.
pub type CaseId = ListenerId;

/// Monotonic allocator; ids are handed out once and never recycled.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next_node(&mut self) -> CoreResult<NodeId> {
        NodeId::from_index(self.bump())
    }

    pub fn next_request(&mut self) -> CoreResult<RequestId> {
        RequestId::from_index(self.bump())
    }

    pub fn next_listener(&mut self) -> CoreResult<ListenerId> {
        ListenerId::from_index(self.bump())
    }

    fn bump(&mut self) -> u64 {
        let current = self.next;
        self.next = self.next.saturating_add(1);
        current
    }
}
