//! Core identifier types and the tick source shared by every shapedb crate.
//!
//! Ticks are the spine of the system: every durable marker gets one, they are
//! strictly increasing in write order, and they are the sole ordering and
//! resumption key for compaction, recovery and replication.

pub mod value;

pub use value::DocValue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A strictly increasing sequence number assigned to every durable marker.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Tick(pub u64);

impl Tick {
    /// The zero tick, ordered before every real tick.
    pub const ZERO: Self = Self(0);
    /// The maximum tick, used as an open upper bound for range scans.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next tick after this one. Saturates at the maximum.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Ticks are rendered as decimal strings on the wire so that 64-bit
        // values survive JSON consumers with 53-bit integers.
        write!(f, "{}", self.0)
    }
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            serde::Serialize,
            serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[inline]
            pub const fn get(self) -> u64 {
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

id_type!(
    /// A collection identifier, unique within one store.
    CollectionId
);
id_type!(
    /// A shape identifier (sid), process-lifetime unique, never reused.
    ShapeId
);
id_type!(
    /// An attribute name identifier (aid), process-lifetime unique.
    AttributeId
);
id_type!(
    /// A compiled attribute path identifier (pid).
    PathId
);
id_type!(
    /// A transaction identifier.
    TransactionId
);
id_type!(
    /// A datafile identifier (fid).
    DatafileId
);
id_type!(
    /// The identifier of a server participating in replication.
    ServerId
);

/// Process-wide monotonic tick dispenser.
///
/// One instance lives in the document store; every marker write draws its
/// tick here, which makes ticks strictly increasing across all collections
/// of one store.
#[derive(Debug)]
pub struct TickSource {
    current: AtomicU64,
}

impl TickSource {
    /// Start a fresh source. The first tick handed out is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// Draw the next tick.
    #[inline]
    pub fn next_tick(&self) -> Tick {
        Tick(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently handed-out tick (zero if none yet).
    #[inline]
    pub fn last_tick(&self) -> Tick {
        Tick(self.current.load(Ordering::SeqCst))
    }

    /// Fast-forward past `tick`, used when replaying datafiles at reopen so
    /// newly assigned ticks never collide with persisted ones.
    pub fn observe(&self, tick: Tick) {
        self.current.fetch_max(tick.0, Ordering::SeqCst);
    }
}

impl Default for TickSource {
    fn default() -> Self {
        Self::new()
    }
}
