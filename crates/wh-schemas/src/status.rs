//! Status and provenance bitmasks carried on inbox/outbox rows and work items.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Processing stages a message has completed. Combinable: a row that was
    /// stored, had its event appended, and was published carries all three
    /// low bits. `FAILED` is sticky and removes the row from claim
    /// eligibility until an operator or retry path transitions it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageStatus: i32 {
        const STORED       = 1;
        const EVENT_STORED = 2;
        const PUBLISHED    = 4;
        const FAILED       = 0x8000;
    }
}

bitflags! {
    /// Provenance of a claimed work item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WorkItemFlags: i32 {
        /// Stored by the same coordinator call that claimed it.
        const NEWLY_STORED = 1;
        /// Reclaimed after a previous holder's lease expired.
        const ORPHANED     = 2;
    }
}

bitflags! {
    /// Per-call behavior switches on a work-batch request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BatchFlags: i32 {
        /// Retain terminal rows (with status preserved) instead of deleting.
        const DEBUG_MODE = 1;
        /// Store/acknowledge only; do not claim new work this call.
        const SKIP_CLAIM = 2;
    }
}

impl MessageStatus {
    /// Terminal success for an outbox row.
    pub fn outbox_terminal(self) -> bool {
        self.contains(MessageStatus::PUBLISHED) && !self.contains(MessageStatus::FAILED)
    }

    /// Terminal success for an inbox row: events require the append to have
    /// landed, plain messages only the store.
    pub fn inbox_terminal(self, is_event: bool) -> bool {
        if self.contains(MessageStatus::FAILED) {
            return false;
        }
        if is_event {
            self.contains(MessageStatus::STORED | MessageStatus::EVENT_STORED)
        } else {
            self.contains(MessageStatus::STORED)
        }
    }
}

// The masks travel inside envelopes and over the wire as their raw bits.
// Unknown future bits are retained rather than rejected.

macro_rules! impl_bits_serde {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                self.bits().serialize(s)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                Ok($ty::from_bits_retain(i32::deserialize(d)?))
            }
        }
    };
}

impl_bits_serde!(MessageStatus);
impl_bits_serde!(WorkItemFlags);
impl_bits_serde!(BatchFlags);
