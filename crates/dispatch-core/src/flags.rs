//! Work item execution flags

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::qos::Qos;

/// Execution flags attached to a work item or a single submission
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkItemFlags(u32);

impl WorkItemFlags {
    pub const NONE: WorkItemFlags = WorkItemFlags(0);
    /// Run exclusively on a concurrent queue
    pub const BARRIER: WorkItemFlags = WorkItemFlags(1 << 0);
    /// Do not attach the submitting thread's execution context
    pub const DETACHED: WorkItemFlags = WorkItemFlags(1 << 1);
    /// Capture the creating thread's QoS at creation time
    pub const ASSIGN_CURRENT_CONTEXT: WorkItemFlags = WorkItemFlags(1 << 2);
    /// Carry no QoS of its own
    pub const NO_QOS: WorkItemFlags = WorkItemFlags(1 << 3);
    /// Prefer the queue's QoS over the item's
    pub const INHERIT_QOS: WorkItemFlags = WorkItemFlags(1 << 4);
    /// Prefer the item's QoS over the queue's
    pub const ENFORCE_QOS: WorkItemFlags = WorkItemFlags(1 << 5);

    const ALL: u32 = (1 << 6) - 1;

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped
    pub const fn from_bits_truncate(bits: u32) -> Self {
        WorkItemFlags(bits & Self::ALL)
    }

    #[inline]
    pub const fn contains(&self, other: WorkItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_barrier(&self) -> bool {
        self.contains(Self::BARRIER)
    }

    /// QoS precedence requested by these flags
    ///
    /// `ENFORCE_QOS` wins when both precedence flags are present.
    pub const fn qos_override(&self) -> QosOverride {
        if self.contains(Self::ENFORCE_QOS) {
            QosOverride::Enforce
        } else if self.contains(Self::INHERIT_QOS) || self.contains(Self::NO_QOS) {
            QosOverride::Inherit
        } else {
            QosOverride::None
        }
    }
}

impl BitOr for WorkItemFlags {
    type Output = WorkItemFlags;
    fn bitor(self, rhs: WorkItemFlags) -> WorkItemFlags {
        WorkItemFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for WorkItemFlags {
    fn bitor_assign(&mut self, rhs: WorkItemFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for WorkItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(WorkItemFlags, &str); 6] = [
            (WorkItemFlags::BARRIER, "BARRIER"),
            (WorkItemFlags::DETACHED, "DETACHED"),
            (WorkItemFlags::ASSIGN_CURRENT_CONTEXT, "ASSIGN_CURRENT_CONTEXT"),
            (WorkItemFlags::NO_QOS, "NO_QOS"),
            (WorkItemFlags::INHERIT_QOS, "INHERIT_QOS"),
            (WorkItemFlags::ENFORCE_QOS, "ENFORCE_QOS"),
        ];
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Which side wins when an item's QoS meets its queue's QoS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosOverride {
    /// The higher of the two
    #[default]
    None,
    /// The queue's QoS, falling back to the item's
    Inherit,
    /// The item's QoS, falling back to the queue's
    Enforce,
}

impl QosOverride {
    /// Effective QoS for an item submitted to a queue
    pub fn resolve(self, item: Qos, queue: Qos) -> Qos {
        match self {
            QosOverride::Enforce => item.or(queue),
            QosOverride::Inherit => queue.or(item),
            QosOverride::None => {
                if item > queue {
                    item
                } else {
                    queue.or(item)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_ops() {
        let f = WorkItemFlags::BARRIER | WorkItemFlags::DETACHED;
        assert!(f.is_barrier());
        assert!(f.contains(WorkItemFlags::DETACHED));
        assert!(!f.contains(WorkItemFlags::ENFORCE_QOS));
        assert_eq!(WorkItemFlags::from_bits_truncate(0xFFFF_FFFF).bits(), 0x3F);
        assert_eq!(format!("{:?}", f), "BARRIER | DETACHED");
        assert_eq!(format!("{:?}", WorkItemFlags::NONE), "NONE");
    }

    #[test]
    fn test_qos_override_selection() {
        assert_eq!(WorkItemFlags::NONE.qos_override(), QosOverride::None);
        assert_eq!(WorkItemFlags::INHERIT_QOS.qos_override(), QosOverride::Inherit);
        assert_eq!(
            (WorkItemFlags::INHERIT_QOS | WorkItemFlags::ENFORCE_QOS).qos_override(),
            QosOverride::Enforce
        );
    }

    #[test]
    fn test_qos_resolution() {
        let item = Qos::BACKGROUND;
        let queue = Qos::USER_INITIATED;
        assert_eq!(QosOverride::Enforce.resolve(item, queue), Qos::BACKGROUND);
        assert_eq!(QosOverride::Inherit.resolve(item, queue), Qos::USER_INITIATED);
        assert_eq!(QosOverride::None.resolve(item, queue), Qos::USER_INITIATED);
        assert_eq!(QosOverride::None.resolve(Qos::USER_INTERACTIVE, queue), Qos::USER_INTERACTIVE);
        assert_eq!(QosOverride::Enforce.resolve(Qos::UNSPECIFIED, queue), queue);
        assert_eq!(QosOverride::Inherit.resolve(item, Qos::UNSPECIFIED), item);
    }
}
