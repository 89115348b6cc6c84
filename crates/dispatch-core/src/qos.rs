//! Quality-of-service classes
//!
//! A QoS class is a scheduling hint. Workers prefer runnable items from
//! higher classes, while a periodic fairness scan keeps lower classes from
//! starving.

use std::fmt;

/// QoS class, ordered from lowest to highest
///
/// Raw values match the conventional class encoding so that they can be
/// compared and logged as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QosClass {
    /// No class requested; resolves to the class of the queue or `Default`
    #[default]
    Unspecified = 0x00,
    /// Work the user is not aware of (prefetch, backups)
    Background = 0x09,
    /// Long-running work with visible progress
    Utility = 0x11,
    /// Fallback class for work without a better hint
    Default = 0x15,
    /// Work the user started and is waiting for
    UserInitiated = 0x19,
    /// Work that keeps the interface responsive
    UserInteractive = 0x21,
}

impl QosClass {
    /// All schedulable classes, highest first
    pub const SCHEDULABLE: [QosClass; 5] = [
        QosClass::UserInteractive,
        QosClass::UserInitiated,
        QosClass::Default,
        QosClass::Utility,
        QosClass::Background,
    ];

    /// Number of priority buckets used by the scheduler
    pub const BUCKETS: usize = 5;

    /// Raw class value
    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Decode a raw class value
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(QosClass::Unspecified),
            0x09 => Some(QosClass::Background),
            0x11 => Some(QosClass::Utility),
            0x15 => Some(QosClass::Default),
            0x19 => Some(QosClass::UserInitiated),
            0x21 => Some(QosClass::UserInteractive),
            _ => None,
        }
    }

    /// Scheduler bucket index, 0 = highest priority
    ///
    /// `Unspecified` shares the `Default` bucket.
    #[inline]
    pub const fn bucket(self) -> usize {
        match self {
            QosClass::UserInteractive => 0,
            QosClass::UserInitiated => 1,
            QosClass::Default | QosClass::Unspecified => 2,
            QosClass::Utility => 3,
            QosClass::Background => 4,
        }
    }

    /// Class served by a bucket index
    pub const fn from_bucket(bucket: usize) -> Self {
        match bucket {
            0 => QosClass::UserInteractive,
            1 => QosClass::UserInitiated,
            2 => QosClass::Default,
            3 => QosClass::Utility,
            _ => QosClass::Background,
        }
    }

    #[inline]
    pub const fn is_specified(self) -> bool {
        !matches!(self, QosClass::Unspecified)
    }

    /// Short name for thread names and logs
    pub const fn name(self) -> &'static str {
        match self {
            QosClass::Unspecified => "unspecified",
            QosClass::Background => "background",
            QosClass::Utility => "utility",
            QosClass::Default => "default",
            QosClass::UserInitiated => "user-initiated",
            QosClass::UserInteractive => "user-interactive",
        }
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// QoS class plus a relative priority within the class
///
/// Relative priority lies in `[-15, 0]`; out-of-range values are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qos {
    class: QosClass,
    relative_priority: i8,
}

impl Qos {
    /// Lowest accepted relative priority
    pub const MIN_RELATIVE_PRIORITY: i32 = -15;

    pub const UNSPECIFIED: Qos = Qos::new(QosClass::Unspecified);
    pub const BACKGROUND: Qos = Qos::new(QosClass::Background);
    pub const UTILITY: Qos = Qos::new(QosClass::Utility);
    pub const DEFAULT: Qos = Qos::new(QosClass::Default);
    pub const USER_INITIATED: Qos = Qos::new(QosClass::UserInitiated);
    pub const USER_INTERACTIVE: Qos = Qos::new(QosClass::UserInteractive);

    pub const fn new(class: QosClass) -> Self {
        Self { class, relative_priority: 0 }
    }

    pub fn with_relative_priority(class: QosClass, relative_priority: i32) -> Self {
        let clamped = relative_priority.clamp(Self::MIN_RELATIVE_PRIORITY, 0);
        Self {
            class,
            relative_priority: clamped as i8,
        }
    }

    #[inline]
    pub const fn class(&self) -> QosClass {
        self.class
    }

    #[inline]
    pub const fn relative_priority(&self) -> i32 {
        self.relative_priority as i32
    }

    #[inline]
    pub const fn is_specified(&self) -> bool {
        self.class.is_specified()
    }

    /// `self` if specified, otherwise `fallback`
    #[inline]
    pub fn or(self, fallback: Qos) -> Qos {
        if self.is_specified() {
            self
        } else {
            fallback
        }
    }
}

impl From<QosClass> for Qos {
    fn from(class: QosClass) -> Self {
        Qos::new(class)
    }
}

impl PartialOrd for Qos {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Qos {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.class
            .cmp(&other.class)
            .then(self.relative_priority.cmp(&other.relative_priority))
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relative_priority == 0 {
            write!(f, "{}", self.class)
        } else {
            write!(f, "{}{}", self.class, self.relative_priority)
        }
    }
}
