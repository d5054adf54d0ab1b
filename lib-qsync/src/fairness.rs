use std::fmt;

/// Ordering policy of a derived lock.
///
/// A fair lock grants acquisition in queue order. A non-fair lock lets a newly
/// arriving thread take the lock ahead of a parked waiter that has been
/// signalled but not yet rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fairness {
    Fair,
    #[default]
    NonFair,
}

impl Fairness {
    pub fn is_fair(self) -> bool {
        matches!(self, Fairness::Fair)
    }
}

impl From<bool> for Fairness {
    fn from(fair: bool) -> Self {
        if fair {
            Fairness::Fair
        } else {
            Fairness::NonFair
        }
    }
}

impl fmt::Display for Fairness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fairness::Fair => write!(f, "fair"),
            Fairness::NonFair => write!(f, "nonfair"),
        }
    }
}
