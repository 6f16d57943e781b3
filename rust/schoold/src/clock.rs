use chrono::{DateTime, Utc};

/// Wall-clock capability. Term status is re-evaluated against it on every
/// call, never cached.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Either clock, picked at startup from config.
#[derive(Debug, Clone, Copy)]
pub enum DaemonClock {
    System(SystemClock),
    Fixed(FixedClock),
}

impl DaemonClock {
    pub fn from_fixed(fixed: Option<DateTime<Utc>>) -> Self {
        match fixed {
            Some(t) => Self::Fixed(FixedClock(t)),
            None => Self::System(SystemClock),
        }
    }
}

impl Clock for DaemonClock {
    fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System(c) => c.now(),
            Self::Fixed(c) => c.now(),
        }
    }
}
