use std::time::Instant;

#[cfg(test)]
use std::{sync::Arc, time::Duration};

pub trait TimeSource {
    fn now(&self) -> Instant;
}

/// A simple time source that returns the current time using `Instant::now()`.
#[derive(Clone, Copy, Default)]
pub struct InstantTimeSrc(());

impl InstantTimeSrc {
    pub fn new() -> Self {
        InstantTimeSrc(())
    }
}

impl TimeSource for InstantTimeSrc {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Mock time source whose clones all observe the same instant, so a test can keep
/// one handle and advance the clock seen by the component that owns the other.
#[cfg(test)]
#[derive(Clone)]
pub struct SharedMockTimeSource {
    current_instant: Arc<parking_lot::Mutex<Instant>>,
}

#[cfg(test)]
impl SharedMockTimeSource {
    pub fn new() -> Self {
        Self {
            current_instant: Arc::new(parking_lot::Mutex::new(Instant::now())),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        *self.current_instant.lock() += duration;
    }
}

#[cfg(test)]
impl TimeSource for SharedMockTimeSource {
    fn now(&self) -> Instant {
        *self.current_instant.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_mock_advances_every_clone() {
        let time = SharedMockTimeSource::new();
        let observer = time.clone();
        let start = observer.now();

        time.advance_time(Duration::from_secs(5));

        assert_eq!(observer.now().duration_since(start), Duration::from_secs(5));
    }
}
