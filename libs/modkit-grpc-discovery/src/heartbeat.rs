use parking_lot::Mutex;

/// Remembers the last heartbeat value seen, to skip repeated ones.
///
/// Values are compared by equality, so any change (not only an increase) is
/// reported.
#[derive(Debug)]
pub struct HeartbeatMonitor<T> {
    latest: Mutex<Option<T>>,
}

impl<T> Default for HeartbeatMonitor<T> {
    fn default() -> Self {
        Self {
            latest: Mutex::new(None),
        }
    }
}

impl<T: PartialEq> HeartbeatMonitor<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`; `true` if it differs from the previous one.
    pub fn update(&self, value: T) -> bool {
        let mut latest = self.latest.lock();
        if latest.as_ref() == Some(&value) {
            return false;
        }
        *latest = Some(value);
        true
    }
}
