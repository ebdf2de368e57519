use std::{cmp::Ordering, time::Duration};

/// An X11 server timestamp in milliseconds
///
/// The server clock wraps around after roughly 49.7 days. Two timestamps are ordered by
/// their wrapping distance, so a timestamp taken shortly after the wrap is still newer
/// than one taken shortly before it.
///
/// A value of `0` is `CurrentTime` on the wire and means "no timestamp".
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Timestamp(pub u32);

/// The `CurrentTime` placeholder of the X11 protocol
pub const CURRENT_TIME: Timestamp = Timestamp(0);

impl Timestamp {
    /// Whether this is the `CurrentTime` placeholder
    pub fn is_current_time(&self) -> bool {
        self.0 == 0
    }

    /// Signed distance from `other` to `self`, in milliseconds
    fn offset_from(self, other: Timestamp) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Time elapsed between an earlier timestamp and this one
    ///
    /// Returns [`Duration::ZERO`] if `earlier` is actually newer.
    pub fn elapsed_since(&self, earlier: Timestamp) -> Duration {
        let offset = self.offset_from(earlier);
        Duration::from_millis(u64::try_from(offset).unwrap_or(0))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.offset_from(*other).cmp(&0))
    }
}
