//! Various utilities functions and types

mod geometry;
mod timestamp;
#[cfg(feature = "x11rb_event_source")]
pub mod x11rb;

pub use self::geometry::{Point, Rectangle, Size};
pub use self::timestamp::{Timestamp, CURRENT_TIME};
