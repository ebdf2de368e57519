use std::fmt;

/// A point as used on the wire of the XDND protocol
///
/// Coordinates are always root-window relative. The X11 core protocol limits them to 16 bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
}

impl Point {
    /// Create a new point
    pub const fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }

    /// Euclidean distance to another point
    pub fn distance(self, other: Point) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }

    /// Pack the point into a single 32-bit field, `x` in the high 16 bits
    ///
    /// Values outside of the 16-bit range are truncated.
    pub fn pack(self) -> u32 {
        ((self.x as u16 as u32) << 16) | (self.y as u16 as u32)
    }

    /// Unpack a point previously packed with [`Point::pack`]
    pub fn unpack(value: u32) -> Self {
        Point {
            x: i32::from((value >> 16) as u16 as i16),
            y: i32::from(value as u16 as i16),
        }
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl From<(i32, i32)> for Point {
    fn from((x, y): (i32, i32)) -> Self {
        Point { x, y }
    }
}

/// A size as used on the wire of the XDND protocol
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    /// horizontal dimension
    pub w: i32,
    /// vertical dimension
    pub h: i32,
}

impl Size {
    /// Create a new size
    pub const fn new(w: i32, h: i32) -> Self {
        Size { w, h }
    }

    /// Pack the size into a single 32-bit field, `w` in the high 16 bits
    pub fn pack(self) -> u32 {
        ((self.w as u16 as u32) << 16) | (self.h as u16 as u32)
    }

    /// Unpack a size previously packed with [`Size::pack`]
    pub fn unpack(value: u32) -> Self {
        Size {
            w: i32::from((value >> 16) as u16),
            h: i32::from(value as u16),
        }
    }
}

impl fmt::Debug for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl From<(i32, i32)> for Size {
    fn from((w, h): (i32, i32)) -> Self {
        Size { w, h }
    }
}

/// A rectangle defined by its top-left corner and dimensions
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rectangle {
    /// Location of the top-left corner of the rectangle
    pub loc: Point,
    /// Size of the rectangle, as (width, height)
    pub size: Size,
}

impl Rectangle {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    pub fn from_loc_and_size(loc: impl Into<Point>, size: impl Into<Size>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Checks whether given point is inside the rectangle
    pub fn contains(self, point: impl Into<Point>) -> bool {
        let p: Point = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x + self.size.w)
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y + self.size.h)
    }

    /// Returns true if the rectangle covers no area
    pub fn is_empty(self) -> bool {
        self.size.w <= 0 || self.size.h <= 0
    }

    /// Pack into the two 32-bit fields used by `XdndStatus`
    pub fn pack(self) -> [u32; 2] {
        [self.loc.pack(), self.size.pack()]
    }

    /// Unpack from the two 32-bit fields used by `XdndStatus`
    pub fn unpack(loc: u32, size: u32) -> Self {
        Rectangle {
            loc: Point::unpack(loc),
            size: Size::unpack(size),
        }
    }
}

impl fmt::Debug for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_pack_round_trip() {
        let samples = [i16::MIN, -1234, -1, 0, 1, 4, 255, 256, 1920, 32000, i16::MAX];
        for x in samples {
            for y in samples {
                let point = Point::new(i32::from(x), i32::from(y));
                assert_eq!(Point::unpack(point.pack()), point);
            }
        }
    }

    #[test]
    fn point_pack_puts_x_in_high_bits() {
        assert_eq!(Point::new(1, 2).pack(), 0x0001_0002);
        assert_eq!(Point::new(-1, 0).pack(), 0xffff_0000);
    }

    #[test]
    fn rectangle_round_trip() {
        let rect = Rectangle::from_loc_and_size((10, -20), (640, 480));
        let [loc, size] = rect.pack();
        assert_eq!(Rectangle::unpack(loc, size), rect);
    }

    #[test]
    fn rectangle_contains() {
        let rect = Rectangle::from_loc_and_size((0, 0), (10, 10));
        assert!(rect.contains((0, 0)));
        assert!(rect.contains((9, 9)));
        assert!(!rect.contains((10, 9)));
        assert!(!rect.contains((-1, 5)));
        assert!(!Rectangle::default().contains((0, 0)));
    }

    #[test]
    fn distance() {
        assert_eq!(Point::new(0, 0).distance(Point::new(3, 4)), 5.0);
    }
}
