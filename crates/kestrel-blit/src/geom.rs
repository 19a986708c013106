//! Rectangle and point types shared by the engine, the channel, and the
//! software fallback. Coordinates are unsigned and surface-relative.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// True if the rectangle lies entirely inside a `width` x `height`
    /// surface. Overflow-safe for arbitrary coordinates.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = match self.x.checked_add(self.width) {
            Some(v) => v,
            None => return false,
        };
        let bottom = match self.y.checked_add(self.height) {
            Some(v) => v,
            None => return false,
        };
        right <= width && bottom <= height
    }
}
