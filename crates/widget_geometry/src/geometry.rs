use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Identifies a widget on a dashboard canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(pub u64);

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordinate axis. `X` runs left to right, `Y` top to bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn cross(self) -> Self {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::X,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

pub fn point(x: f32, y: f32) -> Point {
    Point { x, y }
}

impl Point {
    pub fn along(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    pub fn set_along(&mut self, axis: Axis, value: f32) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
        }
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        point(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        point(self.x - rhs.x, self.y - rhs.y)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

pub fn size(width: f32, height: f32) -> Size {
    Size { width, height }
}

impl Size {
    pub fn along(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.width,
            Axis::Y => self.height,
        }
    }

    pub fn set_along(&mut self, axis: Axis, value: f32) {
        match axis {
            Axis::X => self.width = value,
            Axis::Y => self.height = value,
        }
    }

    /// Component-wise maximum, used to enforce minimum widget sizes.
    pub fn max(&self, other: &Size) -> Size {
        size(self.width.max(other.width), self.height.max(other.height))
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// An axis-aligned rectangle in container-local coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub origin: Point,
    pub size: Size,
}

pub fn bounds(origin: Point, size: Size) -> Bounds {
    Bounds { origin, size }
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        bounds(point(x, y), size(width, height))
    }

    pub fn left(&self) -> f32 {
        self.origin.x
    }

    pub fn right(&self) -> f32 {
        self.origin.x + self.size.width
    }

    pub fn top(&self) -> f32 {
        self.origin.y
    }

    pub fn bottom(&self) -> f32 {
        self.origin.y + self.size.height
    }

    pub fn center_x(&self) -> f32 {
        self.origin.x + self.size.width / 2.0
    }

    pub fn center_y(&self) -> f32 {
        self.origin.y + self.size.height / 2.0
    }

    pub fn start(&self, axis: Axis) -> f32 {
        self.origin.along(axis)
    }

    pub fn end(&self, axis: Axis) -> f32 {
        self.origin.along(axis) + self.size.along(axis)
    }

    pub fn center(&self, axis: Axis) -> f32 {
        self.origin.along(axis) + self.size.along(axis) / 2.0
    }

    pub fn extent(&self, axis: Axis) -> f32 {
        self.size.along(axis)
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }
}

/// A widget's rectangle tagged with its id, as handed to the guide calculator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WidgetBounds {
    pub id: WidgetId,
    pub bounds: Bounds,
}
