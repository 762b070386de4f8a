use serde::{Deserialize, Serialize};

/// Integer pixel dimensions of an image or sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A 2D point in pixel or normalized space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Scale a normalized coordinate (0..1) into pixel space.
    pub fn denormalize(&self, size: Dimensions) -> Point2 {
        Point2::new(self.x * size.width as f32, self.y * size.height as f32)
    }
}

impl std::ops::Sub for Point2 {
    type Output = Point2;
    fn sub(self, rhs: Point2) -> Point2 {
        Point2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Add for Point2 {
    type Output = Point2;
    fn add(self, rhs: Point2) -> Point2 {
        Point2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Mul<f32> for Point2 {
    type Output = Point2;
    fn mul(self, rhs: f32) -> Point2 {
        Point2::new(self.x * rhs, self.y * rhs)
    }
}

/// A 3D point in camera space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f32; 3]> for Point3 {
    fn from(v: [f32; 3]) -> Self {
        Point3::new(v[0], v[1], v[2])
    }
}

/// Axis-aligned rectangle (origin at the top-left corner).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Scale a normalized rectangle into pixel space.
    pub fn denormalize(&self, size: Dimensions) -> Rect {
        let (w, h) = (size.width as f32, size.height as f32);
        Rect::new(self.x * w, self.y * h, self.width * w, self.height * h)
    }
}

/// 3x3 matrix stored column-major: `columns[c][r]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix3 {
    pub columns: [[f32; 3]; 3],
}

impl Matrix3 {
    pub fn identity() -> Self {
        Self {
            columns: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// Pinhole intrinsics: focal lengths in column 0/1, principal point in column 2.
    pub fn intrinsics(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        Self {
            columns: [[fx, 0.0, 0.0], [0.0, fy, 0.0], [cx, cy, 1.0]],
        }
    }
}

impl Default for Matrix3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// 4x3 rigid transform (rotation columns plus translation), column-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Matrix4x3 {
    pub columns: [[f32; 3]; 4],
}

impl Matrix4x3 {
    pub fn identity() -> Self {
        Self {
            columns: [
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [0.0, 0.0, 0.0],
            ],
        }
    }
}

impl Default for Matrix4x3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denormalize_rect() {
        let r = Rect::new(0.25, 0.5, 0.5, 0.25).denormalize(Dimensions::new(640, 480));
        assert_eq!(r, Rect::new(160.0, 240.0, 320.0, 120.0));
    }

    #[test]
    fn test_intrinsics_layout() {
        let m = Matrix3::intrinsics(500.0, 510.0, 320.0, 240.0);
        assert_eq!(m.columns[0][0], 500.0);
        assert_eq!(m.columns[1][1], 510.0);
        assert_eq!(m.columns[2][0], 320.0);
        assert_eq!(m.columns[2][1], 240.0);
    }

    #[test]
    fn test_point_arithmetic() {
        let p = (Point2::new(3.0, 4.0) - Point2::zero()) * 2.0;
        assert!((p.length() - 10.0).abs() < 1e-6);
    }
}
