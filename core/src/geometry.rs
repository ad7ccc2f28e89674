//! Planar rigid-body geometry used throughout the filter.
//!
//! A [`Pose2D`] is an element of SE(2): a translation `(x, y)` and a heading `theta` in radians.
//! Poses compose left to right, so `a.compose(&b)` (or `a * b`) expresses `b` in the frame of
//! `a`. This is the same convention as `map_T_base * base_T_laser = map_T_laser`.
//!
//! The heading is always kept wrapped to $(-\pi, \pi]$.

use nalgebra::{Isometry2, Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::fmt::{self, Display};
use std::ops::Mul;

/// Wrap an angle in radians to the range $(-\pi, \pi]$.
///
/// Angles already in range and non-finite input are returned unchanged.
///
/// # Example
/// ```rust
/// use mcl::geometry::wrap_to_pi;
/// use std::f64::consts::PI;
/// assert!((wrap_to_pi(2.5 * PI) - PI / 2.0).abs() < 1e-12);
/// assert!((wrap_to_pi(-PI / 2.0) + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() || (angle > -PI && angle <= PI) {
        return angle;
    }
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Smallest signed difference `a - b` between two headings.
pub fn angle_difference(a: f64, b: f64) -> f64 {
    wrap_to_pi(a - b)
}

/// A 2-D pose: position plus heading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.3} rad)",
            self.x, self.y, self.theta
        )
    }
}

impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D {
            x,
            y,
            theta: wrap_to_pi(theta),
        }
    }

    pub fn identity() -> Self {
        Pose2D::default()
    }

    /// Build a pose from a 2×2 rotation matrix and a translation vector.
    ///
    /// Only the first column of the rotation is used to recover the heading, so a slightly
    /// non-orthogonal matrix (e.g. the upper-left block of a 3-D rotation with small roll/pitch)
    /// is accepted.
    pub fn from_rotation_translation(rotation: &Matrix2<f64>, translation: &Vector2<f64>) -> Self {
        Pose2D::new(
            translation.x,
            translation.y,
            rotation[(1, 0)].atan2(rotation[(0, 0)]),
        )
    }

    pub fn translation(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        let (s, c) = self.theta.sin_cos();
        Matrix2::new(c, -s, s, c)
    }

    /// Rigid composition `self * other`.
    pub fn compose(&self, other: &Pose2D) -> Pose2D {
        let (s, c) = self.theta.sin_cos();
        Pose2D::new(
            self.x + c * other.x - s * other.y,
            self.y + s * other.x + c * other.y,
            self.theta + other.theta,
        )
    }

    pub fn inverse(&self) -> Pose2D {
        let (s, c) = self.theta.sin_cos();
        Pose2D::new(
            -c * self.x - s * self.y,
            s * self.x - c * self.y,
            -self.theta,
        )
    }

    /// Map a point expressed in this pose's frame into the parent frame.
    pub fn transform_point(&self, point: &Point2<f64>) -> Point2<f64> {
        let (s, c) = self.theta.sin_cos();
        Point2::new(
            self.x + c * point.x - s * point.y,
            self.y + s * point.x + c * point.y,
        )
    }

    /// Length of the translation component.
    pub fn translation_norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Euclidean distance between the positions of two poses.
    pub fn distance(&self, other: &Pose2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn to_isometry(&self) -> Isometry2<f64> {
        Isometry2::new(self.translation(), self.theta)
    }
}

impl From<Isometry2<f64>> for Pose2D {
    fn from(iso: Isometry2<f64>) -> Self {
        Pose2D::new(
            iso.translation.vector.x,
            iso.translation.vector.y,
            iso.rotation.angle(),
        )
    }
}

impl From<Pose2D> for Isometry2<f64> {
    fn from(pose: Pose2D) -> Self {
        pose.to_isometry()
    }
}

impl Mul for Pose2D {
    type Output = Pose2D;

    fn mul(self, rhs: Pose2D) -> Pose2D {
        self.compose(&rhs)
    }
}

impl Mul<&Pose2D> for &Pose2D {
    type Output = Pose2D;

    fn mul(self, rhs: &Pose2D) -> Pose2D {
        self.compose(rhs)
    }
}
