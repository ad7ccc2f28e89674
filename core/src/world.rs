//! The geometric world the robot localizes against.
//!
//! The filter only ever asks the world one question: how far does a ray travel from a given
//! origin before it hits something? [`WorldQuery`] is that question. [`SegmentMap`] is a small
//! reference implementation that models walls as 2-D line segments; richer map representations
//! (occupancy grids, 3-D meshes sliced at the sensor height) plug in through the same trait.

use crate::config;
use crate::geometry::Pose2D;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Result of a single ray cast.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    /// Distance from the ray origin to the first obstacle.
    pub range: f64,
    /// False if the ray left the map without hitting anything; `range` is then meaningless.
    pub valid: bool,
}

impl RayHit {
    pub fn hit(range: f64) -> Self {
        RayHit { range, valid: true }
    }
    pub fn miss() -> Self {
        RayHit {
            range: f64::INFINITY,
            valid: false,
        }
    }
}

/// Ray-casting oracle over a fixed map.
///
/// Implementations must be callable from several threads at once; the laser model evaluates
/// particles in parallel.
pub trait WorldQuery: Sync {
    /// Cast a ray from `origin` (map frame) in direction `origin.theta + bearing`.
    fn ray_cast(&self, origin: &Pose2D, bearing: f64) -> RayHit;

    /// Cast a ray from a sensor mounted `height` above the floor.
    ///
    /// Planar worlds ignore the height.
    fn ray_cast_at_height(&self, origin: &Pose2D, bearing: f64, height: f64) -> RayHit {
        let _ = height;
        self.ray_cast(origin, bearing)
    }
}

/// A wall between two points in the map frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}

impl Segment {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Segment {
            start: Point2::new(x1, y1),
            end: Point2::new(x2, y2),
        }
    }

    /// Distance along the ray `origin + t * (cos a, sin a)` to this segment, if it is hit.
    fn intersect(&self, origin: &Point2<f64>, angle: f64) -> Option<f64> {
        let (dy, dx) = angle.sin_cos();
        let ex = self.end.x - self.start.x;
        let ey = self.end.y - self.start.y;
        let denom = dx * ey - dy * ex;
        if denom.abs() < 1e-12 {
            return None;
        }
        let wx = self.start.x - origin.x;
        let wy = self.start.y - origin.y;
        let t = (wx * ey - wy * ex) / denom;
        let s = (wx * dy - wy * dx) / denom;
        if t >= 0.0 && (0.0..=1.0).contains(&s) {
            Some(t)
        } else {
            None
        }
    }
}

/// A map made of line-segment walls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMap {
    pub segments: Vec<Segment>,
}

impl SegmentMap {
    pub fn new(segments: Vec<Segment>) -> Self {
        SegmentMap { segments }
    }

    /// Axis-aligned closed rectangular room.
    pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        SegmentMap::new(vec![
            Segment::new(min_x, min_y, max_x, min_y),
            Segment::new(max_x, min_y, max_x, max_y),
            Segment::new(max_x, max_y, min_x, max_y),
            Segment::new(min_x, max_y, min_x, min_y),
        ])
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        config::write_json(self, path.as_ref())
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        config::read_json(path.as_ref())
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        config::write_yaml(self, path.as_ref())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        config::read_yaml(path.as_ref())
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        config::write_toml(self, path.as_ref())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        config::read_toml(path.as_ref())
    }
    /// Write choosing the format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        config::write_file(self, path.as_ref())
    }
    /// Read choosing the format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        config::read_file(path.as_ref())
    }
}

impl WorldQuery for SegmentMap {
    fn ray_cast(&self, origin: &Pose2D, bearing: f64) -> RayHit {
        let start = Point2::new(origin.x, origin.y);
        let angle = origin.theta + bearing;
        self.segments
            .iter()
            .filter_map(|segment| segment.intersect(&start, angle))
            .min_by(|a, b| a.total_cmp(b))
            .map_or_else(RayHit::miss, RayHit::hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};
    use tempfile::NamedTempFile;

    #[test]
    fn ray_hits_facing_wall() {
        let world = SegmentMap::new(vec![Segment::new(2.0, -5.0, 2.0, 5.0)]);
        let hit = world.ray_cast(&Pose2D::identity(), 0.0);
        assert!(hit.valid);
        assert_approx_eq!(hit.range, 2.0, 1e-12);

        let diagonal = world.ray_cast(&Pose2D::identity(), FRAC_PI_4);
        assert_approx_eq!(diagonal.range, 2.0 * 2.0_f64.sqrt(), 1e-9);
    }
    #[test]
    fn ray_away_from_wall_misses() {
        let world = SegmentMap::new(vec![Segment::new(2.0, -5.0, 2.0, 5.0)]);
        assert!(!world.ray_cast(&Pose2D::identity(), PI).valid);
        assert!(!world.ray_cast(&Pose2D::identity(), FRAC_PI_2).valid);
    }
    #[test]
    fn nearest_wall_wins_in_a_room() {
        let room = SegmentMap::rectangle(-1.0, -2.0, 3.0, 2.0);
        let origin = Pose2D::new(0.0, 0.0, FRAC_PI_2);
        assert_approx_eq!(room.ray_cast(&origin, 0.0).range, 2.0, 1e-9);
        assert_approx_eq!(room.ray_cast(&origin, -FRAC_PI_2).range, 3.0, 1e-9);
        assert_approx_eq!(room.ray_cast(&origin, FRAC_PI_2).range, 1.0, 1e-9);
        assert_approx_eq!(room.ray_cast_at_height(&origin, PI, 0.3).range, 2.0, 1e-9);
    }
    #[test]
    fn map_file_roundtrip() {
        let room = SegmentMap::rectangle(0.0, 0.0, 4.0, 3.0);
        for ext in ["json", "yaml", "toml"] {
            let f = NamedTempFile::new().unwrap();
            let path = f.path().with_extension(ext);
            room.to_file(&path).unwrap();
            let loaded = SegmentMap::from_file(&path).unwrap();
            assert_eq!(room, loaded);
        }
        let f = NamedTempFile::new().unwrap();
        let err = room.to_file(f.path().with_extension("txt")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(
            SegmentMap::from_file(f.path().with_extension("txt"))
                .unwrap_err()
                .kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
