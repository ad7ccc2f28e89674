//! Laser range-finder observation model (correction step).
//!
//! For every particle the model places the sensor at `particle.pose * mount.offset`, casts a ray
//! into the world for each sampled beam and compares the predicted range with the measured one.
//! Each beam contributes the mixture likelihood
//!
//! $$
//! p(z \mid \hat z) = z_{hit} \, \mathcal{N}(z - \hat z; 0, \sigma_{hit}^2) + \frac{z_{rand}}{r_{max}}
//! $$
//!
//! where the uniform term accounts for clutter, occlusions and max-range returns, and bounds the
//! per-beam likelihood away from zero. Beam log-likelihoods are summed and the particle weight is
//! multiplied by the exponential of the sum.
//!
//! Both the measured and the predicted range are clipped to the valid range interval before they
//! are compared, so readings of zero, `inf` or `NaN` never poison a weight.
//!
//! The match ratio of a pose places its log-likelihood between the all-random-returns floor (0)
//! and a perfect prediction on every beam (1).
use crate::error::FilterError;
use crate::geometry::Pose2D;
use crate::particle::{Particle, ParticleSet};
use crate::world::WorldQuery;

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Point2};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// One planar laser scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    /// Measured ranges, one per beam, ordered by increasing bearing.
    pub ranges: Vec<f64>,
    /// Bearing of the first beam in the sensor frame (rad).
    pub angle_min: f64,
    /// Angular step between consecutive beams (rad).
    pub angle_increment: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
}

impl LaserScan {
    pub fn bearing(&self, index: usize) -> f64 {
        self.angle_min + index as f64 * self.angle_increment
    }
}

/// Where the laser sits on the robot: a planar offset from the body frame and a mounting height.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorMount {
    pub offset: Pose2D,
    pub height: f64,
}

impl SensorMount {
    pub fn new(offset: Pose2D, height: f64) -> Self {
        SensorMount { offset, height }
    }

    /// Project a full 3-D body→sensor transform onto the floor plane.
    ///
    /// The planar offset keeps the upper-left 2×2 block of the rotation and the horizontal
    /// translation; the vertical translation becomes the mounting height.
    pub fn from_isometry3(transform: &Isometry3<f64>) -> Self {
        let rotation = transform.rotation.to_rotation_matrix();
        let r = rotation.matrix();
        let block = nalgebra::Matrix2::new(r[(0, 0)], r[(0, 1)], r[(1, 0)], r[(1, 1)]);
        let t = transform.translation.vector;
        SensorMount {
            offset: Pose2D::from_rotation_translation(&block, &nalgebra::Vector2::new(t.x, t.y)),
            height: t.z,
        }
    }
}

/// A scan together with the (already calibrated) mount of the sensor that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub scan: LaserScan,
    pub mount: SensorMount,
}

impl Observation {
    pub fn new(scan: LaserScan, mount: SensorMount) -> Self {
        Observation { scan, mount }
    }
}

/// Parameters of the beam likelihood.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserModelConfig {
    /// Upper bound on the number of beams evaluated per particle.
    pub num_beams: usize,
    /// Weight of the Gaussian "hit" component.
    pub z_hit: f64,
    /// Weight of the uniform "random return" component.
    pub z_rand: f64,
    /// Standard deviation of the hit component (m).
    pub sigma_hit: f64,
    /// Ranges below this are clipped up to it (the scan's own minimum is used if larger).
    pub range_min: f64,
    /// Ranges above this are clipped down to it (the scan's own maximum is used if smaller).
    pub range_max: f64,
    /// Keep the predicted ray endpoints of the last update for diagnostics.
    pub record_endpoints: bool,
    /// A scan is rejected as unexplained when the best particle's match ratio stays below this.
    pub min_match_ratio: f64,
}

impl Default for LaserModelConfig {
    fn default() -> Self {
        LaserModelConfig {
            num_beams: 100,
            z_hit: 0.95,
            z_rand: 0.05,
            sigma_hit: 0.2,
            range_min: 0.0,
            range_max: 30.0,
            record_endpoints: false,
            min_match_ratio: 0.1,
        }
    }
}

impl LaserModelConfig {
    pub fn is_valid(&self) -> bool {
        self.num_beams > 0
            && self.z_hit.is_finite()
            && self.z_hit >= 0.0
            && self.z_rand.is_finite()
            && self.z_rand > 0.0
            && self.sigma_hit.is_finite()
            && self.sigma_hit > 0.0
            && self.range_min.is_finite()
            && self.range_min >= 0.0
            && self.range_max.is_finite()
            && self.range_max > self.range_min
            && (0.0..1.0).contains(&self.min_match_ratio)
    }
}

/// Summary of one sensor update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorUpdate {
    /// Beams evaluated per particle.
    pub beams: usize,
    /// Largest per-particle log-likelihood of the scan.
    pub best_log_likelihood: f64,
    /// Match ratio of the best particle.
    pub best_match_ratio: f64,
}

/// A beam selected for evaluation: bearing in the sensor frame and the clipped measured range.
#[derive(Clone, Copy, Debug)]
struct Beam {
    bearing: f64,
    range: f64,
}

#[derive(Clone, Debug, Default)]
pub struct LaserModel {
    config: LaserModelConfig,
    ray_endpoints: Vec<Point2<f64>>,
}

impl LaserModel {
    pub fn new(config: LaserModelConfig) -> Self {
        LaserModel {
            config,
            ray_endpoints: Vec::new(),
        }
    }

    pub fn config(&self) -> &LaserModelConfig {
        &self.config
    }

    /// Predicted ray endpoints (map frame) from the last update, if recording is enabled.
    pub fn ray_endpoints(&self) -> &[Point2<f64>] {
        &self.ray_endpoints
    }

    /// Effective `(min, max)` range limits for a scan: the configured interval narrowed by the
    /// scan's own limits. `min >= max` when the two intervals do not overlap.
    pub fn range_limits(&self, scan: &LaserScan) -> (f64, f64) {
        let mut min = self.config.range_min;
        if scan.range_min.is_finite() && scan.range_min > min {
            min = scan.range_min;
        }
        let mut max = self.config.range_max;
        if scan.range_max.is_finite() && scan.range_max > min && scan.range_max < max {
            max = scan.range_max;
        }
        (min, max)
    }

    /// Likelihood of measuring `observed` when `expected` is predicted.
    ///
    /// Inputs are clipped to `[range_min, range_max]`; a non-finite reading counts as max range.
    pub fn beam_likelihood(&self, expected: f64, observed: f64, limits: (f64, f64)) -> f64 {
        let expected = clip_range(expected, limits);
        let observed = clip_range(observed, limits);
        let sigma = self.config.sigma_hit;
        let err = (observed - expected) / sigma;
        self.config.z_hit * (-0.5 * err * err).exp() / (sigma * (2.0 * PI).sqrt())
            + self.uniform_floor(limits)
    }

    /// Per-beam likelihood of a perfect prediction.
    pub fn max_beam_likelihood(&self, limits: (f64, f64)) -> f64 {
        self.config.z_hit / (self.config.sigma_hit * (2.0 * PI).sqrt()) + self.uniform_floor(limits)
    }

    /// Per-beam likelihood no beam can fall below.
    pub fn uniform_floor(&self, limits: (f64, f64)) -> f64 {
        self.config.z_rand / limits.1
    }

    /// Where `log_likelihood` over `beams` beams falls between the uniform floor (0) and a
    /// perfect prediction (1). Always 1 when nothing can be told apart.
    pub fn match_ratio(&self, log_likelihood: f64, beams: usize, limits: (f64, f64)) -> f64 {
        let floor = self.uniform_floor(limits).ln();
        let span = beams as f64 * (self.max_beam_likelihood(limits).ln() - floor);
        if !(span > 0.0) {
            return 1.0;
        }
        ((log_likelihood - beams as f64 * floor) / span).clamp(0.0, 1.0)
    }

    /// Indices of the beams evaluated for a scan of `len` readings.
    pub fn sampled_indices(&self, len: usize) -> Vec<usize> {
        let wanted = self.config.num_beams.min(len);
        if wanted == 0 {
            return Vec::new();
        }
        let step = len as f64 / wanted as f64;
        (0..wanted).map(|k| ((k as f64 * step) as usize).min(len - 1)).collect()
    }

    fn beams(&self, scan: &LaserScan, limits: (f64, f64)) -> Vec<Beam> {
        self.sampled_indices(scan.ranges.len())
            .into_iter()
            .map(|i| Beam {
                bearing: scan.bearing(i),
                range: clip_range(scan.ranges[i], limits),
            })
            .collect()
    }

    fn check_scan(&self, scan: &LaserScan) -> Result<(f64, f64), FilterError> {
        if !self.config.is_valid() {
            return Err(FilterError::InvalidConfig(format!(
                "laser model parameters out of range: {:?}",
                self.config
            )));
        }
        if !(scan.angle_min.is_finite() && scan.angle_increment.is_finite()) {
            return Err(FilterError::InvalidObservation(
                "scan bearings are not finite".to_string(),
            ));
        }
        let (min, max) = self.range_limits(scan);
        if min >= max {
            return Err(FilterError::InvalidObservation(format!(
                "scan range interval [{}, {}] does not overlap [{}, {}]",
                scan.range_min, scan.range_max, self.config.range_min, self.config.range_max
            )));
        }
        Ok((min, max))
    }

    fn score<W: WorldQuery + ?Sized>(
        &self,
        world: &W,
        beams: &[Beam],
        mount: &SensorMount,
        pose: &Pose2D,
        limits: (f64, f64),
        endpoints: Option<&mut Vec<Point2<f64>>>,
    ) -> f64 {
        let laser_pose = pose.compose(&mount.offset);
        let mut log_likelihood = 0.0;
        let mut endpoints = endpoints;
        for beam in beams {
            let hit = world.ray_cast_at_height(&laser_pose, beam.bearing, mount.height);
            let expected = if hit.valid && hit.range.is_finite() {
                clip_range(hit.range, limits)
            } else {
                limits.1
            };
            log_likelihood += self.beam_likelihood(expected, beam.range, limits).ln();
            if let Some(points) = endpoints.as_deref_mut() {
                let (s, c) = beam.bearing.sin_cos();
                points.push(laser_pose.transform_point(&Point2::new(expected * c, expected * s)));
            }
        }
        log_likelihood
    }

    /// Log-likelihood of an observation for a single robot pose.
    pub fn log_likelihood<W: WorldQuery + ?Sized>(
        &self,
        world: &W,
        observation: &Observation,
        pose: &Pose2D,
    ) -> Result<f64, FilterError> {
        let limits = self.check_scan(&observation.scan)?;
        let beams = self.beams(&observation.scan, limits);
        Ok(self.score(world, &beams, &observation.mount, pose, limits, None))
    }

    /// Multiply every particle's weight by the likelihood of `observation`. Poses are untouched.
    pub fn update_weights<W: WorldQuery + ?Sized>(
        &mut self,
        world: &W,
        observation: &Observation,
        particles: &mut ParticleSet,
    ) -> Result<SensorUpdate, FilterError> {
        let limits = self.check_scan(&observation.scan)?;
        let beams = self.beams(&observation.scan, limits);
        let record = self.config.record_endpoints;
        let mount = observation.mount;

        let evaluate = |particle: &mut Particle| -> (f64, Vec<Point2<f64>>) {
            let mut points = Vec::new();
            let endpoints = if record { Some(&mut points) } else { None };
            let log_likelihood = self.score(world, &beams, &mount, &particle.pose, limits, endpoints);
            particle.weight *= log_likelihood.exp();
            (log_likelihood, points)
        };
        #[cfg(feature = "parallel")]
        let scored: Vec<(f64, Vec<Point2<f64>>)> =
            particles.as_mut_slice().par_iter_mut().map(evaluate).collect();
        #[cfg(not(feature = "parallel"))]
        let scored: Vec<(f64, Vec<Point2<f64>>)> =
            particles.as_mut_slice().iter_mut().map(evaluate).collect();

        let best_log_likelihood = scored
            .iter()
            .map(|(ll, _)| *ll)
            .fold(f64::NEG_INFINITY, f64::max);
        self.ray_endpoints.clear();
        if record {
            self.ray_endpoints
                .extend(scored.into_iter().flat_map(|(_, points)| points));
        }
        Ok(SensorUpdate {
            beams: beams.len(),
            best_log_likelihood,
            best_match_ratio: self.match_ratio(best_log_likelihood, beams.len(), limits),
        })
    }
}

fn clip_range(range: f64, (min, max): (f64, f64)) -> f64 {
    if range.is_nan() {
        return max;
    }
    range.max(min).min(max)
}
