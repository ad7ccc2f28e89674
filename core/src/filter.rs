//! Monte Carlo localization filter.
//!
//! [`ParticleFilter`] owns the particle set and runs the fixed predict → correct → resample
//! cycle. It never performs I/O and never blocks: the motion delta, the observation and the world
//! are handed in by the caller for every cycle.
//!
//! ```text
//! Uninitialized --init_uniform/set_pose--> Seeded --update--> Tracking --update--> Tracking
//!        ^                                    ^                   |
//!        +------------- (no way back) --------+---- set_pose -----+
//! ```
//!
//! The motion and sensor stages run on a working copy of the set which is committed only after
//! resampling succeeds. A cycle that ends with degenerate weights therefore leaves the previous
//! belief and the last estimate exactly as they were.
use crate::error::FilterError;
use crate::geometry::Pose2D;
use crate::motion::{MotionModelConfig, OdometryModel};
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy, ParticleSet};
use crate::sensor::{LaserModel, LaserModelConfig, Observation};
use crate::world::WorldQuery;

use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Largest grid [`ParticleFilter::init_uniform`] will build.
pub const MAX_SEED_PARTICLES: usize = 5_000_000;

/// When to draw a new generation after the sensor update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Resample on every cycle.
    #[default]
    Always,
    /// Resample only when the effective sample size drops below `ratio * len`, or when the set
    /// does not hold the configured number of particles.
    EffectiveSampleSize { ratio: f64 },
}

impl ResamplePolicy {
    pub fn should_resample(&self, effective_sample_size: f64, len: usize, target: usize) -> bool {
        match *self {
            ResamplePolicy::Always => true,
            ResamplePolicy::EffectiveSampleSize { ratio } => {
                len != target || effective_sample_size < ratio * len as f64
            }
        }
    }
}

/// Spread of the grid laid around a pose on [`ParticleFilter::set_pose`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSpread {
    /// Half-width of the position square (m).
    pub xy: f64,
    /// Half-width of the heading interval (rad).
    pub theta: f64,
    pub xy_resolution: f64,
    pub theta_resolution: f64,
}

impl Default for ResetSpread {
    fn default() -> Self {
        ResetSpread {
            xy: 0.3,
            theta: 0.1,
            xy_resolution: 0.05,
            theta_resolution: 0.05,
        }
    }
}

/// Filter configuration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Size of every resampled generation.
    pub num_particles: usize,
    pub odom_model: MotionModelConfig,
    pub laser_model: LaserModelConfig,
    pub resampling: ParticleResamplingStrategy,
    pub resample_policy: ResamplePolicy,
    pub averaging: ParticleAveragingStrategy,
    pub reset_spread: ResetSpread,
    /// Fixed RNG seed. Drawn from the OS when absent.
    pub seed: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: 500,
            odom_model: MotionModelConfig::default(),
            laser_model: LaserModelConfig::default(),
            resampling: ParticleResamplingStrategy::Systematic,
            resample_policy: ResamplePolicy::Always,
            averaging: ParticleAveragingStrategy::WeightedAverage,
            reset_spread: ResetSpread::default(),
            seed: None,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "num_particles must be positive".to_string(),
            ));
        }
        if !self.odom_model.is_valid() {
            return Err(FilterError::InvalidConfig(format!(
                "odometry noise parameters must be finite and non-negative: {:?}",
                self.odom_model
            )));
        }
        if !self.laser_model.is_valid() {
            return Err(FilterError::InvalidConfig(format!(
                "laser model parameters out of range: {:?}",
                self.laser_model
            )));
        }
        if let ResamplePolicy::EffectiveSampleSize { ratio } = self.resample_policy {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(FilterError::InvalidConfig(format!(
                    "effective sample size ratio must be in (0, 1], got {ratio}"
                )));
            }
        }
        UniformRegion::around(&Pose2D::identity(), &self.reset_spread).validate()
    }
}

/// Rectangular position range and heading interval sampled on a regular grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformRegion {
    pub min: Point2<f64>,
    pub max: Point2<f64>,
    /// Grid step along x and y (m).
    pub resolution: f64,
    pub min_theta: f64,
    pub max_theta: f64,
    /// Grid step in heading (rad).
    pub angular_resolution: f64,
}

impl UniformRegion {
    pub fn new(
        min: Point2<f64>,
        max: Point2<f64>,
        resolution: f64,
        min_theta: f64,
        max_theta: f64,
        angular_resolution: f64,
    ) -> Self {
        UniformRegion {
            min,
            max,
            resolution,
            min_theta,
            max_theta,
            angular_resolution,
        }
    }

    /// Square region centred on `pose`.
    pub fn around(pose: &Pose2D, spread: &ResetSpread) -> Self {
        UniformRegion {
            min: Point2::new(pose.x - spread.xy, pose.y - spread.xy),
            max: Point2::new(pose.x + spread.xy, pose.y + spread.xy),
            resolution: spread.xy_resolution,
            min_theta: pose.theta - spread.theta,
            max_theta: pose.theta + spread.theta,
            angular_resolution: spread.theta_resolution,
        }
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        let bounds = [
            self.min.x,
            self.min.y,
            self.max.x,
            self.max.y,
            self.min_theta,
            self.max_theta,
        ];
        if bounds.iter().any(|v| !v.is_finite()) {
            return Err(FilterError::InvalidRegion(
                "region bounds must be finite".to_string(),
            ));
        }
        for (name, step) in [
            ("resolution", self.resolution),
            ("angular_resolution", self.angular_resolution),
        ] {
            if !(step > 0.0 && step.is_finite()) {
                return Err(FilterError::InvalidRegion(format!(
                    "{name} must be positive, got {step}"
                )));
            }
        }
        if self.max.x < self.min.x || self.max.y < self.min.y || self.max_theta < self.min_theta {
            return Err(FilterError::InvalidRegion(format!(
                "empty region: {:?}",
                self
            )));
        }
        let count = self.grid_len();
        if count > MAX_SEED_PARTICLES {
            return Err(FilterError::InvalidRegion(format!(
                "region would produce {count} particles (limit {MAX_SEED_PARTICLES})"
            )));
        }
        Ok(())
    }

    /// Number of grid points. Only meaningful for a valid region.
    pub fn grid_len(&self) -> usize {
        axis_len(self.min.x, self.max.x, self.resolution)
            .saturating_mul(axis_len(self.min.y, self.max.y, self.resolution))
            .saturating_mul(axis_len(
                self.min_theta,
                self.max_theta,
                self.angular_resolution,
            ))
    }

    /// Every grid pose, bounds inclusive.
    pub fn poses(&self) -> Vec<Pose2D> {
        let xs = axis(self.min.x, self.max.x, self.resolution);
        let ys = axis(self.min.y, self.max.y, self.resolution);
        let thetas = axis(self.min_theta, self.max_theta, self.angular_resolution);
        let mut poses = Vec::with_capacity(xs.len() * ys.len() * thetas.len());
        for &x in &xs {
            for &y in &ys {
                for &theta in &thetas {
                    poses.push(Pose2D::new(x, y, theta));
                }
            }
        }
        poses
    }
}

fn axis_len(min: f64, max: f64, step: f64) -> usize {
    let span = ((max - min) / step + 1e-9).floor();
    if span >= usize::MAX as f64 {
        return usize::MAX;
    }
    span as usize + 1
}

fn axis(min: f64, max: f64, step: f64) -> Vec<f64> {
    (0..axis_len(min, max, step))
        .map(|i| min + i as f64 * step)
        .collect()
}

/// Lifecycle of the filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterState {
    #[default]
    Uninitialized,
    /// Particles were laid out but no update has run since.
    Seeded,
    Tracking,
}

/// What a completed cycle did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpdateReport {
    /// Effective sample size of the reweighted set, before resampling.
    pub effective_sample_size: f64,
    pub resampled: bool,
    /// Particle count after the cycle.
    pub particle_count: usize,
    pub best_log_likelihood: f64,
}

pub struct ParticleFilter {
    config: FilterConfig,
    particles: ParticleSet,
    motion: OdometryModel,
    sensor: LaserModel,
    rng: StdRng,
    state: FilterState,
    last_estimate: Option<Pose2D>,
    cycles: u64,
}

impl ParticleFilter {
    pub fn new(config: FilterConfig) -> Result<Self, FilterError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(ParticleFilter {
            motion: OdometryModel::new(config.odom_model),
            sensor: LaserModel::new(config.laser_model),
            config,
            particles: ParticleSet::new(),
            rng,
            state: FilterState::Uninitialized,
            last_estimate: None,
            cycles: 0,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn state(&self) -> FilterState {
        self.state
    }
    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    /// Completed update cycles since construction.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
    /// Estimate produced by the last successful cycle.
    pub fn last_estimate(&self) -> Option<Pose2D> {
        self.last_estimate
    }
    /// Predicted ray endpoints of the last sensor update (empty unless recording is enabled).
    pub fn ray_endpoints(&self) -> &[Point2<f64>] {
        self.sensor.ray_endpoints()
    }
    pub fn effective_sample_size(&self) -> f64 {
        self.particles.effective_sample_size()
    }

    /// Replace the belief with one particle per grid point of `region`, equally weighted.
    pub fn init_uniform(&mut self, region: &UniformRegion) -> Result<usize, FilterError> {
        region.validate()?;
        self.particles = ParticleSet::from_poses(region.poses());
        self.state = FilterState::Seeded;
        self.last_estimate = None;
        info!(
            "seeded {} particles over x [{:.3}, {:.3}], y [{:.3}, {:.3}], theta [{:.3}, {:.3}]",
            self.particles.len(),
            region.min.x,
            region.max.x,
            region.min.y,
            region.max.y,
            region.min_theta,
            region.max_theta
        );
        Ok(self.particles.len())
    }

    /// Re-seed around `pose` using the configured reset spread, discarding the prior belief.
    pub fn set_pose(&mut self, pose: &Pose2D) -> Result<usize, FilterError> {
        info!("pose reset to {}", pose);
        let region = UniformRegion::around(pose, &self.config.reset_spread);
        self.init_uniform(&region)
    }

    /// Run one motion → sensor → resample cycle.
    ///
    /// Returns `Ok(None)` without touching anything when there are no particles. On error the
    /// particle set and the last estimate are unchanged.
    pub fn update<W: WorldQuery + ?Sized>(
        &mut self,
        delta: &Pose2D,
        observation: &Observation,
        world: &W,
    ) -> Result<Option<UpdateReport>, FilterError> {
        if self.particles.is_empty() {
            return Ok(None);
        }
        let mut working = self.particles.clone();
        self.motion.update_poses(delta, &mut working, &mut self.rng);
        let sensor = self.sensor.update_weights(world, observation, &mut working)?;

        if let Err(err) = working.normalize_weights() {
            warn!(
                "particle weights collapsed after sensor update ({err}); keeping previous belief of {} particles",
                self.particles.len()
            );
            return Err(err.into());
        }
        if sensor.best_match_ratio < self.config.laser_model.min_match_ratio {
            warn!(
                "no particle explains the scan (best match ratio {:.3}); keeping previous belief of {} particles",
                sensor.best_match_ratio,
                self.particles.len()
            );
            return Err(FilterError::UnexplainedObservation {
                match_ratio: sensor.best_match_ratio,
            });
        }
        let effective_sample_size = working.effective_sample_size();
        let target = self.config.num_particles;
        let resampled =
            self.config
                .resample_policy
                .should_resample(effective_sample_size, working.len(), target);
        if resampled {
            working = self
                .config
                .resampling
                .resample(&working, target, &mut self.rng)?;
        }

        self.particles = working;
        self.state = FilterState::Tracking;
        self.cycles += 1;
        self.last_estimate = self.estimate();
        debug!(
            "cycle {}: {} particles, ess {:.1}, resampled {}, max weight {:.4e}",
            self.cycles,
            self.particles.len(),
            effective_sample_size,
            resampled,
            self.particles.max_weight()
        );
        Ok(Some(UpdateReport {
            effective_sample_size,
            resampled,
            particle_count: self.particles.len(),
            best_log_likelihood: sensor.best_log_likelihood,
        }))
    }

    /// Weighted circular mean of the current set; `None` when there is nothing to average.
    pub fn mean_pose(&self) -> Option<Pose2D> {
        self.particles.weighted_mean()
    }

    /// Summary pose using the configured averaging strategy.
    pub fn estimate(&self) -> Option<Pose2D> {
        self.config.averaging.estimate(&self.particles)
    }

    /// Weighted covariance of (x, y, theta) around the mean.
    pub fn covariance(&self) -> Option<Matrix3<f64>> {
        self.particles.weighted_covariance()
    }
}

impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.max_weight();
        f.debug_struct("ParticleFilter")
            .field("state", &self.state)
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.particles.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("last_estimate", &self.last_estimate)
            .field("cycles", &self.cycles)
            .finish()
    }
}
