//! Monte Carlo localization toolbox for planar robots
//!
//! This crate estimates the pose of a mobile robot inside a known map using a particle filter. The
//! belief over the robot pose $(x, y, \theta)$ is represented by a set of weighted samples which are
//! moved by odometry, weighted by how well a laser scan agrees with the map, and resampled. The filter
//! core is pure computation: it does no I/O, owns no transforms and never waits for data. Everything it
//! needs for a cycle (the odometry delta, the scan together with the sensor mount, and the map) is
//! passed in by the caller.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the points, matrices and isometries used by the geometry.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provide random number generation for motion noise and resampling.
//! - [`serde`](https://crates.io/crates/serde): Provides (de)serialization of configurations and maps as JSON, YAML or TOML.
//!
//! ## Crate overview
//!
//! - [geometry]: 2-D rigid transforms ([`Pose2D`]) and angle helpers.
//! - [particle]: Particles, the particle set, resampling and averaging strategies.
//! - [motion]: The odometry motion model (prediction step).
//! - [sensor]: Laser scans, the sensor mount and the beam likelihood model (correction step).
//! - [world]: The ray-casting interface to the map and a line-segment reference map.
//! - [filter]: The filter controller: seeding, the update cycle and pose extraction.
//! - [pipeline]: Per-cycle orchestration: odometry bookkeeping, pose resets and skip rules.
//! - [config]: The configuration file format.
//! - [error]: Error types.
//!
//! ## Update cycle
//!
//! Every cycle runs the same three stages in a fixed order:
//!
//! 1. **Predict.** Each particle is moved by the odometry delta in its own frame and perturbed by
//!    Gaussian noise that grows with the size of the motion.
//! 2. **Correct.** Each particle's weight is multiplied by the likelihood of the scan,
//!    $w_i \leftarrow w_i \prod_k p(z_k \mid x_i, m)$, evaluated on a bounded subset of beams.
//! 3. **Resample.** A new generation of `num_particles` particles is drawn in proportion to the
//!    weights (systematic resampling by default) and every weight is reset to $1/N$.
//!
//! If every weight vanishes after the correction step the cycle fails with
//! [`ResampleError::DegenerateWeights`]; if even the best particle explains the scan no better
//! than random returns it fails with [`FilterError::UnexplainedObservation`]. Either way the
//! previous belief is kept.
//!
//! ## Pose estimate
//!
//! By default the reported pose is the weighted mean of the particles. The heading is a circular mean,
//!
//! $$
//! \bar\theta = \operatorname{atan2}\left(\sum_i w_i \sin\theta_i,\ \sum_i w_i \cos\theta_i\right)
//! $$
//!
//! so a cloud straddling $\pm\pi$ averages to $\pm\pi$ rather than to zero.
//!
//! ## Example
//!
//! ```
//! use mcl::{FilterConfig, ParticleFilter, Pose2D};
//!
//! let config = FilterConfig { seed: Some(1), ..FilterConfig::default() };
//! let mut filter = ParticleFilter::new(config).unwrap();
//! filter.set_pose(&Pose2D::new(1.0, 2.0, 0.5)).unwrap();
//! let mean = filter.mean_pose().unwrap();
//! assert!((mean.x - 1.0).abs() < 1e-9);
//! assert!((mean.theta - 0.5).abs() < 1e-9);
//! ```
pub mod config;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod motion;
pub mod particle;
pub mod pipeline;
pub mod sensor;
pub mod world;

pub use config::{FrameConfig, InitialPose, LocalizationConfig};
pub use error::{FilterError, ResampleError};
pub use filter::{
    FilterConfig, FilterState, ParticleFilter, ResamplePolicy, ResetSpread, UniformRegion,
    UpdateReport,
};
pub use geometry::{Pose2D, angle_difference, wrap_to_pi};
pub use motion::{MotionModelConfig, OdometryModel};
pub use particle::{
    Particle, ParticleAveragingStrategy, ParticleResamplingStrategy, ParticleSet,
    systematic_resample,
};
pub use pipeline::{
    CycleOutcome, LocalizationResult, Localizer, OdometryStep, OdometryTracker, SkipReason,
};
pub use sensor::{LaserModel, LaserModelConfig, LaserScan, Observation, SensorMount};
pub use world::{RayHit, Segment, SegmentMap, WorldQuery};
