//! Per-cycle orchestration around the filter.
//!
//! [`Localizer`] turns the raw inputs a robot produces each cycle (an optional laser scan and an
//! optional odom→base pose lookup) into filter calls, skipping the cycle whenever an input is
//! missing rather than waiting for it. It also owns the once-resolved sensor mount, the pending
//! operator pose reset and the odometry bookkeeping, so the filter itself stays free of frame
//! handling.
use crate::config::{FrameConfig, LocalizationConfig};
use crate::error::FilterError;
use crate::filter::ParticleFilter;
use crate::geometry::Pose2D;
use crate::sensor::{LaserScan, Observation, SensorMount};
use crate::world::WorldQuery;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use nalgebra::Matrix3;
use std::fmt::{self, Display};

/// Motion since the previous cycle, together with the absolute odometry pose it ends at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OdometryStep {
    pub delta: Pose2D,
    pub odom_to_base: Pose2D,
}

/// Turns absolute odom→base poses into relative motion deltas.
#[derive(Clone, Debug, Default)]
pub struct OdometryTracker {
    previous: Option<Pose2D>,
}

impl OdometryTracker {
    pub fn new() -> Self {
        OdometryTracker { previous: None }
    }

    pub fn previous(&self) -> Option<Pose2D> {
        self.previous
    }

    /// Motion from the last committed pose to this cycle's odom→base pose, `None` if the lookup
    /// failed. Nothing is recorded until [`commit`](Self::commit).
    ///
    /// The first pose yields an identity delta. A failed lookup also yields an identity delta at
    /// the previous pose; with no previous pose there is nothing to report.
    pub fn peek(&self, current: Option<Pose2D>) -> Option<OdometryStep> {
        match (current, self.previous) {
            (Some(current), Some(previous)) => Some(OdometryStep {
                delta: previous.inverse().compose(&current),
                odom_to_base: current,
            }),
            (Some(current), None) => Some(OdometryStep {
                delta: Pose2D::identity(),
                odom_to_base: current,
            }),
            (None, Some(previous)) => Some(OdometryStep {
                delta: Pose2D::identity(),
                odom_to_base: previous,
            }),
            (None, None) => None,
        }
    }

    /// Mark `step` as applied; the next delta starts from its odom→base pose.
    pub fn commit(&mut self, step: &OdometryStep) {
        self.previous = Some(step.odom_to_base);
    }

    /// [`peek`](Self::peek) and [`commit`](Self::commit) in one call.
    pub fn step(&mut self, current: Option<Pose2D>) -> Option<OdometryStep> {
        let step = self.peek(current)?;
        self.commit(&step);
        Some(step)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Why a cycle did not reach the filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoScan,
    SensorMountUnresolved,
    NoOdometry,
    NoParticles,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NoScan => "no laser scan",
            SkipReason::SensorMountUnresolved => "sensor mount not resolved",
            SkipReason::NoOdometry => "no odometry",
            SkipReason::NoParticles => "no particles",
        };
        f.write_str(text)
    }
}

/// Outputs of a successful cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalizationResult {
    pub stamp: DateTime<Utc>,
    /// Robot pose in the map frame, summarized with the configured averaging strategy.
    pub pose: Pose2D,
    /// Correction that places the odometry frame in the map: `pose * odom_to_base⁻¹`.
    pub map_to_odom: Pose2D,
    pub particle_count: usize,
    pub effective_sample_size: f64,
    pub covariance: Option<Matrix3<f64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Updated(LocalizationResult),
    Skipped(SkipReason),
    /// The filter rejected the cycle, e.g. because every particle disagreed with the scan. The
    /// cycle's odometry is carried into the next delta.
    Lost(FilterError),
}

impl CycleOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, CycleOutcome::Updated(_))
    }

    /// Short label used in logs and CSV output.
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Updated(_) => "updated",
            CycleOutcome::Skipped(_) => "skipped",
            CycleOutcome::Lost(_) => "lost",
        }
    }
}

#[derive(Debug)]
pub struct Localizer {
    frames: FrameConfig,
    filter: ParticleFilter,
    odometry: OdometryTracker,
    sensor_mount: Option<SensorMount>,
    pending_pose: Option<Pose2D>,
    last_result: Option<LocalizationResult>,
}

impl Localizer {
    /// Build the filter and, if the configuration carries an initial pose, seed around it.
    pub fn new(config: &LocalizationConfig) -> Result<Self, FilterError> {
        let mut filter = ParticleFilter::new(config.filter)?;
        if let Some(initial) = config.initial_pose {
            filter.set_pose(&initial.into())?;
        }
        Ok(Localizer {
            frames: config.frames.clone(),
            filter,
            odometry: OdometryTracker::new(),
            sensor_mount: None,
            pending_pose: None,
            last_result: None,
        })
    }

    pub fn frames(&self) -> &FrameConfig {
        &self.frames
    }
    pub fn filter(&self) -> &ParticleFilter {
        &self.filter
    }
    pub fn sensor_mount(&self) -> Option<SensorMount> {
        self.sensor_mount
    }
    /// Result of the last successful cycle; kept across skipped and lost cycles.
    pub fn last_result(&self) -> Option<&LocalizationResult> {
        self.last_result.as_ref()
    }

    /// Record the laser mount. Only the first call has an effect.
    pub fn resolve_sensor_mount(&mut self, mount: SensorMount) -> bool {
        if self.sensor_mount.is_some() {
            return false;
        }
        info!(
            "sensor mount resolved: offset {}, height {:.3}",
            mount.offset, mount.height
        );
        self.sensor_mount = Some(mount);
        true
    }

    /// Queue a pose reset for the next cycle. A later request replaces an earlier one.
    pub fn request_pose(&mut self, pose: Pose2D) {
        self.pending_pose = Some(pose);
    }

    /// Run one localization cycle.
    pub fn process<W: WorldQuery + ?Sized>(
        &mut self,
        scan: Option<LaserScan>,
        odom_to_base: Option<Pose2D>,
        world: &W,
    ) -> CycleOutcome {
        if let Some(pose) = self.pending_pose.take() {
            if let Err(err) = self.filter.set_pose(&pose) {
                error!("ignoring pose reset to {}: {}", pose, err);
            }
        }

        let Some(scan) = scan else {
            return self.skip(SkipReason::NoScan);
        };
        let Some(mount) = self.sensor_mount else {
            return self.skip(SkipReason::SensorMountUnresolved);
        };
        let Some(step) = self.odometry.peek(odom_to_base) else {
            return self.skip(SkipReason::NoOdometry);
        };
        if self.filter.is_empty() {
            return self.skip(SkipReason::NoParticles);
        }

        let stamp = scan.stamp;
        let observation = Observation::new(scan, mount);
        let report = match self.filter.update(&step.delta, &observation, world) {
            Ok(Some(report)) => report,
            Ok(None) => return self.skip(SkipReason::NoParticles),
            Err(err) => {
                warn!("localization lost: {}", err);
                return CycleOutcome::Lost(err);
            }
        };
        self.odometry.commit(&step);
        let Some(pose) = self.filter.estimate() else {
            return self.skip(SkipReason::NoParticles);
        };
        let result = LocalizationResult {
            stamp,
            pose,
            map_to_odom: pose * step.odom_to_base.inverse(),
            particle_count: report.particle_count,
            effective_sample_size: report.effective_sample_size,
            covariance: self.filter.covariance(),
        };
        debug!(
            "{} -> {}: {} ({} particles)",
            self.frames.map_frame, self.frames.base_link_frame, pose, result.particle_count
        );
        self.last_result = Some(result.clone());
        CycleOutcome::Updated(result)
    }

    fn skip(&self, reason: SkipReason) -> CycleOutcome {
        match reason {
            SkipReason::SensorMountUnresolved | SkipReason::NoOdometry => {
                warn!("skipping localization cycle: {}", reason)
            }
            SkipReason::NoScan | SkipReason::NoParticles => {
                debug!("skipping localization cycle: {}", reason)
            }
        }
        CycleOutcome::Skipped(reason)
    }
}
