//! Synthetic robot, world and trial loop used by the simulator.
//!
//! The robot drives forward along an arc and turns on the spot whenever a wall comes too close.
//! Its wheel odometry integrates the commanded motion with multiplicative Gaussian noise, and its
//! laser is simulated by ray casting the same map the filter localizes against, plus Gaussian
//! range noise.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use log::{debug, info};
use mcl::{
    CycleOutcome, LaserScan, Localizer, ParticleSet, Pose2D, Segment, SegmentMap, SensorMount,
    WorldQuery, angle_difference,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::Serialize;
use std::error::Error;
use std::f64::consts::PI;
use std::path::Path;

/// Map used when no map file is given: a closed 8 m × 5 m room with a square pillar.
pub fn default_room() -> SegmentMap {
    let mut room = SegmentMap::rectangle(-3.0, -2.0, 5.0, 3.0);
    for segment in [
        Segment::new(2.0, -1.0, 2.5, -1.0),
        Segment::new(2.5, -1.0, 2.5, -0.5),
        Segment::new(2.5, -0.5, 2.0, -0.5),
        Segment::new(2.0, -0.5, 2.0, -1.0),
    ] {
        room.push(segment);
    }
    room
}

#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub steps: usize,
    /// Cycle period (s).
    pub dt: f64,
    /// Forward speed (m/s).
    pub speed: f64,
    /// Turn rate while driving (rad/s).
    pub turn_rate: f64,
    /// Odometry noise as a fraction of the commanded motion.
    pub odom_noise: f64,
    /// Standard deviation of the simulated range noise (m).
    pub range_noise: f64,
    /// Beams per scan, spread over a full turn.
    pub beams: usize,
    pub range_max: f64,
    /// Distance at which the robot stops and turns away from a wall (m).
    pub clearance: f64,
    pub start: Pose2D,
    pub mount: SensorMount,
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            steps: 300,
            dt: 0.1,
            speed: 0.3,
            turn_rate: 0.2,
            odom_noise: 0.05,
            range_noise: 0.02,
            beams: 180,
            range_max: 10.0,
            clearance: 0.6,
            start: Pose2D::identity(),
            mount: SensorMount::new(Pose2D::new(0.1, 0.0, 0.0), 0.3),
            seed: 42,
        }
    }
}

/// Simulated differential-drive robot.
#[derive(Clone, Debug)]
pub struct Robot {
    config: ScenarioConfig,
    truth: Pose2D,
    odom: Pose2D,
    step: usize,
    epoch: DateTime<Utc>,
    rng: StdRng,
}

impl Robot {
    pub fn new(config: ScenarioConfig) -> Self {
        Robot {
            truth: config.start,
            odom: Pose2D::identity(),
            step: 0,
            epoch: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }
    /// True pose in the map frame.
    pub fn truth(&self) -> Pose2D {
        self.truth
    }
    /// Dead-reckoned pose in the odometry frame.
    pub fn odom(&self) -> Pose2D {
        self.odom
    }
    /// Elapsed simulated time (s).
    pub fn time(&self) -> f64 {
        self.step as f64 * self.config.dt
    }
    pub fn stamp(&self) -> DateTime<Utc> {
        self.epoch + TimeDelta::milliseconds((self.time() * 1000.0).round() as i64)
    }

    fn gaussian(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        let n: f64 = StandardNormal.sample(&mut self.rng);
        sigma * n
    }

    /// Motion commanded for the next cycle.
    pub fn command<W: WorldQuery + ?Sized>(&self, world: &W) -> Pose2D {
        let c = &self.config;
        let forward = c.speed * c.dt;
        let ahead = world.ray_cast(&self.truth, 0.0);
        if ahead.valid && ahead.range < c.clearance + forward {
            let direction = if c.turn_rate < 0.0 { -1.0 } else { 1.0 };
            let spin = (c.turn_rate.abs() * 4.0).max(1.0) * c.dt;
            return Pose2D::new(0.0, 0.0, direction * spin);
        }
        Pose2D::new(forward, 0.0, c.turn_rate * c.dt)
    }

    /// Move one cycle: the true pose follows the command, odometry measures it with noise.
    pub fn advance<W: WorldQuery + ?Sized>(&mut self, world: &W) {
        let command = self.command(world);
        self.truth = self.truth * command;

        let noise = self.config.odom_noise;
        let sigma_trans = noise * command.x.abs();
        let sigma_rot = noise * (command.theta.abs() + command.x.abs());
        let measured = Pose2D::new(
            command.x + self.gaussian(sigma_trans),
            command.y + self.gaussian(sigma_trans),
            command.theta + self.gaussian(sigma_rot),
        );
        self.odom = self.odom * measured;
        self.step += 1;
    }

    /// Full-turn laser scan from the current true pose.
    pub fn scan<W: WorldQuery + ?Sized>(&mut self, world: &W) -> LaserScan {
        let beams = self.config.beams.max(1);
        let angle_min = -PI;
        let angle_increment = 2.0 * PI / beams as f64;
        let laser = self.truth * self.config.mount.offset;
        let mut ranges = Vec::with_capacity(beams);
        for i in 0..beams {
            let hit = world.ray_cast_at_height(
                &laser,
                angle_min + i as f64 * angle_increment,
                self.config.mount.height,
            );
            let range = if hit.valid && hit.range <= self.config.range_max {
                (hit.range + self.gaussian(self.config.range_noise)).max(0.0)
            } else {
                f64::INFINITY
            };
            ranges.push(range);
        }
        LaserScan {
            ranges,
            angle_min,
            angle_increment,
            range_min: 0.05,
            range_max: self.config.range_max,
            stamp: self.stamp(),
            frame_id: "base_laser".to_string(),
        }
    }
}

/// One CSV row per cycle.
#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    pub time: f64,
    pub true_x: f64,
    pub true_y: f64,
    pub true_theta: f64,
    pub est_x: Option<f64>,
    pub est_y: Option<f64>,
    pub est_theta: Option<f64>,
    pub position_error: Option<f64>,
    pub heading_error: Option<f64>,
    pub effective_sample_size: Option<f64>,
    pub particles: usize,
    pub outcome: &'static str,
}

#[derive(Serialize)]
struct ParticleRecord {
    x: f64,
    y: f64,
    theta: f64,
    weight: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrialSummary {
    pub cycles: usize,
    pub updated: usize,
    pub skipped: usize,
    pub lost: usize,
    pub rms_position_error: f64,
    pub final_position_error: Option<f64>,
    pub final_heading_error: Option<f64>,
}

/// Drive `robot` for its configured number of steps, localizing on every cycle.
pub fn run_trial<W: WorldQuery + ?Sized>(
    localizer: &mut Localizer,
    robot: &mut Robot,
    world: &W,
) -> Vec<StepRecord> {
    if localizer.sensor_mount().is_none() {
        localizer.resolve_sensor_mount(robot.config().mount);
    }
    let steps = robot.config().steps;
    let mut records = Vec::with_capacity(steps + 1);
    for _ in 0..=steps {
        let scan = robot.scan(world);
        let outcome = localizer.process(Some(scan), Some(robot.odom()), world);
        let truth = robot.truth();
        let (estimate, ess) = match (&outcome, localizer.last_result()) {
            (CycleOutcome::Updated(result), _) => {
                (Some(result.pose), Some(result.effective_sample_size))
            }
            (_, Some(last)) => (Some(last.pose), None),
            (_, None) => (None, None),
        };
        let record = StepRecord {
            time: robot.time(),
            true_x: truth.x,
            true_y: truth.y,
            true_theta: truth.theta,
            est_x: estimate.map(|p| p.x),
            est_y: estimate.map(|p| p.y),
            est_theta: estimate.map(|p| p.theta),
            position_error: estimate.map(|p| p.distance(&truth)),
            heading_error: estimate.map(|p| angle_difference(p.theta, truth.theta)),
            effective_sample_size: ess,
            particles: localizer.filter().len(),
            outcome: outcome.label(),
        };
        debug!(
            "t={:.2} truth {} estimate {:?} ({})",
            record.time, truth, estimate, record.outcome
        );
        records.push(record);
        robot.advance(world);
    }
    records
}

pub fn summarize(records: &[StepRecord]) -> TrialSummary {
    let mut summary = TrialSummary {
        cycles: records.len(),
        ..TrialSummary::default()
    };
    let mut squared = 0.0;
    let mut counted = 0usize;
    for record in records {
        match record.outcome {
            "updated" => summary.updated += 1,
            "lost" => summary.lost += 1,
            _ => summary.skipped += 1,
        }
        if let Some(err) = record.position_error {
            squared += err * err;
            counted += 1;
        }
    }
    if counted > 0 {
        summary.rms_position_error = (squared / counted as f64).sqrt();
    }
    if let Some(last) = records.last() {
        summary.final_position_error = last.position_error;
        summary.final_heading_error = last.heading_error;
    }
    summary
}

pub fn log_summary(label: &str, summary: &TrialSummary) {
    info!(
        "{}: {} cycles ({} updated, {} skipped, {} lost), rms position error {:.3} m, final error {:?} m / {:?} rad",
        label,
        summary.cycles,
        summary.updated,
        summary.skipped,
        summary.lost,
        summary.rms_position_error,
        summary.final_position_error,
        summary.final_heading_error
    );
}

pub fn write_records(path: &Path, records: &[StepRecord]) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_particles(path: &Path, particles: &ParticleSet) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for p in particles {
        writer.serialize(ParticleRecord {
            x: p.pose.x,
            y: p.pose.y,
            theta: p.pose.theta,
            weight: p.weight,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcl::LocalizationConfig;
    use tempfile::tempdir;

    fn localizer_at(start: Pose2D, seed: u64) -> Localizer {
        let mut config = LocalizationConfig::default();
        config.filter.seed = Some(seed);
        config.filter.num_particles = 300;
        config.filter.laser_model.num_beams = 60;
        let mut localizer = Localizer::new(&config).unwrap();
        localizer.request_pose(start);
        localizer
    }

    #[test]
    fn robot_stays_inside_the_room() {
        let world = default_room();
        let mut robot = Robot::new(ScenarioConfig {
            steps: 0,
            ..ScenarioConfig::default()
        });
        for _ in 0..600 {
            robot.advance(&world);
            let p = robot.truth();
            assert!(p.x > -3.0 && p.x < 5.0 && p.y > -2.0 && p.y < 3.0, "{p}");
        }
        assert!((robot.time() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn scans_cover_a_full_turn_inside_range() {
        let world = default_room();
        let mut robot = Robot::new(ScenarioConfig::default());
        let scan = robot.scan(&world);
        assert_eq!(scan.ranges.len(), 180);
        assert!((scan.angle_increment * 180.0 - 2.0 * PI).abs() < 1e-12);
        assert!(scan.ranges.iter().all(|r| r.is_finite() && *r < 10.0));
    }

    #[test]
    fn noiseless_odometry_matches_the_truth() {
        let world = default_room();
        let mut robot = Robot::new(ScenarioConfig {
            odom_noise: 0.0,
            ..ScenarioConfig::default()
        });
        for _ in 0..50 {
            robot.advance(&world);
        }
        assert!(robot.odom().distance(&robot.truth()) < 1e-9);
    }

    #[test]
    fn short_trial_tracks_the_robot() {
        let world = default_room();
        let config = ScenarioConfig {
            steps: 80,
            ..ScenarioConfig::default()
        };
        let mut localizer = localizer_at(config.start, 8);
        let mut robot = Robot::new(config);
        let records = run_trial(&mut localizer, &mut robot, &world);
        assert_eq!(records.len(), 81);
        let summary = summarize(&records);
        assert_eq!(summary.updated, 81);
        assert_eq!(summary.lost, 0);
        assert!(summary.rms_position_error < 0.15, "{:?}", summary);
        assert!(summary.final_position_error.unwrap() < 0.2, "{:?}", summary);
    }

    #[test]
    fn records_and_particles_are_written_as_csv() {
        let world = default_room();
        let config = ScenarioConfig {
            steps: 5,
            ..ScenarioConfig::default()
        };
        let mut localizer = localizer_at(config.start, 1);
        let mut robot = Robot::new(config);
        let records = run_trial(&mut localizer, &mut robot, &world);

        let dir = tempdir().unwrap();
        let out = dir.path().join("run.csv");
        write_records(&out, &records).unwrap();
        let mut reader = csv::Reader::from_path(&out).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "time");
        assert_eq!(&headers[11], "outcome");
        assert_eq!(reader.records().count(), 6);

        let cloud = dir.path().join("particles.csv");
        write_particles(&cloud, localizer.filter().particles()).unwrap();
        let reader = csv::Reader::from_path(&cloud).unwrap();
        assert_eq!(reader.into_records().count(), 300);
    }
}
