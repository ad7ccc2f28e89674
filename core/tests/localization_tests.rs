//! End-to-end tests of the localization filter against synthetic worlds.
//!
//! Scans are generated by ray casting the same [`SegmentMap`] the filter localizes against, so a
//! scan taken from the true pose agrees with the map exactly. All randomness is seeded.
use assert_approx_eq::assert_approx_eq;
use chrono::{TimeZone, Utc};
use mcl::{
    CycleOutcome, FilterConfig, FilterState, LaserScan, LocalizationConfig, Localizer,
    Observation, Particle, ParticleFilter, ParticleResamplingStrategy, ParticleSet, Pose2D,
    Segment, SegmentMap, SensorMount, UniformRegion, WorldQuery, angle_difference,
};
use nalgebra::Point2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::f64::consts::PI;

fn scan_from<W: WorldQuery>(
    world: &W,
    pose: &Pose2D,
    angle_min: f64,
    angle_max: f64,
    beams: usize,
) -> LaserScan {
    let angle_increment = (angle_max - angle_min) / (beams - 1) as f64;
    let ranges = (0..beams)
        .map(|i| {
            let hit = world.ray_cast(pose, angle_min + i as f64 * angle_increment);
            if hit.valid { hit.range } else { f64::INFINITY }
        })
        .collect();
    LaserScan {
        ranges,
        angle_min,
        angle_increment,
        range_min: 0.05,
        range_max: 10.0,
        stamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        frame_id: "base_laser".to_string(),
    }
}

fn single_wall() -> SegmentMap {
    SegmentMap::new(vec![Segment::new(2.0, -20.0, 2.0, 20.0)])
}

#[test]
fn converges_on_a_scan_consistent_with_the_origin() {
    let world = single_wall();
    let mut filter = ParticleFilter::new(FilterConfig {
        num_particles: 500,
        seed: Some(2024),
        ..FilterConfig::default()
    })
    .unwrap();
    let region = UniformRegion::new(
        Point2::new(-0.5, -0.5),
        Point2::new(0.5, 0.5),
        0.05,
        -0.1,
        0.1,
        0.05,
    );
    assert_eq!(filter.init_uniform(&region).unwrap(), 2205);

    let scan = scan_from(&world, &Pose2D::identity(), -1.2, 1.2, 121);
    let observation = Observation::new(scan, SensorMount::default());
    let report = filter
        .update(&Pose2D::identity(), &observation, &world)
        .unwrap()
        .unwrap();
    assert!(report.resampled);
    assert_eq!(filter.len(), 500);

    let mean = filter.mean_pose().unwrap();
    assert_approx_eq!(mean.x, 0.0, 0.05);
    assert_approx_eq!(mean.y, 0.0, 0.05);
    assert_approx_eq!(mean.theta, 0.0, 0.05);
}

#[test]
fn inconsistent_scan_reports_degenerate_weights() {
    let world = single_wall();
    let mut filter = ParticleFilter::new(FilterConfig {
        seed: Some(11),
        ..FilterConfig::default()
    })
    .unwrap();
    filter.set_pose(&Pose2D::identity()).unwrap();
    filter
        .update(
            &Pose2D::identity(),
            &Observation::new(
                scan_from(&world, &Pose2D::identity(), -1.2, 1.2, 360),
                SensorMount::default(),
            ),
            &world,
        )
        .unwrap();
    let estimate = filter.last_estimate();
    let belief = filter.particles().clone();

    // Every beam reports an obstacle right at the sensor, which no particle predicts.
    let mut blocked = scan_from(&world, &Pose2D::identity(), -1.2, 1.2, 360);
    blocked.ranges.iter_mut().for_each(|r| *r = 0.05);
    let err = filter
        .update(
            &Pose2D::identity(),
            &Observation::new(blocked, SensorMount::default()),
            &world,
        )
        .unwrap_err();
    assert!(err.is_degenerate(), "{err}");
    assert_eq!(filter.particles(), &belief);
    assert_eq!(filter.last_estimate(), estimate);
    assert_eq!(filter.state(), FilterState::Tracking);
}

#[test]
fn localizer_keeps_the_last_result_when_lost() {
    let world = SegmentMap::rectangle(-2.0, -2.0, 3.0, 2.0);
    let mut config = LocalizationConfig::default();
    config.filter.seed = Some(5);
    let mut localizer = Localizer::new(&config).unwrap();
    localizer.resolve_sensor_mount(SensorMount::default());
    localizer.request_pose(Pose2D::identity());

    let good = scan_from(&world, &Pose2D::identity(), -PI, PI, 360);
    let outcome = localizer.process(Some(good.clone()), Some(Pose2D::identity()), &world);
    assert!(outcome.is_updated());
    let kept = localizer.last_result().cloned().unwrap();

    let mut bad = good;
    bad.ranges.iter_mut().for_each(|r| *r = 0.05);
    let outcome = localizer.process(Some(bad), Some(Pose2D::identity()), &world);
    match outcome {
        CycleOutcome::Lost(err) => assert!(err.is_degenerate()),
        other => panic!("expected lost, got {:?}", other),
    }
    assert_eq!(localizer.last_result(), Some(&kept));
}

#[test]
fn tracks_a_robot_driving_an_arc_in_a_room() {
    let world = SegmentMap::rectangle(-2.0, -2.0, 3.0, 2.0);
    let mut config = LocalizationConfig::default();
    config.filter.seed = Some(77);
    config.filter.num_particles = 400;
    config.filter.laser_model.num_beams = 60;
    config.initial_pose = Some(mcl::InitialPose {
        x: 0.1,
        y: -0.1,
        rz: 0.05,
    });
    let mut localizer = Localizer::new(&config).unwrap();
    localizer.resolve_sensor_mount(SensorMount::default());

    // Odometry starts at an arbitrary origin; only its increments matter.
    let odom_origin = Pose2D::new(10.0, 5.0, 1.0);
    let step = Pose2D::new(0.04, 0.0, 0.02);
    let mut truth = Pose2D::identity();
    let mut odom = odom_origin;
    for _ in 0..50 {
        let scan = scan_from(&world, &truth, -PI, PI - 2.0 * PI / 120.0, 120);
        let outcome = localizer.process(Some(scan), Some(odom), &world);
        assert!(outcome.is_updated(), "{:?}", outcome);
        truth = truth * step;
        odom = odom * step;
    }
    let scan = scan_from(&world, &truth, -PI, PI - 2.0 * PI / 120.0, 120);
    let CycleOutcome::Updated(result) = localizer.process(Some(scan), Some(odom), &world) else {
        panic!("final cycle did not update");
    };
    assert!(result.pose.distance(&truth) < 0.1, "{} vs {}", result.pose, truth);
    assert!(angle_difference(result.pose.theta, truth.theta).abs() < 0.05);

    // The map→odom correction carries the odometry pose onto the estimate.
    let corrected = result.map_to_odom * odom;
    assert_approx_eq!(corrected.x, result.pose.x, 1e-9);
    assert_approx_eq!(corrected.y, result.pose.y, 1e-9);
}

#[test]
fn equal_weight_resampling_selects_each_particle_evenly() {
    let input: ParticleSet = (0..10)
        .map(|i| Particle::new(Pose2D::new(i as f64, 0.0, 0.0), 1.0))
        .collect::<Vec<_>>()
        .into();
    let target = 50;
    let trials = 2000;
    for strategy in [
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Residual,
    ] {
        let mut rng = StdRng::seed_from_u64(31);
        let mut counts = [0usize; 10];
        for _ in 0..trials {
            let out = strategy.resample(&input, target, &mut rng).unwrap();
            assert_eq!(out.len(), target);
            for p in &out {
                counts[p.pose.x.round() as usize] += 1;
            }
        }
        for count in counts {
            let mean = count as f64 / trials as f64;
            assert_approx_eq!(mean, target as f64 / 10.0, 0.25);
        }
    }
}

#[test]
fn identical_seeds_give_identical_runs() {
    let world = SegmentMap::rectangle(-2.0, -2.0, 3.0, 2.0);
    let run = || {
        let mut filter = ParticleFilter::new(FilterConfig {
            num_particles: 150,
            seed: Some(9),
            ..FilterConfig::default()
        })
        .unwrap();
        filter.set_pose(&Pose2D::new(0.5, 0.5, 0.2)).unwrap();
        let observation = Observation::new(
            scan_from(&world, &Pose2D::new(0.5, 0.5, 0.2), -PI / 2.0, PI / 2.0, 61),
            SensorMount::default(),
        );
        for _ in 0..3 {
            filter
                .update(&Pose2D::new(0.01, 0.0, 0.0), &observation, &world)
                .unwrap();
        }
        filter.particles().clone()
    };
    assert_eq!(run(), run());
}
