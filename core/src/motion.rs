//! Odometry motion model (prediction step).
//!
//! Every particle is moved by the odometry delta expressed in its own body frame, then
//! perturbed by zero-mean Gaussian noise in that same frame. The noise standard deviations grow
//! linearly with the size of the motion:
//!
//! $$
//! \sigma_t = \max(\sigma_{t,min},\ \alpha_{tt} |\Delta t| + \alpha_{tr} |\Delta\theta|)
//! $$
//! $$
//! \sigma_\theta = \max(\sigma_{\theta,min},\ \alpha_{rt} |\Delta t| + \alpha_{rr} |\Delta\theta|)
//! $$
//!
//! The floors keep a stationary robot's particle cloud from collapsing onto a handful of poses
//! after repeated resampling.
use crate::geometry::Pose2D;
use crate::particle::ParticleSet;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Noise parameters of the odometry model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionModelConfig {
    /// Translation noise per unit of translation (m/m).
    pub trans_per_trans: f64,
    /// Rotation noise per unit of translation (rad/m).
    pub rot_per_trans: f64,
    /// Translation noise per unit of rotation (m/rad).
    pub trans_per_rot: f64,
    /// Rotation noise per unit of rotation (rad/rad).
    pub rot_per_rot: f64,
    /// Translation noise injected every cycle, even when the robot is still (m).
    pub min_trans_noise: f64,
    /// Rotation noise injected every cycle, even when the robot is still (rad).
    pub min_rot_noise: f64,
}

impl Default for MotionModelConfig {
    fn default() -> Self {
        MotionModelConfig {
            trans_per_trans: 0.1,
            rot_per_trans: 0.05,
            trans_per_rot: 0.02,
            rot_per_rot: 0.1,
            min_trans_noise: 0.005,
            min_rot_noise: 0.002,
        }
    }
}

impl MotionModelConfig {
    /// A model that applies the odometry exactly. Useful for tests and replay.
    pub fn noiseless() -> Self {
        MotionModelConfig {
            trans_per_trans: 0.0,
            rot_per_trans: 0.0,
            trans_per_rot: 0.0,
            rot_per_rot: 0.0,
            min_trans_noise: 0.0,
            min_rot_noise: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        [
            self.trans_per_trans,
            self.rot_per_trans,
            self.trans_per_rot,
            self.rot_per_rot,
            self.min_trans_noise,
            self.min_rot_noise,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct OdometryModel {
    config: MotionModelConfig,
}

impl OdometryModel {
    pub fn new(config: MotionModelConfig) -> Self {
        OdometryModel { config }
    }

    pub fn config(&self) -> &MotionModelConfig {
        &self.config
    }

    /// Standard deviations `(translation, rotation)` applied for a given delta.
    pub fn noise_std(&self, delta: &Pose2D) -> (f64, f64) {
        let trans = delta.translation_norm();
        let rot = delta.theta.abs();
        let c = &self.config;
        let sigma_trans = (c.trans_per_trans * trans + c.trans_per_rot * rot).max(c.min_trans_noise);
        let sigma_rot = (c.rot_per_trans * trans + c.rot_per_rot * rot).max(c.min_rot_noise);
        (sigma_trans, sigma_rot)
    }

    /// Sample a successor pose for a single particle.
    pub fn sample<R: Rng + ?Sized>(&self, pose: &Pose2D, delta: &Pose2D, rng: &mut R) -> Pose2D {
        let moved = pose.compose(delta);
        let (sigma_trans, sigma_rot) = self.noise_std(delta);
        if sigma_trans <= 0.0 && sigma_rot <= 0.0 {
            return moved;
        }
        let noise = Pose2D::new(
            sigma_trans * gaussian(rng),
            sigma_trans * gaussian(rng),
            sigma_rot * gaussian(rng),
        );
        moved.compose(&noise)
    }

    /// Move every particle by `delta`. Weights are left untouched.
    pub fn update_poses<R: Rng + ?Sized>(
        &self,
        delta: &Pose2D,
        particles: &mut ParticleSet,
        rng: &mut R,
    ) {
        for particle in particles.iter_mut() {
            particle.pose = self.sample(&particle.pose, delta, rng);
        }
    }
}

fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    StandardNormal.sample(rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::FRAC_PI_2;

    fn spread_set() -> ParticleSet {
        vec![
            Particle::new(Pose2D::new(0.0, 0.0, 0.0), 0.2),
            Particle::new(Pose2D::new(1.0, -1.0, FRAC_PI_2), 0.3),
            Particle::new(Pose2D::new(-2.0, 0.5, -2.5), 0.5),
        ]
        .into()
    }

    #[test]
    fn identity_delta_without_floor_is_a_no_op() {
        let model = OdometryModel::new(MotionModelConfig {
            min_trans_noise: 0.0,
            min_rot_noise: 0.0,
            ..MotionModelConfig::default()
        });
        let mut set = spread_set();
        let before = set.clone();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..10 {
            model.update_poses(&Pose2D::identity(), &mut set, &mut rng);
        }
        assert_eq!(set, before);
    }
    #[test]
    fn translation_is_applied_in_each_particle_frame() {
        let model = OdometryModel::new(MotionModelConfig::noiseless());
        let mut set = spread_set();
        let before = set.clone();
        let mut rng = StdRng::seed_from_u64(5);
        model.update_poses(&Pose2D::new(0.5, 0.0, 0.0), &mut set, &mut rng);
        for (after, before) in set.iter().zip(before.iter()) {
            assert_approx_eq!(after.pose.x, before.pose.x + 0.5 * before.pose.theta.cos(), 1e-12);
            assert_approx_eq!(after.pose.y, before.pose.y + 0.5 * before.pose.theta.sin(), 1e-12);
            assert_approx_eq!(after.pose.theta, before.pose.theta, 1e-12);
            assert_eq!(after.weight, before.weight);
        }
    }
    #[test]
    fn noise_grows_with_motion_and_respects_the_floor() {
        let model = OdometryModel::new(MotionModelConfig::default());
        let (t0, r0) = model.noise_std(&Pose2D::identity());
        assert_approx_eq!(t0, 0.005, 1e-12);
        assert_approx_eq!(r0, 0.002, 1e-12);
        let (t1, r1) = model.noise_std(&Pose2D::new(1.0, 0.0, 0.5));
        assert_approx_eq!(t1, 0.1 + 0.02 * 0.5, 1e-12);
        assert_approx_eq!(r1, 0.05 + 0.1 * 0.5, 1e-12);
    }
    #[test]
    fn stationary_floor_still_spreads_particles() {
        let model = OdometryModel::new(MotionModelConfig::default());
        let mut set = ParticleSet::from_poses(vec![Pose2D::identity(); 200]);
        let mut rng = StdRng::seed_from_u64(17);
        model.update_poses(&Pose2D::identity(), &mut set, &mut rng);
        let distinct = set.iter().filter(|p| p.pose != Pose2D::identity()).count();
        assert_eq!(distinct, 200);
        let mean_abs_x: f64 = set.iter().map(|p| p.pose.x.abs()).sum::<f64>() / 200.0;
        assert!(mean_abs_x < 0.02, "floor noise too large: {mean_abs_x}");
    }
    #[test]
    fn noisy_motion_is_centred_on_the_odometry() {
        let model = OdometryModel::new(MotionModelConfig::default());
        let mut set = ParticleSet::from_poses(vec![Pose2D::identity(); 2000]);
        let mut rng = StdRng::seed_from_u64(23);
        model.update_poses(&Pose2D::new(1.0, 0.0, 0.0), &mut set, &mut rng);
        let mean = set.weighted_mean().unwrap();
        assert_approx_eq!(mean.x, 1.0, 0.02);
        assert_approx_eq!(mean.y, 0.0, 0.02);
        assert_approx_eq!(mean.theta, 0.0, 0.01);
    }
    #[test]
    fn validity_check_rejects_negative_parameters() {
        assert!(MotionModelConfig::default().is_valid());
        let bad = MotionModelConfig {
            rot_per_rot: -0.1,
            ..MotionModelConfig::default()
        };
        assert!(!bad.is_valid());
    }
}
