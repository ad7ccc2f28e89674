//! Particles, the particle set, and the population-level operations on it.
//!
//! The particle set is the whole belief state of the filter. Weights are unnormalized between
//! sensor updates; they are normalized only when resampling or when summarizing the set into a
//! single pose. Any operation that needs normalized weights reports
//! [`ResampleError::DegenerateWeights`] instead of dividing by a zero or non-finite total.
use crate::error::ResampleError;
use crate::geometry::{Pose2D, angle_difference, wrap_to_pi};

use nalgebra::Matrix3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// One pose hypothesis with its (unnormalized) importance weight.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub pose: Pose2D,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(pose: Pose2D, weight: f64) -> Particle {
        Particle { pose, weight }
    }
}

/// Ordered collection of particles. Empty only before the filter has been seeded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleSet {
    particles: Vec<Particle>,
}

impl From<Vec<Particle>> for ParticleSet {
    fn from(particles: Vec<Particle>) -> Self {
        ParticleSet { particles }
    }
}

impl<'a> IntoIterator for &'a ParticleSet {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;

    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

impl ParticleSet {
    pub fn new() -> Self {
        ParticleSet::default()
    }
    /// Build a set from poses, giving every particle the weight `1 / len`.
    pub fn from_poses<I: IntoIterator<Item = Pose2D>>(poses: I) -> Self {
        let mut particles: Vec<Particle> = poses
            .into_iter()
            .map(|pose| Particle::new(pose, 1.0))
            .collect();
        let uniform = 1.0 / particles.len().max(1) as f64;
        for particle in &mut particles {
            particle.weight = uniform;
        }
        ParticleSet { particles }
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Particle> {
        self.particles.iter_mut()
    }
    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }
    pub fn as_mut_slice(&mut self) -> &mut [Particle] {
        &mut self.particles
    }
    pub fn poses(&self) -> Vec<Pose2D> {
        self.particles.iter().map(|p| p.pose).collect()
    }
    pub fn clear(&mut self) {
        self.particles.clear();
    }
    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }
    pub fn max_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).fold(0.0, f64::max)
    }
    /// Weights scaled to sum to one.
    pub fn normalized_weights(&self) -> Result<Vec<f64>, ResampleError> {
        if self.particles.is_empty() {
            return Err(ResampleError::EmptySet);
        }
        let total = self.total_weight();
        if !(total > 0.0 && total.is_finite()) {
            return Err(ResampleError::DegenerateWeights { total });
        }
        Ok(self.particles.iter().map(|p| p.weight / total).collect())
    }
    pub fn normalize_weights(&mut self) -> Result<(), ResampleError> {
        let weights = self.normalized_weights()?;
        for (particle, w) in self.particles.iter_mut().zip(weights) {
            particle.weight = w;
        }
        Ok(())
    }
    pub fn set_uniform_weights(&mut self) {
        let uniform = 1.0 / self.particles.len().max(1) as f64;
        for particle in &mut self.particles {
            particle.weight = uniform;
        }
    }
    /// Kish effective sample size of the normalized weights; 0 for an empty or degenerate set.
    pub fn effective_sample_size(&self) -> f64 {
        match self.normalized_weights() {
            Ok(weights) => {
                let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
                if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
            }
            Err(_) => 0.0,
        }
    }
    /// Weighted mean pose. The heading is the angle of the weighted sum of unit vectors.
    pub fn weighted_mean(&self) -> Option<Pose2D> {
        let weights = self.normalized_weights().ok()?;
        Some(circular_mean(
            self.particles.iter().zip(weights.iter()).map(|(p, w)| (&p.pose, *w)),
        ))
    }
    /// Unweighted mean pose, ignoring the importance weights.
    pub fn unweighted_mean(&self) -> Option<Pose2D> {
        if self.particles.is_empty() {
            return None;
        }
        let w = 1.0 / self.particles.len() as f64;
        Some(circular_mean(self.particles.iter().map(|p| (&p.pose, w))))
    }
    pub fn highest_weight(&self) -> Option<&Particle> {
        self.particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
    }
    /// Weighted covariance of `(x, y, theta)` about the weighted mean.
    ///
    /// Heading deviations are taken on the circle, so a cloud straddling ±π is not reported as
    /// wildly uncertain.
    pub fn weighted_covariance(&self) -> Option<Matrix3<f64>> {
        let weights = self.normalized_weights().ok()?;
        let mean = self.weighted_mean()?;
        let mut cov = Matrix3::<f64>::zeros();
        for (particle, w) in self.particles.iter().zip(weights) {
            let diff = nalgebra::Vector3::new(
                particle.pose.x - mean.x,
                particle.pose.y - mean.y,
                angle_difference(particle.pose.theta, mean.theta),
            );
            cov += w * diff * diff.transpose();
        }
        Some(cov)
    }
}

fn circular_mean<'a, I: Iterator<Item = (&'a Pose2D, f64)>>(weighted: I) -> Pose2D {
    let (mut x, mut y, mut c, mut s) = (0.0, 0.0, 0.0, 0.0);
    for (pose, w) in weighted {
        x += w * pose.x;
        y += w * pose.y;
        c += w * pose.theta.cos();
        s += w * pose.theta.sin();
    }
    Pose2D::new(x, y, wrap_to_pi(s.atan2(c)))
}

/// How a weighted set is summarized into a single pose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleAveragingStrategy {
    #[default]
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}

impl ParticleAveragingStrategy {
    pub fn estimate(&self, particles: &ParticleSet) -> Option<Pose2D> {
        match self {
            ParticleAveragingStrategy::WeightedAverage => particles.weighted_mean(),
            ParticleAveragingStrategy::UnweightedAverage => particles.unweighted_mean(),
            ParticleAveragingStrategy::HighestWeight => particles.highest_weight().map(|p| p.pose),
        }
    }
}

/// Scheme used to draw the next generation.
///
/// All schemes return exactly `target` particles with weight `1 / target`, copying poses by
/// value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleResamplingStrategy {
    /// Low-variance resampling: one random offset, fixed stride through the CDF.
    #[default]
    Systematic,
    /// One independent uniform draw per output particle.
    Multinomial,
    /// One uniform draw inside each of `target` equal strata.
    Stratified,
    /// Deterministic copies of `floor(target * w)`, remainder drawn systematically.
    Residual,
}

impl ParticleResamplingStrategy {
    pub fn resample<R: Rng + ?Sized>(
        &self,
        particles: &ParticleSet,
        target: usize,
        rng: &mut R,
    ) -> Result<ParticleSet, ResampleError> {
        if target == 0 {
            return Err(ResampleError::ZeroTarget);
        }
        let weights = particles.normalized_weights()?;
        let indices = match self {
            ParticleResamplingStrategy::Systematic => systematic_indices(&weights, target, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_indices(&weights, target, rng),
            ParticleResamplingStrategy::Stratified => stratified_indices(&weights, target, rng),
            ParticleResamplingStrategy::Residual => residual_indices(&weights, target, rng),
        };
        let uniform = 1.0 / target as f64;
        let source = particles.as_slice();
        Ok(indices
            .into_iter()
            .map(|i| Particle::new(source[i].pose, uniform))
            .collect::<Vec<_>>()
            .into())
    }
}

/// Shorthand for [`ParticleResamplingStrategy::Systematic`].
pub fn systematic_resample<R: Rng + ?Sized>(
    particles: &ParticleSet,
    target: usize,
    rng: &mut R,
) -> Result<ParticleSet, ResampleError> {
    ParticleResamplingStrategy::Systematic.resample(particles, target, rng)
}

/// Walk the CDF of `weights` with the given sorted positions in `[0, 1)`.
///
/// Particle `i` owns the half-open interval `[cumsum(i - 1), cumsum(i))`, so a zero-weight
/// particle is never selected.
fn select_sorted(weights: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    let mut selected = Vec::new();
    let mut i = 0;
    let mut cumsum = weights[0];
    for u in positions {
        while u >= cumsum && i < last {
            i += 1;
            cumsum += weights[i];
        }
        selected.push(i);
    }
    selected
}

fn systematic_indices<R: Rng + ?Sized>(weights: &[f64], target: usize, rng: &mut R) -> Vec<usize> {
    let step = 1.0 / target as f64;
    let offset = rng.random::<f64>() * step;
    select_sorted(weights, (0..target).map(|m| offset + m as f64 * step))
}

fn stratified_indices<R: Rng + ?Sized>(weights: &[f64], target: usize, rng: &mut R) -> Vec<usize> {
    let step = 1.0 / target as f64;
    let positions: Vec<f64> = (0..target)
        .map(|m| (m as f64 + rng.random::<f64>()) * step)
        .collect();
    select_sorted(weights, positions.into_iter())
}

fn multinomial_indices<R: Rng + ?Sized>(weights: &[f64], target: usize, rng: &mut R) -> Vec<usize> {
    let mut cdf = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for w in weights {
        acc += w;
        cdf.push(acc);
    }
    let last = weights.len() - 1;
    (0..target)
        .map(|_| {
            let u = rng.random::<f64>() * acc;
            cdf.partition_point(|&c| c < u).min(last)
        })
        .collect()
}

fn residual_indices<R: Rng + ?Sized>(weights: &[f64], target: usize, rng: &mut R) -> Vec<usize> {
    let n = target as f64;
    let mut selected = Vec::with_capacity(target);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * n).floor() as usize;
        selected.extend(std::iter::repeat_n(i, copies));
        residual.push(w * n - copies as f64);
    }
    // Rounding can push the deterministic copies one past the target.
    selected.truncate(target);
    let remaining = target - selected.len();
    if remaining > 0 {
        let sum_residual: f64 = residual.iter().sum();
        if sum_residual > 0.0 && sum_residual.is_finite() {
            let normalized: Vec<f64> = residual.iter().map(|r| r / sum_residual).collect();
            selected.extend(systematic_indices(&normalized, remaining, rng));
        } else {
            selected.extend(systematic_indices(weights, remaining, rng));
        }
    }
    selected
}
