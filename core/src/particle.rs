//! Particle population and the Monte Carlo localization filter.
//!
//! The filter owns its population and its random number generator. The map and the per-cycle
//! observations are only borrowed for the duration of a call. Particle weights live on the particles
//! themselves; [`ParticleFilter::weights`] returns a snapshot for callers that need the flat vector.
use log::{debug, info, trace, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

use crate::config::FilterConfig;
use crate::error::{FilterError, Result, check_non_negative, check_positive};
use crate::measurements::{
    LandmarkId, LandmarkObservation, Map, associate, log_multivariate_gaussian_probability,
    transform_to_map_frame,
};
use crate::{ControlInput, Pose2D, forward, wrap_to_pi};

/// One observation-to-landmark match recorded during the latest weighting pass.
///
/// `sense_x` and `sense_y` are the map-frame coordinates of the observation as seen from the particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Association {
    pub landmark_id: LandmarkId,
    pub sense_x: f64,
    pub sense_y: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Particle {
    /// Sequential id, unique within the current population.
    pub id: usize,
    pub pose: Pose2D,
    /// Relative likelihood, non-negative.
    pub weight: f64,
    /// Diagnostic record of the latest weighting pass. Not read back by the filter.
    pub associations: Vec<Association>,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("id", &self.id)
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta", &self.pose.theta)
            .field("weight", &self.weight)
            .field("associations", &self.associations.len())
            .finish()
    }
}
impl Particle {
    pub fn new(id: usize, pose: Pose2D, weight: f64) -> Particle {
        Particle {
            id,
            pose,
            weight,
            associations: Vec::new(),
        }
    }
    /// Space-separated ids of the associated landmarks.
    pub fn associations_string(&self) -> String {
        join(self.associations.iter().map(|a| a.landmark_id.to_string()))
    }
    /// Space-separated map-frame x coordinates of the associated observations.
    pub fn sense_x_string(&self) -> String {
        join(self.associations.iter().map(|a| a.sense_x.to_string()))
    }
    /// Space-separated map-frame y coordinates of the associated observations.
    pub fn sense_y_string(&self) -> String {
        join(self.associations.iter().map(|a| a.sense_y.to_string()))
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(" ")
}

/// How the population is collapsed into a single pose estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleAveragingStrategy {
    WeightedAverage,
    UnweightedAverage,
    HighestWeight,
}
impl Default for ParticleAveragingStrategy {
    fn default() -> Self {
        ParticleAveragingStrategy::WeightedAverage
    }
}

/// Algorithm used to draw the next population.
///
/// Every strategy draws with replacement in proportion to the particle weights, normalizes
/// internally, and refuses populations whose weights sum to zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleResamplingStrategy {
    /// Single uniform offset, evenly spaced pointers. Lowest variance.
    Systematic,
    /// One uniform draw inside each of N equal strata.
    Stratified,
    /// N independent roulette-wheel draws.
    Multinomial,
    /// Deterministic floor(N·w) copies, remainder drawn systematically from the residual weights.
    Residual,
}
impl Default for ParticleResamplingStrategy {
    fn default() -> Self {
        ParticleResamplingStrategy::Systematic
    }
}

impl ParticleResamplingStrategy {
    /// Draw a new population of the same size from `particles`.
    ///
    /// Drawn particles are independent copies of their sources with fresh sequential ids and weight 1.
    pub fn resample<R: Rng + ?Sized>(
        &self,
        particles: &[Particle],
        rng: &mut R,
    ) -> Result<Vec<Particle>> {
        let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
        check_total_weight(&weights)?;
        let n = particles.len();
        let indices = match self {
            ParticleResamplingStrategy::Systematic => systematic_resample(&weights, n, rng),
            ParticleResamplingStrategy::Stratified => stratified_resample(&weights, n, rng),
            ParticleResamplingStrategy::Multinomial => multinomial_resample(&weights, n, rng),
            ParticleResamplingStrategy::Residual => residual_resample(&weights, n, rng),
        };
        Ok(indices
            .into_iter()
            .enumerate()
            .map(|(id, source)| {
                let mut particle = particles[source].clone();
                particle.id = id;
                particle.weight = 1.0;
                particle
            })
            .collect())
    }
}

fn check_total_weight(weights: &[f64]) -> Result<f64> {
    let total: f64 = weights.iter().sum();
    if total > 0.0 && total.is_finite() {
        Ok(total)
    } else {
        Err(FilterError::Divergence {
            total_weight: total,
            num_particles: weights.len(),
        })
    }
}

/// Normalized cumulative distribution and the index of the last strictly positive weight.
///
/// Selecting with `u >= cdf[i]` never lands on a zero-weight entry, and clamping to the last positive
/// index keeps rounding in the final bins from selecting trailing zero-weight entries.
fn cumulative_distribution(weights: &[f64]) -> (Vec<f64>, usize) {
    let total: f64 = weights.iter().sum();
    let mut running = 0.0;
    let cdf = weights
        .iter()
        .map(|w| {
            running += w;
            running / total
        })
        .collect();
    let last = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    (cdf, last)
}

/// Map sorted pointers in [0, 1) onto bins of the cumulative distribution.
fn select_sorted(weights: &[f64], pointers: impl Iterator<Item = f64>) -> Vec<usize> {
    let (cdf, last) = cumulative_distribution(weights);
    let mut i = 0;
    pointers
        .map(|u| {
            while i < last && u >= cdf[i] {
                i += 1;
            }
            i
        })
        .collect()
}

/// Systematic resampling: `count` pointers spaced 1/count apart behind a single random offset.
///
/// `weights` must be non-negative with a positive, finite total. Returns source indices.
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let step = 1.0 / count as f64;
    let offset = rng.random::<f64>() * step;
    select_sorted(weights, (0..count).map(|k| offset + k as f64 * step))
}

/// Stratified resampling: one independent uniform pointer inside each of `count` equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let step = 1.0 / count as f64;
    let pointers: Vec<f64> = (0..count)
        .map(|k| (k as f64 + rng.random::<f64>()) * step)
        .collect();
    select_sorted(weights, pointers.into_iter())
}

/// Multinomial (roulette-wheel) resampling: `count` independent inverse-CDF draws.
pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let (cdf, last) = cumulative_distribution(weights);
    (0..count)
        .map(|_| {
            let u = rng.random::<f64>();
            cdf.partition_point(|&c| c <= u).min(last)
        })
        .collect()
}

/// Residual resampling: floor(count·w̃) deterministic copies, remainder drawn systematically from the
/// fractional residuals.
pub fn residual_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(count);
    let mut residuals = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * count as f64;
        let copies = scaled.floor();
        indices.extend(std::iter::repeat_n(i, copies as usize));
        residuals.push(scaled - copies);
    }
    indices.truncate(count);
    let remaining = count - indices.len();
    if remaining > 0 {
        let residual_total: f64 = residuals.iter().sum();
        let source = if residual_total > 0.0 { &residuals[..] } else { weights };
        indices.extend(systematic_resample(source, remaining, rng));
    }
    indices
}

/// Independent zero-mean Gaussian perturbations of (x, y, θ).
#[derive(Clone, Copy, Debug)]
struct PoseNoise {
    x: Normal<f64>,
    y: Normal<f64>,
    theta: Normal<f64>,
}
impl PoseNoise {
    fn new(name: &str, std: &Vector3<f64>) -> Result<Self> {
        check_non_negative(name, std.as_slice())?;
        let normal = |s: f64| {
            Normal::new(0.0, s).map_err(|e| FilterError::InvalidConfig(format!("{name}: {e}")))
        };
        Ok(PoseNoise {
            x: normal(std[0])?,
            y: normal(std[1])?,
            theta: normal(std[2])?,
        })
    }
    fn perturb<R: Rng + ?Sized>(&self, pose: &mut Pose2D, rng: &mut R) {
        pose.x += self.x.sample(rng);
        pose.y += self.y.sample(rng);
        pose.theta += self.theta.sample(rng);
    }
}

/// Monte Carlo localization filter over a map of point landmarks.
///
/// Each cycle the caller runs [`predict`](Self::predict), [`update_weights`](Self::update_weights),
/// and [`resample`](Self::resample) in that order, after a single call to
/// [`initialize`](Self::initialize).
///
/// ```
/// use landmark_pf::{ControlInput, FilterConfig, LandmarkObservation, Map, MapLandmark, ParticleFilter, Pose2D};
/// use nalgebra::{Vector2, Vector3};
///
/// let map: Map = vec![MapLandmark::new(1, 10.0, 0.0), MapLandmark::new(2, 0.0, 10.0)]
///     .into_iter()
///     .collect();
/// let mut pf = ParticleFilter::new(FilterConfig::default()).unwrap();
/// pf.initialize(Pose2D::new(0.0, 0.0, 0.0), &Vector3::new(0.3, 0.3, 0.01)).unwrap();
///
/// pf.predict(0.1, &Vector3::new(0.3, 0.3, 0.01), ControlInput::new(1.0, 0.0)).unwrap();
/// let observations = vec![LandmarkObservation::new(9.9, 0.0)];
/// pf.update_weights(50.0, &Vector2::new(0.3, 0.3), &observations, &map).unwrap();
/// pf.resample().unwrap();
///
/// let estimate = pf.estimate().unwrap();
/// assert!((estimate.x - 0.1).abs() < 1.0);
/// ```
#[derive(Clone)]
pub struct ParticleFilter {
    config: FilterConfig,
    particles: Vec<Particle>,
    rng: StdRng,
    is_initialized: bool,
}
impl Debug for ParticleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleFilter")
            .field("initialized", &self.is_initialized)
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("estimate", &self.estimate().ok())
            .finish()
    }
}
impl ParticleFilter {
    /// Create an uninitialized filter whose generator is seeded from `config.seed`.
    pub fn new(config: FilterConfig) -> Result<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(config, rng)
    }
    /// Create an uninitialized filter that draws from the supplied generator.
    ///
    /// `config.seed` is ignored.
    pub fn with_rng(config: FilterConfig, rng: StdRng) -> Result<Self> {
        config.validate()?;
        Ok(ParticleFilter {
            particles: Vec::with_capacity(config.num_particles),
            config,
            rng,
            is_initialized: false,
        })
    }
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }
    /// Snapshot of the current particle weights, in population order.
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized {
            Ok(())
        } else {
            Err(FilterError::NotInitialized)
        }
    }

    /// Seed the population around a prior pose estimate.
    ///
    /// Each of the `num_particles` poses is drawn independently from a Gaussian centred on `initial` with
    /// per-axis standard deviations `std_pos = [σx, σy, σθ]`. All weights start at 1. Calling this again
    /// discards the previous population, weights, and associations.
    pub fn initialize(&mut self, initial: Pose2D, std_pos: &Vector3<f64>) -> Result<()> {
        let noise = PoseNoise::new("std_pos", std_pos)?;
        let n = self.config.num_particles;
        let mut particles = Vec::with_capacity(n);
        for id in 0..n {
            let mut pose = initial;
            noise.perturb(&mut pose, &mut self.rng);
            particles.push(Particle::new(id, pose, 1.0));
        }
        if self.is_initialized {
            info!("Re-initializing particle filter, discarding previous population");
        }
        info!("Initialized {} particles around {}", n, initial);
        self.particles = particles;
        self.is_initialized = true;
        Ok(())
    }

    /// Propagate every particle through the motion model and add process noise.
    ///
    /// # Arguments
    /// * `dt` - Elapsed time since the previous cycle (s)
    /// * `std_pos` - Process noise standard deviations `[σx, σy, σθ]`
    /// * `control` - Velocity and yaw rate held over `dt`
    pub fn predict(
        &mut self,
        dt: f64,
        std_pos: &Vector3<f64>,
        control: ControlInput,
    ) -> Result<()> {
        self.ensure_initialized()?;
        check_non_negative("dt", &[dt])?;
        let noise = PoseNoise::new("std_pos", std_pos)?;
        // Sub-seeds are drawn in population order so the parallel pass stays reproducible.
        let seeds: Vec<u64> = (0..self.particles.len())
            .map(|_| self.rng.random::<u64>())
            .collect();
        self.particles
            .par_iter_mut()
            .zip(seeds)
            .for_each(|(particle, seed)| {
                let mut rng = StdRng::seed_from_u64(seed);
                forward(&mut particle.pose, control, dt);
                noise.perturb(&mut particle.pose, &mut rng);
            });
        trace!("Predicted {} particles over {dt} s with {control:?}", self.particles.len());
        Ok(())
    }

    /// Reweight every particle by the likelihood of `observations` given its pose.
    ///
    /// For each particle the vehicle-frame observations are moved into the map frame, associated with
    /// the nearest landmark within `sensor_range` of the particle, and scored with a bivariate Gaussian
    /// of standard deviations `std_landmark = [σx, σy]`. The new weight is the product of the scores of
    /// the matched observations. Observations with no landmark in range contribute nothing, so a particle
    /// with no matches keeps weight 1.
    ///
    /// The products are formed in log space. When the most likely particle's product is not a normal
    /// `f64` (long observation lists with small `std_landmark` underflow, very small `std_landmark` can
    /// overflow), every log-weight is shifted by the population maximum before exponentiating. The
    /// weights then remain relative likelihoods with the best particle at weight 1.
    ///
    /// Returns [`FilterError::Divergence`] if no particle has a finite log-weight, which happens only for
    /// non-finite or astronomically distant observations. The zero weights are kept so the caller can
    /// inspect them before deciding to re-initialize.
    pub fn update_weights(
        &mut self,
        sensor_range: f64,
        std_landmark: &Vector2<f64>,
        observations: &[LandmarkObservation],
        map: &Map,
    ) -> Result<()> {
        self.ensure_initialized()?;
        check_non_negative("sensor_range", &[sensor_range])?;
        check_positive("std_landmark", std_landmark.as_slice())?;

        let (log_weights, unmatched): (Vec<f64>, Vec<usize>) = self
            .particles
            .par_iter_mut()
            .map(|particle| weigh_particle(particle, sensor_range, std_landmark, observations, map))
            .unzip();
        let unmatched: usize = unmatched.iter().sum();
        if unmatched > 0 {
            warn!(
                "{unmatched} observation(s) across {} particles had no landmark within {sensor_range} m",
                self.particles.len()
            );
        }

        let max_log_weight = log_weights
            .iter()
            .copied()
            .filter(|lw| lw.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        let offset = log_weight_offset(max_log_weight, log_weights.len());
        for (particle, lw) in self.particles.iter_mut().zip(log_weights) {
            particle.weight = if lw.is_finite() { (lw - offset).exp() } else { 0.0 };
        }
        if offset != 0.0 {
            debug!("Rescaled weights by exp({offset:.1}) to keep them representable");
        }

        let weights = self.weights();
        if let Err(err) = check_total_weight(&weights) {
            warn!("Weighting pass left no particle with positive weight: {err}");
            return Err(err);
        }
        debug!(
            "Weighted {} particles against {} observations: N_eff = {:.1}, max log-weight = {:.4}",
            self.particles.len(),
            observations.len(),
            self.effective_sample_size(),
            max_log_weight
        );
        Ok(())
    }

    /// Replace the population with `num_particles` draws proportional to the current weights.
    ///
    /// Returns [`FilterError::Divergence`] without touching the population when every weight is zero.
    pub fn resample(&mut self) -> Result<()> {
        self.ensure_initialized()?;
        let strategy = self.config.resampling_strategy;
        let resampled = strategy.resample(&self.particles, &mut self.rng)?;
        debug!(
            "Resampled {} particles ({:?}, N_eff before = {:.1})",
            resampled.len(),
            strategy,
            self.effective_sample_size()
        );
        self.particles = resampled;
        Ok(())
    }

    /// Overwrite the particle weights, in population order.
    pub fn set_weights(&mut self, weights: &[f64]) -> Result<()> {
        self.ensure_initialized()?;
        if weights.len() != self.particles.len() {
            return Err(FilterError::InvalidConfig(format!(
                "expected {} weights, got {}",
                self.particles.len(),
                weights.len()
            )));
        }
        check_non_negative("weights", weights)?;
        for (particle, &w) in self.particles.iter_mut().zip(weights.iter()) {
            particle.weight = w;
        }
        Ok(())
    }

    /// Scale the weights to sum to one.
    pub fn normalize_weights(&mut self) -> Result<()> {
        let total = check_total_weight(&self.weights())?;
        for particle in &mut self.particles {
            particle.weight /= total;
        }
        Ok(())
    }

    /// Effective number of particles, 1 / Σ w̃², computed over normalized weights.
    ///
    /// Returns 0 when the weights sum to zero.
    pub fn effective_sample_size(&self) -> f64 {
        let total: f64 = self.particles.iter().map(|p| p.weight).sum();
        if !(total > 0.0 && total.is_finite()) {
            return 0.0;
        }
        let sum_of_squares: f64 = self
            .particles
            .iter()
            .map(|p| (p.weight / total).powi(2))
            .sum();
        1.0 / sum_of_squares
    }

    /// The particle with the largest weight (the first one on ties).
    pub fn best_particle(&self) -> Option<&Particle> {
        self.particles
            .iter()
            .reduce(|best, p| if p.weight > best.weight { p } else { best })
    }

    /// Collapse the population into a single pose using the configured averaging strategy.
    ///
    /// Headings are averaged on the unit circle and the result is wrapped to [-π, π).
    pub fn estimate(&self) -> Result<Pose2D> {
        self.ensure_initialized()?;
        match self.config.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => {
                let weights = self.weights();
                check_total_weight(&weights)?;
                Ok(mean_pose(&self.particles, &weights))
            }
            ParticleAveragingStrategy::UnweightedAverage => {
                Ok(mean_pose(&self.particles, &vec![1.0; self.particles.len()]))
            }
            ParticleAveragingStrategy::HighestWeight => self
                .best_particle()
                .map(|p| p.pose)
                .ok_or(FilterError::NotInitialized),
        }
    }

    /// Spread of the population about [`estimate`](Self::estimate) as a 3×3 (x, y, θ) covariance.
    ///
    /// Weighted for `WeightedAverage`, uniform for `UnweightedAverage`, and zero for `HighestWeight`.
    pub fn covariance(&self) -> Result<Matrix3<f64>> {
        let mean = self.estimate()?;
        let weights = match self.config.averaging_strategy {
            ParticleAveragingStrategy::WeightedAverage => self.weights(),
            ParticleAveragingStrategy::UnweightedAverage => vec![1.0; self.particles.len()],
            ParticleAveragingStrategy::HighestWeight => return Ok(Matrix3::zeros()),
        };
        let total: f64 = weights.iter().sum();
        let mut cov = Matrix3::<f64>::zeros();
        for (particle, w) in self.particles.iter().zip(weights.iter()) {
            let diff = Vector3::new(
                particle.pose.x - mean.x,
                particle.pose.y - mean.y,
                wrap_to_pi(particle.pose.theta - mean.theta),
            );
            cov += (w / total) * diff * diff.transpose();
        }
        Ok(cov)
    }
}

/// Log-space offset applied before exponentiating.
///
/// Zero while the best product is a normal `f64` and `count` such weights still sum to a finite total,
/// so stored weights are the plain product. Otherwise the population maximum, which puts the best
/// particle at weight 1. With no finite log-weight the offset is irrelevant and zero is returned.
fn log_weight_offset(max_log_weight: f64, count: usize) -> f64 {
    let representable = f64::MIN_POSITIVE.ln()..=f64::MAX.ln() - (count.max(1) as f64).ln();
    if !max_log_weight.is_finite() || representable.contains(&max_log_weight) {
        0.0
    } else {
        max_log_weight
    }
}

/// Associate and score one particle, recording its associations.
///
/// Returns the log of the likelihood product and the number of observations left unmatched. The weight
/// itself is written by the caller once the whole population has been scored.
fn weigh_particle(
    particle: &mut Particle,
    sensor_range: f64,
    std_landmark: &Vector2<f64>,
    observations: &[LandmarkObservation],
    map: &Map,
) -> (f64, usize) {
    let mut in_map_frame = transform_to_map_frame(observations, &particle.pose);
    let candidates = map.landmarks_in_range(particle.pose.x, particle.pose.y, sensor_range);
    let matches = associate(&candidates, &mut in_map_frame);

    let mut log_weight = 0.0;
    let mut unmatched = 0;
    particle.associations.clear();
    for (obs, matched) in in_map_frame.iter().zip(matches) {
        match matched {
            Some(i) => {
                let landmark = &candidates[i];
                log_weight += log_multivariate_gaussian_probability(obs, landmark, std_landmark);
                particle.associations.push(Association {
                    landmark_id: landmark.id,
                    sense_x: obs.x,
                    sense_y: obs.y,
                });
            }
            None => unmatched += 1,
        }
    }
    (log_weight, unmatched)
}

/// Weighted mean pose with a circular mean for the heading. `weights` must have a positive total.
fn mean_pose(particles: &[Particle], weights: &[f64]) -> Pose2D {
    let total: f64 = weights.iter().sum();
    let (mut x, mut y, mut sin, mut cos) = (0.0, 0.0, 0.0, 0.0);
    for (particle, w) in particles.iter().zip(weights.iter()) {
        let w = w / total;
        x += w * particle.pose.x;
        y += w * particle.pose.y;
        sin += w * particle.pose.theta.sin();
        cos += w * particle.pose.theta.cos();
    }
    Pose2D::new(x, y, wrap_to_pi(sin.atan2(cos)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::MapLandmark;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    const ALL_STRATEGIES: [ParticleResamplingStrategy; 4] = [
        ParticleResamplingStrategy::Systematic,
        ParticleResamplingStrategy::Stratified,
        ParticleResamplingStrategy::Multinomial,
        ParticleResamplingStrategy::Residual,
    ];

    fn filter_with(num_particles: usize, strategy: ParticleResamplingStrategy) -> ParticleFilter {
        ParticleFilter::new(FilterConfig {
            num_particles,
            resampling_strategy: strategy,
            ..FilterConfig::default()
        })
        .unwrap()
    }

    fn zero_noise() -> Vector3<f64> {
        Vector3::zeros()
    }

    #[test]
    fn new_rejects_empty_population() {
        let result = ParticleFilter::new(FilterConfig {
            num_particles: 0,
            ..FilterConfig::default()
        });
        assert!(matches!(result, Err(FilterError::InvalidConfig(_))));
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut pf = filter_with(10, ParticleResamplingStrategy::Systematic);
        assert!(!pf.is_initialized());
        assert_eq!(
            pf.predict(0.1, &zero_noise(), ControlInput::new(1.0, 0.0)),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(
            pf.update_weights(10.0, &Vector2::new(0.3, 0.3), &[], &Map::default()),
            Err(FilterError::NotInitialized)
        );
        assert_eq!(pf.resample(), Err(FilterError::NotInitialized));
        assert_eq!(pf.estimate(), Err(FilterError::NotInitialized));
        assert_eq!(pf.covariance(), Err(FilterError::NotInitialized));
        assert_eq!(pf.set_weights(&[1.0; 10]), Err(FilterError::NotInitialized));
        for strategy in [
            ParticleAveragingStrategy::UnweightedAverage,
            ParticleAveragingStrategy::HighestWeight,
        ] {
            pf.config.averaging_strategy = strategy;
            assert_eq!(pf.estimate(), Err(FilterError::NotInitialized));
        }
    }

    #[test]
    fn initialize_populates_with_unit_weights() {
        let mut pf = filter_with(250, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(4.0, -2.0, 0.5), &Vector3::new(1.0, 1.0, 0.1))
            .unwrap();
        assert!(pf.is_initialized());
        assert_eq!(pf.num_particles(), 250);
        for (i, p) in pf.particles().iter().enumerate() {
            assert_eq!(p.id, i);
            assert_eq!(p.weight, 1.0);
            assert!(p.associations.is_empty());
        }
    }

    #[test]
    fn initialize_mean_converges_to_prior() {
        let mut pf = filter_with(20_000, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(6.0, 1.5, -0.7), &Vector3::new(0.2, 0.2, 0.02))
            .unwrap();
        let n = pf.num_particles() as f64;
        let mean_x = pf.particles().iter().map(|p| p.pose.x).sum::<f64>() / n;
        let mean_y = pf.particles().iter().map(|p| p.pose.y).sum::<f64>() / n;
        let mean_theta = pf.particles().iter().map(|p| p.pose.theta).sum::<f64>() / n;
        assert_approx_eq!(mean_x, 6.0, 0.01);
        assert_approx_eq!(mean_y, 1.5, 0.01);
        assert_approx_eq!(mean_theta, -0.7, 0.001);
    }

    #[test]
    fn initialize_rejects_negative_std() {
        let mut pf = filter_with(5, ParticleResamplingStrategy::Systematic);
        let result = pf.initialize(Pose2D::default(), &Vector3::new(0.3, -0.3, 0.01));
        assert!(matches!(result, Err(FilterError::InvalidConfig(_))));
        assert!(!pf.is_initialized());
    }

    #[test]
    fn reinitialize_discards_previous_state() {
        let mut pf = filter_with(5, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(0.0, 0.0, 0.0), &zero_noise()).unwrap();
        pf.set_weights(&[0.1, 0.2, 0.3, 0.4, 0.5]).unwrap();
        pf.initialize(Pose2D::new(9.0, 9.0, 1.0), &zero_noise()).unwrap();
        assert_eq!(pf.num_particles(), 5);
        for p in pf.particles() {
            assert_eq!(p.pose, Pose2D::new(9.0, 9.0, 1.0));
            assert_eq!(p.weight, 1.0);
        }
    }

    #[test]
    fn predict_without_noise_is_exact() {
        let mut pf = filter_with(8, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(0.0, 0.0, 0.0), &zero_noise()).unwrap();
        pf.predict(1.0, &zero_noise(), ControlInput::new(1.0, 0.0)).unwrap();
        for p in pf.particles() {
            assert_eq!(p.pose, Pose2D::new(1.0, 0.0, 0.0));
        }
    }

    #[test]
    fn predict_curved_without_noise() {
        let mut pf = filter_with(4, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(0.0, 0.0, 0.0), &zero_noise()).unwrap();
        pf.predict(1.0, &zero_noise(), ControlInput::new(1.0, FRAC_PI_2)).unwrap();
        let radius = 2.0 / PI;
        for p in pf.particles() {
            assert_approx_eq!(p.pose.x, radius, 1e-12);
            assert_approx_eq!(p.pose.y, radius, 1e-12);
            assert_approx_eq!(p.pose.theta, FRAC_PI_2, 1e-12);
        }
    }

    #[test]
    fn predict_is_reproducible_for_a_seed() {
        let run = || {
            let mut pf = filter_with(64, ParticleResamplingStrategy::Systematic);
            let std = Vector3::new(0.3, 0.3, 0.01);
            pf.initialize(Pose2D::new(1.0, 2.0, 0.3), &std).unwrap();
            pf.predict(0.1, &std, ControlInput::new(4.0, 0.2)).unwrap();
            pf.predict(0.1, &std, ControlInput::new(4.0, -0.1)).unwrap();
            pf.particles().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn predict_spreads_particles() {
        let mut pf = filter_with(500, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        pf.predict(1.0, &Vector3::new(0.5, 0.5, 0.05), ControlInput::new(2.0, 0.0))
            .unwrap();
        let cov = {
            let mut pf = pf.clone();
            pf.config.averaging_strategy = ParticleAveragingStrategy::UnweightedAverage;
            pf.covariance().unwrap()
        };
        assert_approx_eq!(cov[(0, 0)], 0.25, 0.06);
        assert_approx_eq!(cov[(1, 1)], 0.25, 0.06);
        assert_approx_eq!(cov[(2, 2)], 0.0025, 0.001);
    }

    #[test]
    fn predict_rejects_bad_inputs() {
        let mut pf = filter_with(3, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        let before = pf.particles().to_vec();
        assert!(pf.predict(-0.1, &zero_noise(), ControlInput::new(1.0, 0.0)).is_err());
        assert!(
            pf.predict(0.1, &Vector3::new(f64::NAN, 0.0, 0.0), ControlInput::new(1.0, 0.0))
                .is_err()
        );
        assert_eq!(pf.particles(), &before[..]);
    }

    #[test]
    fn update_scores_perfect_match() {
        let map = Map::new(vec![MapLandmark::new(1, 5.0, 0.0), MapLandmark::new(2, 0.0, 5.0)]);
        let mut pf = filter_with(3, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::new(0.0, 0.0, FRAC_PI_2), &zero_noise()).unwrap();
        // Landmark 2 straight ahead, landmark 1 to the right
        let obs = vec![
            LandmarkObservation::new(5.0, 0.0),
            LandmarkObservation::new(0.0, -5.0),
        ];
        pf.update_weights(10.0, &Vector2::new(1.0, 1.0), &obs, &map).unwrap();
        for p in pf.particles() {
            assert_approx_eq!(p.weight, 1.0 / (4.0 * PI * PI), 1e-12);
            assert_eq!(p.associations_string(), "2 1");
            assert_eq!(p.associations[0].landmark_id, 2);
            assert_approx_eq!(p.associations[0].sense_x, 0.0, 1e-12);
            assert_approx_eq!(p.associations[0].sense_y, 5.0, 1e-12);
            assert_approx_eq!(p.associations[1].sense_x, 5.0, 1e-12);
        }
    }

    #[test]
    fn update_prefers_closer_pose() {
        let map = Map::new(vec![MapLandmark::new(1, 10.0, 0.0)]);
        let mut pf = filter_with(2, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        pf.particles[1].pose.x = 0.5;
        let obs = vec![LandmarkObservation::new(10.0, 0.0)];
        pf.update_weights(20.0, &Vector2::new(0.3, 0.3), &obs, &map).unwrap();
        let weights = pf.weights();
        assert!(weights[0] > weights[1]);
        assert_eq!(pf.best_particle().unwrap().id, 0);
    }

    #[test]
    fn update_without_landmarks_in_range_keeps_unit_weight() {
        let map = Map::new(vec![MapLandmark::new(1, 100.0, 100.0)]);
        let mut pf = filter_with(4, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        let obs = vec![LandmarkObservation::new(1.0, 1.0)];
        pf.update_weights(10.0, &Vector2::new(0.3, 0.3), &obs, &map).unwrap();
        for p in pf.particles() {
            assert_eq!(p.weight, 1.0);
            assert!(p.associations.is_empty());
            assert_eq!(p.sense_x_string(), "");
        }
    }

    #[test]
    fn update_survives_underflow_of_every_particle() {
        // 40 landmarks on a 10 m grid, every one in range of both particles
        let map: Map = (0..40)
            .map(|k| MapLandmark::new(k + 1, (k % 8) as f64 * 10.0, (k / 8) as f64 * 10.0))
            .collect();
        let truth = Pose2D::default();
        let observations: Vec<LandmarkObservation> = map
            .landmarks()
            .iter()
            .map(|lm| LandmarkObservation::new(lm.x, lm.y))
            .collect();
        let mut pf = filter_with(2, ParticleResamplingStrategy::Systematic);
        pf.initialize(truth, &zero_noise()).unwrap();
        pf.particles[0].pose.x = 0.8;
        pf.particles[1].pose.x = 0.6;

        // Log-weights are about -4954 at x = 0.8 and -2714 at x = 0.6
        pf.update_weights(100.0, &Vector2::new(0.05, 0.05), &observations, &map)
            .unwrap();
        let weights = pf.weights();
        // Both linear products are far below f64::MIN_POSITIVE, the ranking must survive
        assert_eq!(weights[1], 1.0);
        assert!(weights[0] < weights[1]);
        assert!(weights.iter().all(|w| w.is_finite() && *w >= 0.0));
        assert_eq!(pf.best_particle().unwrap().id, 1);

        for strategy in ALL_STRATEGIES {
            let mut pf = pf.clone();
            pf.config.resampling_strategy = strategy;
            pf.resample().unwrap();
            assert!(pf.particles().iter().all(|p| p.pose.x == 0.6), "{strategy:?}");
        }
    }

    #[test]
    fn update_survives_overflow_of_every_particle() {
        // Each perfect match contributes -ln(2π·1e-8) ≈ 16.6 to the log-weight
        let map: Map = (0..60)
            .map(|k| MapLandmark::new(k + 1, k as f64 * 0.5, 1.0))
            .collect();
        let observations: Vec<LandmarkObservation> = map
            .landmarks()
            .iter()
            .map(|lm| LandmarkObservation::new(lm.x, lm.y))
            .collect();
        let mut pf = filter_with(3, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        pf.update_weights(100.0, &Vector2::new(1e-4, 1e-4), &observations, &map)
            .unwrap();
        for p in pf.particles() {
            assert_eq!(p.weight, 1.0);
            assert_eq!(p.associations.len(), 60);
        }
    }

    #[test]
    fn log_weight_offset_only_shifts_unrepresentable_products() {
        assert_eq!(log_weight_offset(-700.0, 100), 0.0);
        assert_eq!(log_weight_offset(700.0, 100), 0.0);
        assert_eq!(log_weight_offset(-2617.2, 2), -2617.2);
        assert_eq!(log_weight_offset(1000.0, 2), 1000.0);
        // A single weight near f64::MAX is fine, a thousand of them would overflow the total
        assert_eq!(log_weight_offset(709.0, 1), 0.0);
        assert_eq!(log_weight_offset(709.0, 1000), 709.0);
        assert_eq!(log_weight_offset(f64::NEG_INFINITY, 10), 0.0);
    }

    #[test]
    fn update_reports_divergence() {
        let map = Map::new(vec![MapLandmark::new(1, 0.0, 0.0)]);
        let mut pf = filter_with(3, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        // Squared offset overflows, so no particle has a finite log-weight
        let obs = vec![LandmarkObservation::new(1e200, 0.0)];
        let result = pf.update_weights(100.0, &Vector2::new(0.01, 0.01), &obs, &map);
        assert!(matches!(result, Err(FilterError::Divergence { num_particles: 3, .. })));
        assert!(pf.weights().iter().all(|&w| w == 0.0));
        assert!(matches!(pf.resample(), Err(FilterError::Divergence { .. })));
    }

    #[test]
    fn update_rejects_zero_landmark_std() {
        let mut pf = filter_with(2, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        let result = pf.update_weights(10.0, &Vector2::new(0.3, 0.0), &[], &Map::default());
        assert!(matches!(result, Err(FilterError::InvalidConfig(_))));
    }

    #[test]
    fn resample_single_survivor_for_every_strategy() {
        for strategy in ALL_STRATEGIES {
            let mut pf = filter_with(3, strategy);
            for _ in 0..200 {
                pf.initialize(Pose2D::default(), &Vector3::new(1.0, 1.0, 0.1)).unwrap();
                let survivor = pf.particles()[1].pose;
                pf.set_weights(&[0.0, 1.0, 0.0]).unwrap();
                pf.resample().unwrap();
                assert!(
                    pf.particles().iter().all(|p| p.pose == survivor),
                    "{strategy:?} selected a zero-weight particle"
                );
            }
        }
    }

    #[test]
    fn resample_uniform_weights_is_uniform() {
        let n = 10;
        let trials = 5_000;
        let mut rng = StdRng::seed_from_u64(11);
        let weights = vec![1.0; n];
        let resamplers: [fn(&[f64], usize, &mut StdRng) -> Vec<usize>; 4] = [
            systematic_resample,
            stratified_resample,
            multinomial_resample,
            residual_resample,
        ];
        for resample in resamplers {
            let mut counts = vec![0usize; n];
            for _ in 0..trials {
                for i in resample(&weights, n, &mut rng) {
                    counts[i] += 1;
                }
            }
            let expected = trials as f64;
            for &c in &counts {
                assert!(((c as f64 - expected) / expected).abs() < 0.05, "{counts:?}");
            }
        }
    }

    #[test]
    fn resample_follows_weights() {
        let weights = [1.0, 3.0, 0.0, 6.0];
        let mut rng = StdRng::seed_from_u64(3);
        let draws = 40_000;
        let mut counts = [0usize; 4];
        for i in multinomial_resample(&weights, draws, &mut rng) {
            counts[i] += 1;
        }
        assert_eq!(counts[2], 0);
        assert_approx_eq!(counts[0] as f64 / draws as f64, 0.1, 0.01);
        assert_approx_eq!(counts[1] as f64 / draws as f64, 0.3, 0.01);
        assert_approx_eq!(counts[3] as f64 / draws as f64, 0.6, 0.01);

        let systematic = systematic_resample(&weights, 10, &mut rng);
        assert_eq!(systematic.iter().filter(|&&i| i == 3).count(), 6);
        assert_eq!(systematic.iter().filter(|&&i| i == 1).count(), 3);
    }

    #[test]
    fn residual_copies_integer_parts() {
        let mut rng = StdRng::seed_from_u64(5);
        let indices = residual_resample(&[0.5, 0.25, 0.25, 0.0], 4, &mut rng);
        assert_eq!(indices, vec![0, 0, 1, 2]);
    }

    #[test]
    fn resample_resets_ids_and_weights() {
        let mut pf = filter_with(6, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &Vector3::new(1.0, 1.0, 0.1)).unwrap();
        pf.set_weights(&[0.0, 2.0, 0.0, 5.0, 0.0, 1.0]).unwrap();
        pf.resample().unwrap();
        assert_eq!(pf.num_particles(), 6);
        for (i, p) in pf.particles().iter().enumerate() {
            assert_eq!(p.id, i);
            assert_eq!(p.weight, 1.0);
        }
    }

    #[test]
    fn resample_all_zero_weights_is_divergence() {
        for strategy in ALL_STRATEGIES {
            let mut pf = filter_with(4, strategy);
            pf.initialize(Pose2D::default(), &Vector3::new(1.0, 1.0, 0.1)).unwrap();
            pf.set_weights(&[0.0; 4]).unwrap();
            let before = pf.particles().to_vec();
            assert_eq!(
                pf.resample(),
                Err(FilterError::Divergence {
                    total_weight: 0.0,
                    num_particles: 4
                })
            );
            assert_eq!(pf.particles(), &before[..]);
        }
    }

    #[test]
    fn set_weights_validates_length() {
        let mut pf = filter_with(3, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        assert!(pf.set_weights(&[1.0, 1.0]).is_err());
        assert!(pf.set_weights(&[1.0, -1.0, 1.0]).is_err());
    }

    #[test]
    fn normalize_and_effective_sample_size() {
        let mut pf = filter_with(4, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        assert_approx_eq!(pf.effective_sample_size(), 4.0, 1e-12);
        pf.set_weights(&[2.0, 0.0, 0.0, 2.0]).unwrap();
        assert_approx_eq!(pf.effective_sample_size(), 2.0, 1e-12);
        pf.normalize_weights().unwrap();
        assert_approx_eq!(pf.weights().iter().sum::<f64>(), 1.0, 1e-12);
        pf.set_weights(&[0.0; 4]).unwrap();
        assert_eq!(pf.effective_sample_size(), 0.0);
        assert!(pf.normalize_weights().is_err());
    }

    #[test]
    fn weighted_estimate_and_circular_heading() {
        let mut pf = filter_with(2, ParticleResamplingStrategy::Systematic);
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        pf.particles[0].pose = Pose2D::new(0.0, 0.0, PI - 0.1);
        pf.particles[1].pose = Pose2D::new(4.0, 2.0, -PI + 0.1);
        pf.set_weights(&[1.0, 3.0]).unwrap();
        let est = pf.estimate().unwrap();
        assert_approx_eq!(est.x, 3.0, 1e-12);
        assert_approx_eq!(est.y, 1.5, 1e-12);
        // Both headings sit next to ±π, so the mean must too
        assert!(wrap_to_pi(est.theta - PI).abs() < 0.1);
    }

    #[test]
    fn averaging_strategies() {
        let mut pf = ParticleFilter::new(FilterConfig {
            num_particles: 3,
            averaging_strategy: ParticleAveragingStrategy::HighestWeight,
            ..FilterConfig::default()
        })
        .unwrap();
        pf.initialize(Pose2D::default(), &zero_noise()).unwrap();
        pf.particles[2].pose = Pose2D::new(7.0, 7.0, 0.5);
        pf.set_weights(&[0.1, 0.2, 0.7]).unwrap();
        assert_eq!(pf.estimate().unwrap(), Pose2D::new(7.0, 7.0, 0.5));
        assert_eq!(pf.covariance().unwrap(), Matrix3::zeros());

        pf.config.averaging_strategy = ParticleAveragingStrategy::UnweightedAverage;
        let est = pf.estimate().unwrap();
        assert_approx_eq!(est.x, 7.0 / 3.0, 1e-12);
        assert_approx_eq!(est.y, 7.0 / 3.0, 1e-12);
    }

    #[test]
    fn particle_display_and_strings() {
        let mut p = Particle::new(3, Pose2D::new(1.0, 2.0, 0.0), 0.5);
        p.associations = vec![
            Association {
                landmark_id: 4,
                sense_x: 1.5,
                sense_y: -2.0,
            },
            Association {
                landmark_id: 9,
                sense_x: 3.0,
                sense_y: 0.25,
            },
        ];
        assert_eq!(p.associations_string(), "4 9");
        assert_eq!(p.sense_x_string(), "1.5 3");
        assert_eq!(p.sense_y_string(), "-2 0.25");
        assert!(p.to_string().contains("weight"));
    }

    #[test]
    fn injected_rng_is_used() {
        let cfg = FilterConfig {
            num_particles: 16,
            seed: 1,
            ..FilterConfig::default()
        };
        let std = Vector3::new(1.0, 1.0, 0.1);
        let mut a = ParticleFilter::with_rng(cfg.clone(), StdRng::seed_from_u64(99)).unwrap();
        let mut b = ParticleFilter::with_rng(cfg.clone(), StdRng::seed_from_u64(99)).unwrap();
        let mut c = ParticleFilter::new(cfg).unwrap();
        a.initialize(Pose2D::default(), &std).unwrap();
        b.initialize(Pose2D::default(), &std).unwrap();
        c.initialize(Pose2D::default(), &std).unwrap();
        assert_eq!(a.particles(), b.particles());
        assert_ne!(a.particles(), c.particles());
    }
}
