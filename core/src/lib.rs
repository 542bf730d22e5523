//! Landmark-based Monte Carlo localization for planar vehicles
//!
//! This crate provides a sequential Monte Carlo ("particle filter") estimator for the two-dimensional pose
//! $(x, y, \theta)$ of a vehicle that reports noisy odometry (forward velocity and yaw rate) and noisy
//! observations of point landmarks whose map positions are known. The filter is a single-process,
//! single-cycle estimator: an external control loop owns the timing and feeds it one control input and one
//! batch of observations per cycle. Map loading, sensor I/O, and visualization are left to the caller.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the geometric types (points, isometries) and
//!   the small fixed-size vectors and matrices used for noise parameters and covariances.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provide
//!   the seeded random number generation used for initialization, process noise, and resampling.
//! - [`rayon`](https://crates.io/crates/rayon): Provides the data-parallel iteration over particles.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [config]: Contains the serializable filter configuration and its file I/O.
//! - [error]: Contains the error taxonomy returned by the filter.
//! - [measurements]: Contains landmark observations, the landmark map, the vehicle-to-map frame transform,
//!   nearest-neighbor data association, and the bivariate Gaussian measurement likelihood.
//! - [particle]: Contains the particle population, the resampling and averaging strategies, and the
//!   [`ParticleFilter`](particle::ParticleFilter) itself.
//!
//! ## Filter cycle
//!
//! Each cycle runs the same fixed sequence of steps over the particle population:
//!
//! 1. **Predict**: every particle is propagated through the motion model below and perturbed with
//!    zero-mean Gaussian process noise.
//! 2. **Update**: for every particle, the vehicle-frame observations are transformed into the map frame
//!    using that particle's pose, associated with the nearest in-range landmark, and scored with a
//!    bivariate Gaussian likelihood. The product of the per-observation likelihoods becomes the particle's
//!    weight.
//! 3. **Resample**: a new population of the same size is drawn with replacement in proportion to the
//!    weights.
//!
//! ## Motion model
//!
//! The vehicle is modelled as a unicycle with forward velocity $v$ and yaw rate $\omega$ held constant
//! over the time step $\Delta t$. For curved motion ($|\omega| \geq \epsilon$):
//!
//! $$
//! x' = x + \frac{v}{\omega} \left( \sin(\theta + \omega \Delta t) - \sin\theta \right)
//! $$
//!
//! $$
//! y' = y + \frac{v}{\omega} \left( \cos\theta - \cos(\theta + \omega \Delta t) \right)
//! $$
//!
//! $$
//! \theta' = \theta + \omega \Delta t
//! $$
//!
//! When $|\omega| < \epsilon$ (see [`STRAIGHT_LINE_YAW_RATE`]) the straight-line limit is used instead,
//! which avoids dividing by a vanishing yaw rate:
//!
//! $$
//! x' = x + v \Delta t \cos\theta, \quad y' = y + v \Delta t \sin\theta, \quad \theta' = \theta
//! $$
//!
//! Headings are treated as unbounded reals throughout; use [`wrap_to_pi`] where a bounded angle is needed.
pub mod config;
pub mod error;
pub mod measurements;
pub mod particle;

use nalgebra::{Isometry2, Vector2, Vector3};
use std::f64::consts::PI;
use std::fmt::{self, Debug, Display};

pub use config::FilterConfig;
pub use error::{FilterError, Result};
pub use measurements::{LandmarkId, LandmarkObservation, Map, MapLandmark};
pub use particle::{
    Association, Particle, ParticleAveragingStrategy, ParticleFilter, ParticleResamplingStrategy,
};

/// Yaw rates (rad/s) with a magnitude below this value are propagated with the straight-line model.
pub const STRAIGHT_LINE_YAW_RATE: f64 = 1e-5;

/// Planar vehicle pose in the map frame.
///
/// `x` and `y` are in meters, `theta` is the heading in radians measured counter-clockwise from the map
/// x-axis.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pose2D")
            .field("x", &format_args!("{:.4} m", self.x))
            .field("y", &format_args!("{:.4} m", self.y))
            .field("theta", &format_args!("{:.4} rad", self.theta))
            .finish()
    }
}
impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D { x, y, theta }
    }
    /// Rigid transform taking vehicle-frame coordinates to map-frame coordinates.
    pub fn isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    /// Euclidean distance from this position to the point `(x, y)`.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}
impl From<Vector3<f64>> for Pose2D {
    fn from(v: Vector3<f64>) -> Self {
        Pose2D::new(v[0], v[1], v[2])
    }
}
impl From<Pose2D> for Vector3<f64> {
    fn from(pose: Pose2D) -> Self {
        Vector3::new(pose.x, pose.y, pose.theta)
    }
}

/// Odometry reported by the vehicle for one cycle.
///
/// Both quantities are assumed constant over the time step they are applied to.
#[derive(Clone, Copy, Default, PartialEq)]
pub struct ControlInput {
    /// Forward velocity (m/s)
    pub velocity: f64,
    /// Yaw rate (rad/s), positive counter-clockwise
    pub yaw_rate: f64,
}
impl Debug for ControlInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlInput")
            .field("velocity", &format_args!("{:.4} m/s", self.velocity))
            .field("yaw_rate", &format_args!("{:.4} rad/s", self.yaw_rate))
            .finish()
    }
}
impl ControlInput {
    pub fn new(velocity: f64, yaw_rate: f64) -> Self {
        ControlInput { velocity, yaw_rate }
    }
}

/// Noise-free forward propagation of a pose through the unicycle motion model.
///
/// This is the deterministic part of the prediction step; process noise is added by the caller
/// (see [`ParticleFilter::predict`](particle::ParticleFilter::predict)).
///
/// # Arguments
/// * `pose` - The pose to propagate, updated in place
/// * `control` - Velocity and yaw rate held over the step
/// * `dt` - Time step (s)
pub fn forward(pose: &mut Pose2D, control: ControlInput, dt: f64) {
    let ControlInput { velocity, yaw_rate } = control;
    if yaw_rate.abs() < STRAIGHT_LINE_YAW_RATE {
        pose.x += velocity * dt * pose.theta.cos();
        pose.y += velocity * dt * pose.theta.sin();
    } else {
        let theta_next = pose.theta + yaw_rate * dt;
        let radius = velocity / yaw_rate;
        pose.x += radius * (theta_next.sin() - pose.theta.sin());
        pose.y += radius * (pose.theta.cos() - theta_next.cos());
        pose.theta = theta_next;
    }
}

/// Wrap an angle in radians to the interval [-π, π).
pub fn wrap_to_pi(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    // rem_euclid can round up to exactly 2π for tiny negative inputs
    if wrapped >= PI { wrapped - 2.0 * PI } else { wrapped }
}
