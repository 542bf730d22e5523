//! Landmark observations, the landmark map, and the measurement model.
//!
//! Observations arrive in the vehicle frame (x forward, y left). Before they can be compared with the map
//! they are moved into the map frame using a hypothesized vehicle pose, matched to the nearest landmark
//! within sensor range, and scored with a bivariate Gaussian with diagonal covariance:
//!
//! $$
//! p(\Delta x, \Delta y) = \frac{1}{2 \pi \sigma_x \sigma_y} \exp\left( -\left( \frac{\Delta x^2}{2 \sigma_x^2} + \frac{\Delta y^2}{2 \sigma_y^2} \right) \right)
//! $$
//!
//! where $\Delta x$, $\Delta y$ are the differences between the transformed observation and the associated
//! landmark's map position.
//!
//! Observations carry no explicit frame tag. Which frame a [`LandmarkObservation`] is in is determined by
//! where it sits in the pipeline, so callers must not mix vehicle-frame and map-frame lists.
use nalgebra::{Point2, Vector2};
use std::f64::consts::PI;
use std::fmt::{self, Display};

use crate::Pose2D;

/// Identifier of a map landmark.
pub type LandmarkId = u32;

/// A sensed landmark position.
///
/// `id` is `None` until the observation has been associated with a map landmark.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LandmarkObservation {
    pub id: Option<LandmarkId>,
    pub x: f64,
    pub y: f64,
}
impl LandmarkObservation {
    /// A new, unassociated observation.
    pub fn new(x: f64, y: f64) -> Self {
        LandmarkObservation { id: None, x, y }
    }
    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}
impl Display for LandmarkObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "obs[{id}]({:.3}, {:.3})", self.x, self.y),
            None => write!(f, "obs[?]({:.3}, {:.3})", self.x, self.y),
        }
    }
}

/// A landmark with a fixed map-frame position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapLandmark {
    pub id: LandmarkId,
    pub x: f64,
    pub y: f64,
}
impl MapLandmark {
    pub fn new(id: LandmarkId, x: f64, y: f64) -> Self {
        MapLandmark { id, x, y }
    }
    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// Read-only collection of map landmarks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Map {
    landmarks: Vec<MapLandmark>,
}
impl Map {
    pub fn new(landmarks: Vec<MapLandmark>) -> Self {
        Map { landmarks }
    }
    pub fn landmarks(&self) -> &[MapLandmark] {
        &self.landmarks
    }
    pub fn len(&self) -> usize {
        self.landmarks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
    /// Landmarks whose Euclidean distance from `(x, y)` is at most `range`, in map order.
    pub fn landmarks_in_range(&self, x: f64, y: f64, range: f64) -> Vec<MapLandmark> {
        self.landmarks
            .iter()
            .filter(|lm| (lm.x - x).hypot(lm.y - y) <= range)
            .copied()
            .collect()
    }
}
impl FromIterator<MapLandmark> for Map {
    fn from_iter<I: IntoIterator<Item = MapLandmark>>(iter: I) -> Self {
        Map::new(iter.into_iter().collect())
    }
}

/// Transform vehicle-frame observations into the map frame using `pose` as the vehicle pose.
///
/// Each observation is rotated by the heading and translated by the position:
///
/// $$
/// x_m = x + x_v \cos\theta - y_v \sin\theta, \quad y_m = y + x_v \sin\theta + y_v \cos\theta
/// $$
///
/// Association ids are carried through unchanged.
pub fn transform_to_map_frame(
    observations: &[LandmarkObservation],
    pose: &Pose2D,
) -> Vec<LandmarkObservation> {
    let iso = pose.isometry();
    observations
        .iter()
        .map(|obs| {
            let p = iso * obs.point();
            LandmarkObservation { id: obs.id, x: p.x, y: p.y }
        })
        .collect()
}

/// Inverse of [`transform_to_map_frame`]: express map-frame observations relative to `pose`.
pub fn transform_to_vehicle_frame(
    observations: &[LandmarkObservation],
    pose: &Pose2D,
) -> Vec<LandmarkObservation> {
    let iso = pose.isometry();
    observations
        .iter()
        .map(|obs| {
            let p = iso.inverse_transform_point(&obs.point());
            LandmarkObservation { id: obs.id, x: p.x, y: p.y }
        })
        .collect()
}

/// Index of the candidate closest to `observation`, or `None` when there are no candidates.
///
/// Ties keep the first candidate encountered, so the result depends only on the candidate order.
pub fn nearest_landmark(
    candidates: &[MapLandmark],
    observation: &LandmarkObservation,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, lm) in candidates.iter().enumerate() {
        let d = (lm.x - observation.x).hypot(lm.y - observation.y);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}

/// Nearest-neighbor data association of map-frame observations with candidate landmarks.
///
/// Writes the matched landmark id into each observation and returns, per observation, the index of the
/// matched candidate. When `candidates` is empty every observation is left unmatched (`id == None`,
/// index `None`). Unmatched observations are not evidence against a pose: the weighting step leaves
/// them out of the likelihood product instead of treating them as zero-probability events, so a
/// particle with nothing in range keeps the neutral likelihood 1.
pub fn associate(
    candidates: &[MapLandmark],
    observations: &mut [LandmarkObservation],
) -> Vec<Option<usize>> {
    observations
        .iter_mut()
        .map(|obs| {
            let matched = nearest_landmark(candidates, obs);
            obs.id = matched.map(|i| candidates[i].id);
            matched
        })
        .collect()
}

/// Bivariate Gaussian density of an observation about its associated landmark.
///
/// The covariance is diagonal with standard deviations `std_landmark = [σx, σy]`, both of which must be
/// strictly positive.
pub fn multivariate_gaussian_probability(
    observation: &LandmarkObservation,
    landmark: &MapLandmark,
    std_landmark: &Vector2<f64>,
) -> f64 {
    log_multivariate_gaussian_probability(observation, landmark, std_landmark).exp()
}

/// Natural logarithm of [`multivariate_gaussian_probability`].
///
/// Stays finite where the density itself would underflow to zero.
pub fn log_multivariate_gaussian_probability(
    observation: &LandmarkObservation,
    landmark: &MapLandmark,
    std_landmark: &Vector2<f64>,
) -> f64 {
    let (sigma_x, sigma_y) = (std_landmark[0], std_landmark[1]);
    let dx = observation.x - landmark.x;
    let dy = observation.y - landmark.y;
    let exponent = dx * dx / (2.0 * sigma_x * sigma_x) + dy * dy / (2.0 * sigma_y * sigma_y);
    -(2.0 * PI * sigma_x * sigma_y).ln() - exponent
}
