//! Serializable configuration for the landmark particle filter.
//!
//! Noise magnitudes and the sensor range are passed per call because they describe the inputs of a
//! given cycle. Everything that stays fixed for the lifetime of a filter instance lives here and can be
//! read from or written to JSON, YAML, or TOML.
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{FilterError, Result};
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};

fn default_num_particles() -> usize {
    100
}
/// Default seed value for reproducible runs
fn default_seed() -> u64 {
    42
}

/// Lifetime configuration of a [`ParticleFilter`](crate::particle::ParticleFilter).
///
/// ## Example
///
/// ```
/// use landmark_pf::config::FilterConfig;
/// use landmark_pf::particle::ParticleResamplingStrategy;
///
/// let cfg = FilterConfig {
///     num_particles: 500,
///     resampling_strategy: ParticleResamplingStrategy::Stratified,
///     ..FilterConfig::default()
/// };
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Number of particles, constant for the lifetime of the filter.
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,

    /// Seed for the filter's random number generator.
    ///
    /// The same seed and the same inputs reproduce a run exactly. To draw from the operating system
    /// instead, build the filter with [`ParticleFilter::with_rng`](crate::particle::ParticleFilter::with_rng).
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub resampling_strategy: ParticleResamplingStrategy,

    /// How [`ParticleFilter::estimate`](crate::particle::ParticleFilter::estimate) collapses the
    /// population into a single pose.
    #[serde(default)]
    pub averaging_strategy: ParticleAveragingStrategy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_particles: default_num_particles(),
            seed: default_seed(),
            resampling_strategy: ParticleResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
        }
    }
}

impl FilterConfig {
    /// Check the values that cannot be corrected at the point of use.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(FilterError::InvalidConfig(
                "num_particles must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
    /// Save as pretty-printed JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.save(path.as_ref(), Format::Json)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::load(path.as_ref(), Format::Json)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.save(path.as_ref(), Format::Yaml)
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::load(path.as_ref(), Format::Yaml)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        self.save(path.as_ref(), Format::Toml)
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::load(path.as_ref(), Format::Toml)
    }
    /// Save in the format named by the file extension: `.json`, `.yaml`/`.yml`, or `.toml`.
    ///
    /// Any other extension fails with [`io::ErrorKind::InvalidInput`] before the file is created.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        self.save(path, Format::from_path(path)?)
    }
    /// Load a filter configuration, picking the parser from the file extension as in
    /// [`to_file`](Self::to_file). Fields missing from the file take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        Self::load(path, Format::from_path(path)?)
    }

    fn save(&self, path: &Path, format: Format) -> io::Result<()> {
        let text = match format {
            Format::Json => serde_json::to_string_pretty(self).map_err(io::Error::other)?,
            Format::Yaml => serde_yaml::to_string(self).map_err(io::Error::other)?,
            Format::Toml => toml::to_string(self).map_err(io::Error::other)?,
        };
        File::create(path)?.write_all(text.as_bytes())
    }
    fn load(path: &Path, format: Format) -> io::Result<Self> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        match format {
            Format::Json => serde_json::from_str(&text).map_err(io::Error::other),
            Format::Yaml => serde_yaml::from_str(&text).map_err(io::Error::other),
            Format::Toml => toml::from_str(&text).map_err(io::Error::other),
        }
    }
}

/// On-disk configuration formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
    Toml,
}
impl Format {
    fn from_path(path: &Path) -> io::Result<Format> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(Format::Json),
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            Some("toml") => Ok(Format::Toml),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported configuration file extension: {}", path.display()),
            )),
        }
    }
}
