// boreas_core/src/localize.rs
//
// Distance-based localization: a 1-D state grid giving each component a
// coordinate, and taper functions weighting observations by distance. The
// taper choice follows the standard Gaspari-Cohn compact-support polynomial
// (support ends at twice the radius); the alternatives are the boxcar and a
// truncated Gaussian.

use serde::Deserialize;

use crate::errors::ConfigError;

/// Coordinates for the state components, used to measure distances between
/// a grid point and the observation sites.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateGrid {
    pub len: usize,
    /// Wrap distances around the domain (ring topologies).
    #[serde(default)]
    pub periodic: bool,
}

impl StateGrid {
    pub fn line(len: usize) -> Self {
        StateGrid {
            len,
            periodic: false,
        }
    }

    pub fn ring(len: usize) -> Self {
        StateGrid {
            len,
            periodic: true,
        }
    }

    pub fn coord(&self, i: usize) -> f64 {
        i as f64
    }

    pub fn distance(&self, a: f64, b: f64) -> f64 {
        let d = (a - b).abs();
        if self.periodic {
            d.min(self.len as f64 - d)
        } else {
            d
        }
    }
}

/// Monotonically non-increasing weight functions with compact support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taper {
    /// Gaspari-Cohn 5th-order piecewise polynomial; support `[0, 2)` in
    /// units of the radius.
    GaspariCohn,
    /// Hard cutoff at one radius.
    Boxcar,
    /// Gaussian `exp(-z^2 / 2)` truncated to zero beyond two radii.
    Gauss,
}

impl Taper {
    /// Weight at distance `dist` for the given localization `radius`.
    pub fn weight(&self, dist: f64, radius: f64) -> f64 {
        debug_assert!(radius > 0.0);
        let z = dist / radius;
        match self {
            Taper::GaspariCohn => gaspari_cohn(z),
            Taper::Boxcar => {
                if z <= 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Taper::Gauss => {
                if z < 2.0 {
                    (-0.5 * z * z).exp()
                } else {
                    0.0
                }
            }
        }
    }
}

/// The Gaspari & Cohn (1999) correlation function, eq. 4.10.
fn gaspari_cohn(z: f64) -> f64 {
    if z < 1.0 {
        1.0 + z * z * (-5.0 / 3.0 + z * (5.0 / 8.0 + z * (0.5 - 0.25 * z)))
    } else if z < 2.0 {
        4.0 - 5.0 * z + z * z * (5.0 / 3.0 + z * (5.0 / 8.0 + z * (-0.5 + z / 12.0)))
            - 2.0 / (3.0 * z)
    } else {
        0.0
    }
}

/// Validated localization settings for the local filters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Localization {
    pub radius: f64,
    pub taper: Taper,
}

impl Localization {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radius <= 0.0 || !self.radius.is_finite() {
            return Err(ConfigError::hyper(
                "radius",
                format!("localization radius must be positive, got {}", self.radius),
            ));
        }
        Ok(())
    }

    /// Taper weights of every observation site as seen from `coord`.
    pub fn weights(&self, grid: &StateGrid, coord: f64, obs_sites: &[f64]) -> Vec<f64> {
        obs_sites
            .iter()
            .map(|&site| self.taper.weight(grid.distance(coord, site), self.radius))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gaspari_cohn_endpoints() {
        assert_relative_eq!(gaspari_cohn(0.0), 1.0);
        assert_relative_eq!(gaspari_cohn(2.0), 0.0);
        assert_relative_eq!(gaspari_cohn(5.0), 0.0);
        // Continuity at the interior knot.
        assert_relative_eq!(gaspari_cohn(1.0 - 1e-9), gaspari_cohn(1.0 + 1e-9), epsilon = 1e-6);
    }

    #[test]
    fn tapers_are_monotone_and_compact() {
        for taper in [Taper::GaspariCohn, Taper::Boxcar, Taper::Gauss] {
            let mut prev = taper.weight(0.0, 1.0);
            assert_relative_eq!(prev, 1.0);
            for i in 1..=50 {
                let w = taper.weight(i as f64 * 0.1, 1.0);
                assert!(w <= prev + 1e-12, "{taper:?} not monotone at {i}");
                assert!(w >= 0.0);
                prev = w;
            }
            // Zero beyond the cutoff.
            assert_eq!(taper.weight(2.5, 1.0), 0.0);
        }
    }

    #[test]
    fn periodic_distance_wraps() {
        let grid = StateGrid::ring(10);
        assert_relative_eq!(grid.distance(0.0, 9.0), 1.0);
        assert_relative_eq!(grid.distance(2.0, 7.0), 5.0);
        let line = StateGrid::line(10);
        assert_relative_eq!(line.distance(0.0, 9.0), 9.0);
    }

    #[test]
    fn invalid_radius_is_config_error() {
        let loc = Localization {
            radius: 0.0,
            taper: Taper::GaspariCohn,
        };
        assert!(loc.validate().is_err());
    }
}
