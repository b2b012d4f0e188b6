//! Target energy curves over the course of a set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named shape of the energy curve across the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArcShape {
    /// Linear build from 0.3 to 0.9
    #[default]
    Progressive,
    /// Build to 0.9 at 70% of the set, then release to 0.4
    Peak,
    /// Drop to 0.3 at the midpoint, then climb back to 0.8
    Valley,
    /// Constant baseline
    Flat,
}

impl ArcShape {
    pub const ALL: [ArcShape; 4] = [
        ArcShape::Progressive,
        ArcShape::Peak,
        ArcShape::Valley,
        ArcShape::Flat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ArcShape::Progressive => "progressive",
            ArcShape::Peak => "peak",
            ArcShape::Valley => "valley",
            ArcShape::Flat => "flat",
        }
    }
}

impl fmt::Display for ArcShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ArcShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArcShape::ALL
            .into_iter()
            .find(|shape| shape.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown energy arc {s:?} (expected progressive, peak, valley or flat)")
            })
    }
}

pub const DEFAULT_FLAT_BASELINE: f64 = 0.6;
pub const PEAK_POSITION: f64 = 0.7;
pub const VALLEY_POSITION: f64 = 0.5;

fn lerp(from: f64, to: f64, t: f64) -> f64 {
    from + (to - from) * t
}

/// Maps a playlist position in [0, 1] to the energy the next track should have.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyArcPlanner {
    shape: ArcShape,
    flat_baseline: f64,
}

impl EnergyArcPlanner {
    pub fn new(shape: ArcShape) -> Self {
        Self {
            shape,
            flat_baseline: DEFAULT_FLAT_BASELINE,
        }
    }

    pub fn with_flat_baseline(mut self, baseline: f64) -> Self {
        self.flat_baseline = baseline.clamp(0.0, 1.0);
        self
    }

    /// Target energy at `position`. Positions outside [0, 1] are clamped.
    pub fn target(&self, position: f64) -> f64 {
        let p = if position.is_nan() {
            0.0
        } else {
            position.clamp(0.0, 1.0)
        };
        match self.shape {
            ArcShape::Progressive => lerp(0.3, 0.9, p),
            ArcShape::Peak => {
                if p <= PEAK_POSITION {
                    lerp(0.3, 0.9, p / PEAK_POSITION)
                } else {
                    lerp(0.9, 0.4, (p - PEAK_POSITION) / (1.0 - PEAK_POSITION))
                }
            }
            ArcShape::Valley => {
                if p <= VALLEY_POSITION {
                    lerp(0.8, 0.3, p / VALLEY_POSITION)
                } else {
                    lerp(0.3, 0.8, (p - VALLEY_POSITION) / (1.0 - VALLEY_POSITION))
                }
            }
            ArcShape::Flat => self.flat_baseline,
        }
    }
}
