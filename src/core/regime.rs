#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::dynamics::Trajectory;

/// Discrete label for aggregate network activity.
///
/// Downstream explanation text is conditioned on these exact labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Regime {
    Unstable,
    SuppressedOrInhibited,
    Normal,
    HyperactiveOrExcited,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Unstable => "unstable",
            Regime::SuppressedOrInhibited => "suppressed_or_inhibited",
            Regime::Normal => "normal",
            Regime::HyperactiveOrExcited => "hyperactive_or_excited",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map mean rate and mean potential to a regime. First matching rule wins.
pub fn classify(mean_r: f64, mean_v: f64) -> Regime {
    if mean_r.is_nan() || mean_v.is_nan() {
        return Regime::Unstable;
    }
    if mean_r < 0.18 && mean_v < -3.5 {
        Regime::SuppressedOrInhibited
    } else if (0.18..=0.5).contains(&mean_r) && (-4.0..=-2.0).contains(&mean_v) {
        Regime::Normal
    } else if mean_r > 0.5 || mean_v > -2.0 {
        Regime::HyperactiveOrExcited
    } else {
        Regime::Normal
    }
}

/// Scalar and per-timestep reduction of a trajectory.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Summary {
    pub mean_r: f64,
    pub mean_v: f64,
    /// Mean rate across regions, one value per time sample.
    pub r_series: Vec<f64>,
    /// Mean potential across regions, one value per time sample.
    pub v_series: Vec<f64>,
    pub regime: Regime,
}

impl Summary {
    pub fn from_trajectory(traj: &Trajectory) -> Self {
        let mean_r = mean(traj.r());
        let mean_v = mean(traj.v());
        let r_series = per_timestep_mean(traj.r(), traj.regions(), traj.timesteps());
        let v_series = per_timestep_mean(traj.v(), traj.regions(), traj.timesteps());
        Self {
            mean_r,
            mean_v,
            r_series,
            v_series,
            regime: classify(mean_r, mean_v),
        }
    }
}

// Empty input yields NaN, which classifies as unstable.
fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn per_timestep_mean(data: &[f64], regions: usize, steps: usize) -> Vec<f64> {
    let mut out = vec![0.0; steps];
    for i in 0..regions {
        for (acc, x) in out.iter_mut().zip(&data[i * steps..(i + 1) * steps]) {
            *acc += x;
        }
    }
    for acc in &mut out {
        *acc /= regions as f64;
    }
    out
}
