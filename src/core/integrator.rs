//! Adaptive Dormand–Prince RK4(5) integrator with dense output.
//!
//! The solver takes its own internal steps (error-controlled, capped by
//! `max_step`) and reports the solution on a caller-supplied grid by
//! evaluating the quartic continuous extension of each accepted step. This is
//! what lets a fixed `dt` time series come out of an adaptive method.

use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Right-hand side of `dy/dt = f(t, y)`.
pub trait OdeSystem {
    fn dimension(&self) -> usize;

    /// Write `f(t, y)` into `dydt`. Both slices have length `dimension()`.
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);
}

const N_STAGES: usize = 6;
const ERROR_ESTIMATOR_ORDER: f64 = 4.0;
const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

const C: [f64; N_STAGES] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0];

const A: [[f64; 5]; N_STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
];

const B: [f64; N_STAGES] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];

// Difference between the 5th and embedded 4th order weights; the 7th entry
// multiplies the FSAL stage f(t + h, y_new).
const E: [f64; N_STAGES + 1] = [
    -71.0 / 57600.0,
    0.0,
    71.0 / 16695.0,
    -71.0 / 1920.0,
    17253.0 / 339200.0,
    -22.0 / 525.0,
    1.0 / 40.0,
];

// Continuous extension: y(t_old + x h) = y_old + h * sum_k K_k * (P_k . [x, x^2, x^3, x^4]).
const P: [[f64; 4]; N_STAGES + 1] = [
    [
        1.0,
        -8048581381.0 / 2820520608.0,
        8663915743.0 / 2820520608.0,
        -12715105075.0 / 11282082432.0,
    ],
    [0.0, 0.0, 0.0, 0.0],
    [
        0.0,
        131558114200.0 / 32700410799.0,
        -68118460800.0 / 10900136933.0,
        87487479700.0 / 32700410799.0,
    ],
    [
        0.0,
        -1754552775.0 / 470086768.0,
        14199869525.0 / 1410260304.0,
        -10690763975.0 / 1880347072.0,
    ],
    [
        0.0,
        127303824393.0 / 49829197408.0,
        -318862633887.0 / 49829197408.0,
        701980252875.0 / 199316789632.0,
    ],
    [
        0.0,
        -282668133.0 / 205662961.0,
        2019193451.0 / 616988883.0,
        -1453857185.0 / 822651844.0,
    ],
    [
        0.0,
        40617522.0 / 29380423.0,
        -110615467.0 / 29380423.0,
        69997945.0 / 29380423.0,
    ],
];

/// Upper bounds on how much work one integration may do.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntegratorBudget {
    /// Maximum number of attempted steps (accepted + rejected).
    pub max_steps: u64,
    /// Optional wall-clock limit in milliseconds.
    pub wall_clock_ms: Option<u64>,
}

impl Default for IntegratorBudget {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            wall_clock_ms: None,
        }
    }
}

/// Tolerances and step limits for [`Rk45`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rk45 {
    pub rtol: f64,
    pub atol: f64,
    pub max_step: f64,
    pub budget: IntegratorBudget,
}

impl Default for Rk45 {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            max_step: f64::INFINITY,
            budget: IntegratorBudget::default(),
        }
    }
}

/// Solution sampled on the requested grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseSolution {
    pub t: Vec<f64>,
    /// One state vector per entry of `t`.
    pub y: Vec<Vec<f64>>,
    pub stats: SolverStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverStats {
    pub accepted_steps: u64,
    pub rejected_steps: u64,
    pub rhs_evals: u64,
}

impl Rk45 {
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_budget(mut self, budget: IntegratorBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Integrate from `t0` to `t_end`, sampling at every point of `t_eval`.
    ///
    /// `t_eval` must be non-decreasing and lie within `[t0, t_end]`.
    pub fn solve<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        t0: f64,
        t_end: f64,
        y0: &[f64],
        t_eval: &[f64],
    ) -> SimResult<DenseSolution> {
        let n = system.dimension();
        if y0.len() != n {
            return Err(SimError::DimensionMismatch {
                expected: n,
                actual: y0.len(),
            });
        }
        if !(t0.is_finite() && t_end.is_finite()) || t_end < t0 {
            return Err(SimError::InvalidParameter(format!(
                "integration interval [{t0}, {t_end}] is not valid"
            )));
        }
        if !(self.max_step > 0.0) {
            return Err(SimError::InvalidParameter(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        if t_eval.windows(2).any(|w| w[1] < w[0]) || t_eval.iter().any(|&t| t < t0 || t > t_end) {
            return Err(SimError::InvalidParameter(
                "evaluation grid must be sorted and inside the integration interval".to_string(),
            ));
        }
        if y0.iter().any(|v| !v.is_finite()) {
            return Err(SimError::IntegrationFailure {
                t: t0,
                reason: "initial state contains NaN or Inf".to_string(),
            });
        }

        let started = Instant::now();
        let deadline = self.budget.wall_clock_ms.map(Duration::from_millis);

        let mut stats = SolverStats::default();
        let mut out_t = Vec::with_capacity(t_eval.len());
        let mut out_y = Vec::with_capacity(t_eval.len());
        let mut next_eval = 0usize;

        let mut t = t0;
        let mut y = y0.to_vec();
        let mut f = vec![0.0; n];
        system.rhs(t, &y, &mut f);
        stats.rhs_evals += 1;
        if f.iter().any(|v| !v.is_finite()) {
            return Err(SimError::IntegrationFailure {
                t: t0,
                reason: "derivative at initial state is NaN or Inf".to_string(),
            });
        }

        // Samples at t0 itself come straight from the initial state.
        while next_eval < t_eval.len() && t_eval[next_eval] <= t0 {
            out_t.push(t_eval[next_eval]);
            out_y.push(y.clone());
            next_eval += 1;
        }

        if t_end == t0 {
            return Ok(DenseSolution {
                t: out_t,
                y: out_y,
                stats,
            });
        }

        let mut h_abs = self.initial_step(system, t0, &y, &f, &mut stats);
        if !(h_abs.is_finite() && h_abs > 0.0) {
            return Err(SimError::IntegrationFailure {
                t: t0,
                reason: format!("initial step estimate is not usable: {h_abs}"),
            });
        }
        let mut k: Vec<Vec<f64>> = vec![vec![0.0; n]; N_STAGES + 1];
        let mut y_new = vec![0.0; n];
        let mut f_new = vec![0.0; n];
        let mut scratch = vec![0.0; n];
        let mut attempts: u64 = 0;

        while t < t_end {
            let min_step = 10.0 * (next_up(t) - t).abs();
            if h_abs > self.max_step {
                h_abs = self.max_step;
            } else if h_abs < min_step {
                h_abs = min_step;
            }

            let mut step_rejected = false;
            let (h, t_new) = loop {
                attempts += 1;
                if attempts > self.budget.max_steps
                    || deadline.is_some_and(|d| started.elapsed() > d)
                {
                    return Err(SimError::IntegrationTimeout {
                        steps: attempts - 1,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }

                if h_abs < min_step {
                    return Err(SimError::IntegrationFailure {
                        t,
                        reason: "required step size is less than spacing between numbers"
                            .to_string(),
                    });
                }

                let mut h = h_abs;
                let mut t_new = t + h;
                if t_new > t_end {
                    t_new = t_end;
                }
                h = t_new - t;
                h_abs = h.abs();

                rk_step(system, t, &y, &f, h, &mut k, &mut y_new, &mut f_new, &mut scratch);
                stats.rhs_evals += N_STAGES as u64;

                let error_norm = error_norm(&k, h, &y, &y_new, self.rtol, self.atol);

                if error_norm < 1.0 {
                    let mut factor = if error_norm == 0.0 {
                        MAX_FACTOR
                    } else {
                        MAX_FACTOR.min(SAFETY * error_norm.powf(-1.0 / (ERROR_ESTIMATOR_ORDER + 1.0)))
                    };
                    if step_rejected {
                        factor = factor.min(1.0);
                    }
                    h_abs *= factor;
                    stats.accepted_steps += 1;
                    break (h, t_new);
                }

                if error_norm.is_finite() {
                    h_abs *= MIN_FACTOR.max(SAFETY * error_norm.powf(-1.0 / (ERROR_ESTIMATOR_ORDER + 1.0)));
                } else {
                    h_abs *= MIN_FACTOR;
                }
                stats.rejected_steps += 1;
                step_rejected = true;
            };

            if y_new.iter().any(|v| !v.is_finite()) {
                return Err(SimError::IntegrationFailure {
                    t: t_new,
                    reason: "state became NaN or Inf".to_string(),
                });
            }

            // Dense output for every grid point inside (t, t_new].
            while next_eval < t_eval.len() && t_eval[next_eval] <= t_new {
                let te = t_eval[next_eval];
                let x = (te - t) / h;
                let mut sample = vec![0.0; n];
                dense_eval(&k, &y, h, x, &mut sample);
                if sample.iter().any(|v| !v.is_finite()) {
                    return Err(SimError::IntegrationFailure {
                        t: te,
                        reason: "dense output produced NaN or Inf".to_string(),
                    });
                }
                out_t.push(te);
                out_y.push(sample);
                next_eval += 1;
            }

            t = t_new;
            std::mem::swap(&mut y, &mut y_new);
            std::mem::swap(&mut f, &mut f_new);
        }

        Ok(DenseSolution {
            t: out_t,
            y: out_y,
            stats,
        })
    }

    /// Starting step from the local scale of the solution and its derivative.
    fn initial_step<S: OdeSystem + ?Sized>(
        &self,
        system: &S,
        t0: f64,
        y0: &[f64],
        f0: &[f64],
        stats: &mut SolverStats,
    ) -> f64 {
        let n = y0.len();
        if n == 0 {
            return self.max_step.min(1.0);
        }
        let scale: Vec<f64> = y0.iter().map(|v| self.atol + v.abs() * self.rtol).collect();
        let d0 = rms(y0.iter().zip(&scale).map(|(v, s)| v / s));
        let d1 = rms(f0.iter().zip(&scale).map(|(v, s)| v / s));
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };

        let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
        let mut f1 = vec![0.0; n];
        system.rhs(t0 + h0, &y1, &mut f1);
        stats.rhs_evals += 1;

        let d2 = rms(
            f1.iter()
                .zip(f0)
                .zip(&scale)
                .map(|((a, b), s)| (a - b) / s),
        ) / h0;

        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / (ERROR_ESTIMATOR_ORDER + 1.0))
        };

        (100.0 * h0).min(h1)
    }
}

#[allow(clippy::too_many_arguments)]
fn rk_step<S: OdeSystem + ?Sized>(
    system: &S,
    t: f64,
    y: &[f64],
    f: &[f64],
    h: f64,
    k: &mut [Vec<f64>],
    y_new: &mut [f64],
    f_new: &mut [f64],
    scratch: &mut [f64],
) {
    k[0].copy_from_slice(f);
    for s in 1..N_STAGES {
        for (i, dy) in scratch.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (j, a) in A[s][..s].iter().enumerate() {
                acc += a * k[j][i];
            }
            *dy = y[i] + h * acc;
        }
        let (_, rest) = k.split_at_mut(s);
        system.rhs(t + C[s] * h, scratch, &mut rest[0]);
    }

    for (i, out) in y_new.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (s, b) in B.iter().enumerate() {
            acc += b * k[s][i];
        }
        *out = y[i] + h * acc;
    }

    system.rhs(t + h, y_new, f_new);
    k[N_STAGES].copy_from_slice(f_new);
}

fn error_norm(k: &[Vec<f64>], h: f64, y: &[f64], y_new: &[f64], rtol: f64, atol: f64) -> f64 {
    rms((0..y.len()).map(|i| {
        let mut err = 0.0;
        for (s, e) in E.iter().enumerate() {
            err += e * k[s][i];
        }
        let scale = atol + y[i].abs().max(y_new[i].abs()) * rtol;
        err * h / scale
    }))
}

fn dense_eval(k: &[Vec<f64>], y_old: &[f64], h: f64, x: f64, out: &mut [f64]) {
    let powers = [x, x * x, x * x * x, x * x * x * x];
    let weights: Vec<f64> = P
        .iter()
        .map(|row| row.iter().zip(&powers).map(|(p, xp)| p * xp).sum())
        .collect();
    for (i, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (s, w) in weights.iter().enumerate() {
            acc += k[s][i] * w;
        }
        *o = y_old[i] + h * acc;
    }
}

fn rms<I: Iterator<Item = f64>>(values: I) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v * v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Smallest representable `f64` strictly greater than `x` (finite `x`).
fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

/// `ceil(t_max / dt)` points `i * dt`, matching a half-open `[0, t_max)` range.
pub fn uniform_grid(t_max: f64, dt: f64) -> Vec<f64> {
    let count = (t_max / dt).ceil().max(0.0) as usize;
    (0..count).map(|i| i as f64 * dt).collect()
}
