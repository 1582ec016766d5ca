//! Coupled neural-mass dynamics (firing rate `r`, mean potential `V`).
//!
//! Per region `i`:
//!
//! ```text
//! dr_i/dt = (Δ/π + 2 r_i tanh(V_i/3)) / τ
//! dV_i/dt = (η + k Σ_j W_ij tanh(3 r_j) + I_ext) / τ − γ V_i / τ
//! ```
//!
//! with an extra brake on regions whose rate exceeds 5 and an element-wise
//! clamp on both derivatives. The clamp is what keeps the integrator from
//! diverging regardless of how large the state gets.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connectome::{CouplingMatrix, ExecutionTier};
use crate::error::{SimError, SimResult};
use crate::integrator::{uniform_grid, IntegratorBudget, OdeSystem, Rk45, SolverStats};
use crate::prng::Prng;

/// Rate above which a region gets the extra damping.
pub const OVERACTIVE_RATE: f64 = 5.0;
const OVERACTIVE_V_BRAKE: f64 = 0.5;
const OVERACTIVE_R_BRAKE: f64 = 0.2;

/// Resting-state ranges for randomized initial conditions.
pub const REST_R_RANGE: (f64, f64) = (0.05, 0.15);
pub const REST_V_RANGE: (f64, f64) = (-3.5, -2.5);

/// Fields missing from a serialized form fall back to [`EngineParams::default`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineParams {
    /// Membrane time constant.
    pub tau: f64,
    /// Mean excitability.
    pub eta: f64,
    /// Heterogeneity half-width (Δ); enters `dr` as Δ/π.
    pub delta: f64,
    /// Global coupling gain.
    pub k: f64,
    /// External drive.
    pub i_ext: f64,
    /// Linear leak pulling `V` toward zero.
    pub gamma: f64,
    pub clip_dr: f64,
    pub clip_dv: f64,

    // Coupling normalization: W / (max|W| + eps) * scale.
    pub coupling_scale: f64,
    pub normalize_eps: f64,

    pub tier: ExecutionTier,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            tau: 1.0,
            eta: -1.5,
            delta: 0.05,
            k: 0.4,
            i_ext: 0.1,
            gamma: 0.5,
            clip_dr: 1.0,
            clip_dv: 1.0,
            coupling_scale: 0.2,
            normalize_eps: 1e-12,
            tier: ExecutionTier::Scalar,
        }
    }
}

impl EngineParams {
    /// Parameter set used by the request pipeline.
    pub fn pipeline() -> Self {
        Self {
            eta: -1.8,
            delta: 0.12,
            k: 2.0,
            i_ext: 0.35,
            ..Self::default()
        }
    }

    pub fn with_drive(mut self, eta: f64, i_ext: f64) -> Self {
        self.eta = eta;
        self.i_ext = i_ext;
        self
    }

    pub fn with_coupling_gain(mut self, k: f64) -> Self {
        self.k = k;
        self
    }

    pub fn with_clips(mut self, clip_dr: f64, clip_dv: f64) -> Self {
        self.clip_dr = clip_dr;
        self.clip_dv = clip_dv;
        self
    }

    pub fn with_tier(mut self, tier: ExecutionTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn validate(&self) -> SimResult<()> {
        let named = [
            ("tau", self.tau),
            ("eta", self.eta),
            ("delta", self.delta),
            ("k", self.k),
            ("i_ext", self.i_ext),
            ("gamma", self.gamma),
            ("clip_dr", self.clip_dr),
            ("clip_dv", self.clip_dv),
            ("coupling_scale", self.coupling_scale),
            ("normalize_eps", self.normalize_eps),
        ];
        if let Some((name, v)) = named.iter().find(|(_, v)| !v.is_finite()) {
            return Err(SimError::InvalidParameter(format!("{name} is not finite: {v}")));
        }
        if self.tau <= 0.0 {
            return Err(SimError::InvalidParameter(format!(
                "tau must be positive, got {}",
                self.tau
            )));
        }
        if self.clip_dr <= 0.0 || self.clip_dv <= 0.0 {
            return Err(SimError::InvalidParameter(
                "derivative clips must be positive".to_string(),
            ));
        }
        if self.normalize_eps < 0.0 {
            return Err(SimError::InvalidParameter(
                "normalize_eps must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Instantaneous state of all regions.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemState {
    pub r: Vec<f64>,
    pub v: Vec<f64>,
}

impl SystemState {
    /// Randomized resting state: `r` drawn first, then `V`.
    pub fn resting(n: usize, rng: &mut Prng) -> Self {
        let r = rng.uniform_vec(n, REST_R_RANGE.0, REST_R_RANGE.1);
        let v = rng.uniform_vec(n, REST_V_RANGE.0, REST_V_RANGE.1);
        Self { r, v }
    }

    fn concat(&self) -> Vec<f64> {
        let mut y = Vec::with_capacity(self.r.len() + self.v.len());
        y.extend_from_slice(&self.r);
        y.extend_from_slice(&self.v);
        y
    }
}

/// Uniformly-sampled simulation output.
///
/// `r` and `v` are regions × timesteps, stored row-major per region.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    pub t: Vec<f64>,
    regions: usize,
    r: Vec<f64>,
    v: Vec<f64>,
    pub stats: SolverStats,
}

impl Trajectory {
    /// Build from per-timestep state vectors `[r.., V..]`.
    fn from_samples(t: Vec<f64>, regions: usize, samples: &[Vec<f64>], stats: SolverStats) -> Self {
        let steps = t.len();
        let mut r = vec![0.0; regions * steps];
        let mut v = vec![0.0; regions * steps];
        for (k, y) in samples.iter().enumerate() {
            for i in 0..regions {
                r[i * steps + k] = y[i];
                v[i * steps + k] = y[regions + i];
            }
        }
        Self {
            t,
            regions,
            r,
            v,
            stats,
        }
    }

    pub fn regions(&self) -> usize {
        self.regions
    }

    pub fn timesteps(&self) -> usize {
        self.t.len()
    }

    /// Firing-rate series of one region.
    pub fn r_region(&self, i: usize) -> &[f64] {
        let steps = self.timesteps();
        &self.r[i * steps..(i + 1) * steps]
    }

    /// Potential series of one region.
    pub fn v_region(&self, i: usize) -> &[f64] {
        let steps = self.timesteps();
        &self.v[i * steps..(i + 1) * steps]
    }

    /// All rate samples (regions × timesteps, row-major).
    pub fn r(&self) -> &[f64] {
        &self.r
    }

    pub fn v(&self) -> &[f64] {
        &self.v
    }

    pub fn state_at(&self, step: usize) -> SystemState {
        let steps = self.timesteps();
        SystemState {
            r: (0..self.regions).map(|i| self.r[i * steps + step]).collect(),
            v: (0..self.regions).map(|i| self.v[i * steps + step]).collect(),
        }
    }
}

/// Coupled neural-mass network with a fixed, normalized coupling matrix.
#[derive(Debug, Clone)]
pub struct NeuroCore {
    w: CouplingMatrix,
    params: EngineParams,
}

impl NeuroCore {
    pub fn new(matrix: &CouplingMatrix, params: EngineParams) -> SimResult<Self> {
        params.validate()?;
        let w = matrix.normalized(params.coupling_scale, params.normalize_eps);
        Ok(Self { w, params })
    }

    pub fn regions(&self) -> usize {
        self.w.n()
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Normalized coupling the dynamics actually use.
    pub fn coupling(&self) -> &CouplingMatrix {
        &self.w
    }

    /// Rate of change for state `y = [r.., V..]`, written into `dydt`.
    pub fn derivative(&self, y: &[f64], dydt: &mut [f64]) {
        let n = self.regions();
        let p = &self.params;
        let (r, v) = y.split_at(n);
        let (dr, dv) = dydt.split_at_mut(n);

        // Bounded drive: each region contributes at most |W_ij|. `dr` holds it
        // until the loop below overwrites each slot from `r`.
        for (d, &ri) in dr.iter_mut().zip(r) {
            *d = (3.0 * ri).tanh();
        }
        self.w.mul_vec(dr, dv, p.tier);

        let base_r = p.delta / std::f64::consts::PI;
        for i in 0..n {
            let coupling = dv[i];
            let v_term = (v[i] / 3.0).tanh();

            let mut d_r = (base_r + 2.0 * r[i] * v_term) / p.tau;
            let mut d_v = (p.eta + p.k * coupling + p.i_ext) / p.tau - p.gamma * v[i] / p.tau;

            if r[i] > OVERACTIVE_RATE {
                d_v -= OVERACTIVE_V_BRAKE * v[i];
                d_r -= OVERACTIVE_R_BRAKE * r[i];
            }

            // NaN passes through clamp untouched so the integrator can report it.
            dr[i] = d_r.clamp(-p.clip_dr, p.clip_dr);
            dv[i] = d_v.clamp(-p.clip_dv, p.clip_dv);
        }
    }

    /// Integrate from `t = 0` to `t_max`, sampled every `dt`.
    ///
    /// Missing initial vectors are drawn from the resting-state ranges using
    /// `rng` (rates first, then potentials).
    pub fn simulate(
        &self,
        r0: Option<&[f64]>,
        v0: Option<&[f64]>,
        rng: &mut Prng,
        t_max: f64,
        dt: f64,
    ) -> SimResult<Trajectory> {
        self.simulate_with_budget(r0, v0, rng, t_max, dt, IntegratorBudget::default())
    }

    pub fn simulate_with_budget(
        &self,
        r0: Option<&[f64]>,
        v0: Option<&[f64]>,
        rng: &mut Prng,
        t_max: f64,
        dt: f64,
        budget: IntegratorBudget,
    ) -> SimResult<Trajectory> {
        let n = self.regions();
        let r = match r0 {
            Some(r) => checked_initial(r, n)?,
            None => rng.uniform_vec(n, REST_R_RANGE.0, REST_R_RANGE.1),
        };
        let v = match v0 {
            Some(v) => checked_initial(v, n)?,
            None => rng.uniform_vec(n, REST_V_RANGE.0, REST_V_RANGE.1),
        };
        self.run(&SystemState { r, v }, t_max, dt, budget)
    }

    /// Integrate from an explicit initial state.
    pub fn run(
        &self,
        initial: &SystemState,
        t_max: f64,
        dt: f64,
        budget: IntegratorBudget,
    ) -> SimResult<Trajectory> {
        if !(t_max.is_finite() && t_max > 0.0) {
            return Err(SimError::InvalidParameter(format!(
                "t_max must be positive and finite, got {t_max}"
            )));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimError::InvalidParameter(format!(
                "dt must be positive and finite, got {dt}"
            )));
        }
        let n = self.regions();
        checked_initial(&initial.r, n)?;
        checked_initial(&initial.v, n)?;

        let grid = uniform_grid(t_max, dt);
        let solver = Rk45::default().with_max_step(dt).with_budget(budget);
        let sol = solver.solve(self, 0.0, t_max, &initial.concat(), &grid)?;

        Ok(Trajectory::from_samples(sol.t, n, &sol.y, sol.stats))
    }
}

impl OdeSystem for NeuroCore {
    fn dimension(&self) -> usize {
        2 * self.regions()
    }

    // Autonomous system: t is unused.
    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        self.derivative(y, dydt);
    }
}

fn checked_initial(x: &[f64], n: usize) -> SimResult<Vec<f64>> {
    if x.len() != n {
        return Err(SimError::DimensionMismatch {
            expected: n,
            actual: x.len(),
        });
    }
    Ok(x.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectome::edge_count;

    fn random_engine(n: usize, seed: u64, params: EngineParams) -> NeuroCore {
        let vec = Prng::new(seed).uniform_vec(edge_count(n), -1.0, 3.0);
        let m = CouplingMatrix::from_upper_triangle(&vec, n).unwrap();
        NeuroCore::new(&m, params).unwrap()
    }

    #[test]
    fn construction_normalizes_to_fixed_peak() {
        let engine = random_engine(8, 1, EngineParams::default());
        assert!((engine.coupling().max_abs() - 0.2).abs() < 1e-9);

        // Scale invariance: multiplying the raw input changes nothing.
        let vec = Prng::new(1).uniform_vec(edge_count(8), -1.0, 3.0);
        let scaled: Vec<f64> = vec.iter().map(|w| w * 250.0).collect();
        let m = CouplingMatrix::from_upper_triangle(&scaled, 8).unwrap();
        let other = NeuroCore::new(&m, EngineParams::default()).unwrap();
        for (a, b) in engine.coupling().as_slice().iter().zip(other.coupling().as_slice()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn derivative_matches_closed_form_without_coupling() {
        let engine = NeuroCore::new(&CouplingMatrix::zeros(1), EngineParams::default()).unwrap();
        let p = *engine.params();
        let (r, v) = (0.1, -3.0);
        let mut d = [0.0; 2];
        engine.derivative(&[r, v], &mut d);

        let dr = p.delta / std::f64::consts::PI + 2.0 * r * (v / 3.0f64).tanh();
        let dv = p.eta + p.i_ext - p.gamma * v;
        assert!((d[0] - dr).abs() < 1e-12);
        assert!((d[1] - dv).abs() < 1e-12);
    }

    #[test]
    fn coupled_derivative_matches_closed_form() {
        let params = EngineParams::default()
            .with_coupling_gain(1.5)
            .with_clips(1e9, 1e9);
        let m = CouplingMatrix::from_upper_triangle(&[0.8, 0.3, -0.4], 3).unwrap();
        let engine = NeuroCore::new(&m, params).unwrap();
        let y = [0.1, 0.4, 2.0, -3.0, -1.0, 0.5];
        let mut d = [0.0; 6];
        engine.derivative(&y, &mut d);

        let w = engine.coupling();
        let base = params.delta / std::f64::consts::PI;
        for i in 0..3 {
            let (r, v) = (y[i], y[3 + i]);
            let coupling: f64 = (0..3).map(|j| w.row(i)[j] * (3.0 * y[j]).tanh()).sum();
            let dr = base + 2.0 * r * (v / 3.0).tanh();
            let dv = params.eta + 1.5 * coupling + params.i_ext - params.gamma * v;
            assert!((d[i] - dr).abs() < 1e-12, "dr[{i}]");
            assert!((d[3 + i] - dv).abs() < 1e-12, "dv[{i}]");
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_params_json_uses_defaults() {
        let p: EngineParams = serde_json::from_str(r#"{"k":3.0}"#).unwrap();
        assert_eq!(p, EngineParams::default().with_coupling_gain(3.0));
    }

    #[test]
    fn overactive_regions_get_braked() {
        let params = EngineParams::default().with_clips(1e9, 1e9);
        let engine = NeuroCore::new(&CouplingMatrix::zeros(2), params).unwrap();
        let mut d = [0.0; 4];
        // Region 0 overactive, region 1 not; same V.
        engine.derivative(&[6.0, 4.0, 1.0, 1.0], &mut d);

        let vt = (1.0f64 / 3.0).tanh();
        let base = params.delta / std::f64::consts::PI;
        assert!((d[0] - (base + 12.0 * vt - 0.2 * 6.0)).abs() < 1e-12);
        assert!((d[1] - (base + 8.0 * vt)).abs() < 1e-12);
        let dv_free = params.eta + params.i_ext - params.gamma;
        assert!((d[2] - (dv_free - 0.5)).abs() < 1e-12);
        assert!((d[3] - dv_free).abs() < 1e-12);
    }

    #[test]
    fn derivatives_are_clamped_for_any_state() {
        let params = EngineParams::pipeline().with_clips(0.75, 1.25);
        let engine = random_engine(6, 9, params);
        let mut rng = Prng::new(123);
        let mut d = vec![0.0; 12];
        for scale in [1.0, 1e3, 1e8, 1e300] {
            for _ in 0..50 {
                let y = rng.uniform_vec(12, -scale, scale);
                engine.derivative(&y, &mut d);
                assert!(d[..6].iter().all(|x| x.abs() <= 0.75), "scale={scale}");
                assert!(d[6..].iter().all(|x| x.abs() <= 1.25), "scale={scale}");
            }
        }
    }

    #[test]
    fn seeded_simulation_is_deterministic() {
        let engine = random_engine(5, 4, EngineParams::pipeline());
        let a = engine
            .simulate(None, None, &mut Prng::new(42), 5.0, 0.1)
            .unwrap();
        let b = engine
            .simulate(None, None, &mut Prng::new(42), 5.0, 0.1)
            .unwrap();
        assert_eq!(a, b);

        let c = engine
            .simulate(None, None, &mut Prng::new(43), 5.0, 0.1)
            .unwrap();
        assert_ne!(a.r(), c.r());
    }

    #[test]
    fn four_zero_regions_give_ten_uniform_points() {
        let m = CouplingMatrix::from_upper_triangle(&[0.0; 6], 4).unwrap();
        let engine = NeuroCore::new(&m, EngineParams::default()).unwrap();
        let traj = engine
            .simulate(None, None, &mut Prng::new(7), 10.0, 1.0)
            .unwrap();

        assert_eq!(traj.timesteps(), 10);
        assert_eq!(traj.regions(), 4);
        for (i, t) in traj.t.iter().enumerate() {
            assert_eq!(*t, i as f64);
        }
        assert!(traj.r().iter().chain(traj.v()).all(|x| x.is_finite()));
    }

    #[test]
    fn explicit_initial_state_is_first_sample() {
        let engine = random_engine(3, 2, EngineParams::default());
        let r0 = [0.1, 0.2, 0.3];
        let v0 = [-3.0, -2.0, -1.0];
        let traj = engine
            .simulate(Some(&r0), Some(&v0), &mut Prng::new(1), 1.0, 0.5)
            .unwrap();
        let first = traj.state_at(0);
        assert_eq!(first.r, r0.to_vec());
        assert_eq!(first.v, v0.to_vec());
        assert_eq!(traj.r_region(2)[0], 0.3);
        assert_eq!(traj.v_region(1)[0], -2.0);
        assert_eq!(traj.v_region(1).len(), traj.timesteps());
    }

    #[test]
    fn partial_initial_state_draws_only_the_missing_part() {
        let engine = random_engine(3, 2, EngineParams::default());
        let r0 = [0.1, 0.2, 0.3];
        let traj = engine
            .simulate(Some(&r0), None, &mut Prng::new(5), 1.0, 0.5)
            .unwrap();
        let first = traj.state_at(0);
        assert_eq!(first.r, r0.to_vec());
        assert!(first
            .v
            .iter()
            .all(|v| (REST_V_RANGE.0..REST_V_RANGE.1).contains(v)));
    }

    #[test]
    fn wrong_initial_length_is_rejected() {
        let engine = random_engine(3, 2, EngineParams::default());
        let err = engine
            .simulate(Some(&[0.1, 0.2]), None, &mut Prng::new(1), 1.0, 0.5)
            .unwrap_err();
        assert_eq!(
            err,
            SimError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn bad_time_parameters_are_rejected() {
        let engine = random_engine(3, 2, EngineParams::default());
        let mut rng = Prng::new(1);
        for (t_max, dt) in [(0.0, 0.1), (1.0, 0.0), (f64::NAN, 0.1), (1.0, -0.5)] {
            let err = engine.simulate(None, None, &mut rng, t_max, dt).unwrap_err();
            assert_eq!(err.kind(), "invalid_parameter", "t_max={t_max} dt={dt}");
        }
    }

    #[test]
    fn invalid_params_are_rejected() {
        let m = CouplingMatrix::zeros(2);
        let bad_tau = EngineParams {
            tau: 0.0,
            ..EngineParams::default()
        };
        assert!(NeuroCore::new(&m, bad_tau).is_err());
        let bad_clip = EngineParams::default().with_clips(0.0, 1.0);
        assert!(NeuroCore::new(&m, bad_clip).is_err());
        let nan_eta = EngineParams::default().with_drive(f64::NAN, 0.1);
        assert!(NeuroCore::new(&m, nan_eta).is_err());
    }

    #[test]
    fn tiny_step_budget_times_out() {
        let engine = random_engine(4, 3, EngineParams::pipeline());
        let err = engine
            .simulate_with_budget(
                None,
                None,
                &mut Prng::new(1),
                50.0,
                0.1,
                IntegratorBudget {
                    max_steps: 10,
                    wall_clock_ms: None,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), "integration_timeout");
    }

    #[test]
    fn tiers_produce_matching_trajectories() {
        let scalar = random_engine(7, 8, EngineParams::pipeline());
        let parallel =
            random_engine(7, 8, EngineParams::pipeline().with_tier(ExecutionTier::Parallel));
        let a = scalar.simulate(None, None, &mut Prng::new(3), 3.0, 0.1).unwrap();
        let b = parallel
            .simulate(None, None, &mut Prng::new(3), 3.0, 0.1)
            .unwrap();
        assert_eq!(a.timesteps(), b.timesteps());
        for (x, y) in a.r().iter().zip(b.r()) {
            assert!((x - y).abs() < 1e-9);
        }
    }
}
