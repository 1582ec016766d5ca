//! Request-level orchestration: payload in, report out.
//!
//! `payload → decode → reconstruct → coupling matrix → simulate → summarize →
//! explain`. Every failure along the chain becomes an error report, so the
//! caller always gets a value it can hand back to a client.

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connectome::CouplingMatrix;
use crate::crosscoder::Reconstructor;
use crate::dynamics::{EngineParams, NeuroCore, Trajectory};
use crate::error::{SimError, SimResult};
use crate::explainer::{self, Explainer};
use crate::integrator::IntegratorBudget;
use crate::npy;
use crate::parcellation::Parcellation;
use crate::prng::Prng;
use crate::regime::{Regime, Summary};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    pub params: EngineParams,
    pub t_max: f64,
    pub dt: f64,
    /// Fixed seed for initial conditions; `None` draws one per request.
    pub seed: Option<u64>,
    pub budget: IntegratorBudget,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            params: EngineParams::pipeline(),
            t_max: 100.0,
            dt: 0.1,
            seed: None,
            budget: IntegratorBudget::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_params(mut self, params: EngineParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_horizon(mut self, t_max: f64, dt: f64) -> Self {
        self.t_max = t_max;
        self.dt = dt;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_budget(mut self, budget: IntegratorBudget) -> Self {
        self.budget = budget;
        self
    }
}

/// Summary plus the raw trajectory it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub summary: Summary,
    pub trajectory: Trajectory,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationSuccess {
    pub mean_firing_rate: f64,
    pub mean_membrane_potential: f64,
    pub state: Regime,
    pub explanation: String,
    pub time: Vec<f64>,
    pub firing_rate_series: Vec<f64>,
    pub membrane_potential_series: Vec<f64>,
}

/// Result of one request, serialized with a `status` of `success` or `error`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "status", rename_all = "snake_case"))]
pub enum SimulationReport {
    Success(SimulationSuccess),
    Error { kind: String, message: String },
}

impl SimulationReport {
    pub fn from_error(err: &SimError) -> Self {
        SimulationReport::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SimulationReport::Success(_))
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub struct SimulationPipeline {
    config: PipelineConfig,
    reconstructor: Option<Arc<dyn Reconstructor>>,
    explainer: Option<Arc<dyn Explainer>>,
}

impl SimulationPipeline {
    pub fn new(
        config: PipelineConfig,
        reconstructor: Option<Arc<dyn Reconstructor>>,
        explainer: Option<Arc<dyn Explainer>>,
    ) -> Self {
        Self {
            config,
            reconstructor,
            explainer,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_model_loaded(&self) -> bool {
        self.reconstructor.is_some()
    }

    /// Build the network from an upper-triangle vector and simulate it.
    pub fn simulate_coupling(
        &self,
        coupling: &[f64],
        n: usize,
        rng: &mut Prng,
    ) -> SimResult<SimulationOutcome> {
        let matrix = CouplingMatrix::from_upper_triangle(coupling, n)?;
        let engine = NeuroCore::new(&matrix, self.config.params)?;
        let cfg = &self.config;
        let trajectory =
            engine.simulate_with_budget(None, None, rng, cfg.t_max, cfg.dt, cfg.budget)?;
        let summary = Summary::from_trajectory(&trajectory);
        debug!(
            regions = n,
            samples = trajectory.timesteps(),
            accepted = trajectory.stats.accepted_steps,
            rejected = trajectory.stats.rejected_steps,
            "simulation finished"
        );
        Ok(SimulationOutcome {
            summary,
            trajectory,
        })
    }

    /// Full request chain. Never fails: errors come back as [`SimulationReport::Error`].
    pub fn run(&self, payload: &[u8], parcellation: &str) -> SimulationReport {
        match self.try_run(payload, parcellation) {
            Ok(success) => SimulationReport::Success(success),
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "simulation request failed");
                SimulationReport::from_error(&e)
            }
        }
    }

    fn try_run(&self, payload: &[u8], parcellation: &str) -> SimResult<SimulationSuccess> {
        let reconstructor = self
            .reconstructor
            .as_deref()
            .ok_or_else(|| SimError::ModelNotLoaded("reconstruction model".to_string()))?;
        let source: Parcellation = parcellation.parse()?;
        let input = npy::decode(payload)?.into_flat();
        let coupling = reconstructor.reconstruct(&input, source)?;

        let mut rng = self.request_rng();
        let n = reconstructor.target_regions();
        info!(%source, regions = n, seed = rng.state(), "simulating reconstructed network");
        let outcome = self.simulate_coupling(&coupling, n, &mut rng)?;
        let summary = outcome.summary;
        info!(
            mean_r = summary.mean_r,
            mean_v = summary.mean_v,
            regime = %summary.regime,
            "simulation summarized"
        );

        let explanation = explainer::explain_or_placeholder(self.explainer.as_deref(), &summary);
        Ok(SimulationSuccess {
            mean_firing_rate: summary.mean_r,
            mean_membrane_potential: summary.mean_v,
            state: summary.regime,
            explanation,
            time: outcome.trajectory.t,
            firing_rate_series: summary.r_series,
            membrane_potential_series: summary.v_series,
        })
    }

    fn request_rng(&self) -> Prng {
        match self.config.seed {
            Some(seed) => Prng::new(seed),
            None => Prng::from_entropy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts any correctly-sized input and returns a fixed 4-region network.
    struct FixedNetwork(Vec<f64>);

    impl Reconstructor for FixedNetwork {
        fn target_regions(&self) -> usize {
            4
        }

        fn reconstruct(&self, input: &[f64], source: Parcellation) -> SimResult<Vec<f64>> {
            if input.len() != source.edge_count() {
                return Err(SimError::DimensionMismatch {
                    expected: source.edge_count(),
                    actual: input.len(),
                });
            }
            Ok(self.0.clone())
        }
    }

    struct Echo;

    impl Explainer for Echo {
        fn explain(&self, prompt: &str) -> SimResult<String> {
            Ok(prompt.to_uppercase())
        }
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_horizon(10.0, 1.0)
            .with_seed(Some(42))
    }

    fn pipeline(explainer: Option<Arc<dyn Explainer>>) -> SimulationPipeline {
        let recon: Arc<dyn Reconstructor> =
            Arc::new(FixedNetwork(vec![0.4, 0.1, 0.0, 0.2, 0.3, 0.5]));
        SimulationPipeline::new(small_config(), Some(recon), explainer)
    }

    fn p86_payload() -> Vec<u8> {
        let n = Parcellation::P86.edge_count();
        npy::encode_f64(&[n], &vec![0.01; n])
    }

    fn error_kind(report: &SimulationReport) -> &str {
        match report {
            SimulationReport::Error { kind, .. } => kind,
            SimulationReport::Success(_) => "success",
        }
    }

    #[test]
    fn defaults_use_pipeline_preset() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.params, EngineParams::pipeline());
        assert_eq!(cfg.t_max, 100.0);
        assert_eq!(cfg.dt, 0.1);
    }

    #[test]
    fn simulate_coupling_on_zero_network() {
        let pipe = SimulationPipeline::new(
            PipelineConfig::default()
                .with_params(EngineParams::default())
                .with_horizon(10.0, 1.0),
            None,
            None,
        );
        let out = pipe
            .simulate_coupling(&[0.0; 6], 4, &mut Prng::new(1))
            .unwrap();
        assert_eq!(out.trajectory.timesteps(), 10);
        assert_eq!(out.summary.r_series.len(), 10);
        assert!(out.summary.mean_r.is_finite());
        assert!(out.summary.mean_v.is_finite());
    }

    #[test]
    fn simulate_coupling_rejects_wrong_length() {
        let pipe = SimulationPipeline::new(small_config(), None, None);
        let err = pipe
            .simulate_coupling(&[0.0; 5], 4, &mut Prng::new(1))
            .unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn non_finite_coupling_is_rejected_not_timed_out() {
        let pipe = SimulationPipeline::new(small_config(), None, None);
        let err = pipe
            .simulate_coupling(&[0.1, f64::NAN, 0.2, 0.0, 0.3, 0.1], 4, &mut Prng::new(1))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_parameter");

        let recon: Arc<dyn Reconstructor> =
            Arc::new(FixedNetwork(vec![0.4, f64::INFINITY, 0.0, 0.2, 0.3, 0.5]));
        let pipe = SimulationPipeline::new(small_config(), Some(recon), None);
        let report = pipe.run(&p86_payload(), "parc_86");
        assert_eq!(error_kind(&report), "invalid_parameter");
    }

    #[test]
    fn missing_model_is_reported() {
        let pipe = SimulationPipeline::new(small_config(), None, None);
        assert!(!pipe.is_model_loaded());
        let report = pipe.run(&p86_payload(), "parc_86");
        assert_eq!(error_kind(&report), "model_not_loaded");
    }

    #[test]
    fn bad_requests_become_error_reports() {
        let pipe = pipeline(None);
        assert_eq!(
            error_kind(&pipe.run(&p86_payload(), "parc_100")),
            "unknown_parcellation"
        );
        assert_eq!(
            error_kind(&pipe.run(b"not an array", "86")),
            "invalid_payload"
        );
        let short = npy::encode_f64(&[3], &[1.0, 2.0, 3.0]);
        assert_eq!(
            error_kind(&pipe.run(&short, "parc_86")),
            "dimension_mismatch"
        );
    }

    #[test]
    fn successful_run_fills_every_field() {
        let pipe = pipeline(None);
        let report = pipe.run(&p86_payload(), "86");
        let SimulationReport::Success(s) = report else {
            panic!("expected success");
        };
        assert_eq!(s.time.len(), 10);
        assert_eq!(s.firing_rate_series.len(), 10);
        assert_eq!(s.membrane_potential_series.len(), 10);
        assert!(s.mean_firing_rate.is_finite());
        assert_eq!(s.explanation, explainer::PLACEHOLDER);
        assert_eq!(
            s.state,
            crate::regime::classify(s.mean_firing_rate, s.mean_membrane_potential)
        );
    }

    #[test]
    fn explainer_receives_summary_prompt() {
        let pipe = pipeline(Some(Arc::new(Echo)));
        let SimulationReport::Success(s) = pipe.run(&p86_payload(), "parc_86") else {
            panic!("expected success");
        };
        assert!(s.explanation.starts_with("EXPLAIN THE NEURAL DYNAMICS FOR MEAN_R="));
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let pipe = pipeline(None);
        let a = pipe.run(&p86_payload(), "parc_86");
        let b = pipe.run(&p86_payload(), "parc_86");
        assert!(a.is_success());
        assert_eq!(a, b);
    }

    #[test]
    fn step_budget_surfaces_as_timeout() {
        let recon: Arc<dyn Reconstructor> = Arc::new(FixedNetwork(vec![0.0; 6]));
        let cfg = small_config().with_budget(IntegratorBudget {
            max_steps: 2,
            wall_clock_ms: None,
        });
        let pipe = SimulationPipeline::new(cfg, Some(recon), None);
        assert_eq!(
            error_kind(&pipe.run(&p86_payload(), "parc_86")),
            "integration_timeout"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn reports_serialize_with_status_tag() {
        let err = SimulationReport::from_error(&SimError::UnknownParcellation("parc_7".into()));
        let json: serde_json::Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "unknown_parcellation");

        let ok = pipeline(None).run(&p86_payload(), "parc_86");
        let json: serde_json::Value = serde_json::from_str(&ok.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["time"].as_array().map(Vec::len), Some(10));
        for key in [
            "mean_firing_rate",
            "mean_membrane_potential",
            "state",
            "explanation",
            "firing_rate_series",
            "membrane_potential_series",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
