//! NeuroCore: coupled neural-mass simulation of whole-brain connectomes.
//!
//! The crate turns a structural connectome (upper-triangle vector) into a
//! normalized coupling matrix, integrates firing-rate / membrane-potential
//! dynamics over it with an adaptive Dormand–Prince solver, and reduces the
//! trajectory to summary statistics and a regime label.
//!
//! ```no_run
//! use neurocore::prelude::*;
//!
//! let pipeline = SimulationPipeline::new(PipelineConfig::default(), None, None);
//! let mut rng = Prng::new(7);
//! let out = pipeline.simulate_coupling(&[0.2, 0.0, 0.5], 3, &mut rng)?;
//! println!("{} mean_r={:.3}", out.summary.regime, out.summary.mean_r);
//! # Ok::<(), neurocore::error::SimError>(())
//! ```

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/connectome.rs"]
pub mod connectome;

#[path = "core/integrator.rs"]
pub mod integrator;

#[path = "core/dynamics.rs"]
pub mod dynamics;

#[path = "core/regime.rs"]
pub mod regime;

#[path = "core/parcellation.rs"]
pub mod parcellation;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/crosscoder.rs"]
pub mod crosscoder;

#[path = "core/explainer.rs"]
pub mod explainer;

#[path = "core/npy.rs"]
pub mod npy;

#[path = "core/pipeline.rs"]
pub mod pipeline;

pub mod prelude {
    pub use crate::connectome::{CouplingMatrix, ExecutionTier};
    pub use crate::crosscoder::{CrossCoder, Reconstructor};
    pub use crate::dynamics::{EngineParams, NeuroCore, SystemState, Trajectory};
    pub use crate::error::{SimError, SimResult};
    pub use crate::explainer::Explainer;
    pub use crate::integrator::IntegratorBudget;
    pub use crate::parcellation::Parcellation;
    pub use crate::pipeline::{
        PipelineConfig, SimulationOutcome, SimulationPipeline, SimulationReport,
    };
    pub use crate::prng::Prng;
    pub use crate::regime::{classify, Regime, Summary};
}
