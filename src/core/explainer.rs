use tracing::warn;

use crate::error::SimResult;
use crate::regime::Summary;

/// Text returned whenever no explanation could be produced.
pub const PLACEHOLDER: &str = "LLM explainer not loaded.";

/// Turns a prompt describing simulation results into prose.
pub trait Explainer: Send + Sync {
    fn explain(&self, prompt: &str) -> SimResult<String>;
}

pub fn prompt(summary: &Summary) -> String {
    format!(
        "Explain the neural dynamics for mean_r={:.3}, mean_V={:.3}, state={}",
        summary.mean_r, summary.mean_v, summary.regime
    )
}

/// Ask `explainer` about `summary`, degrading to [`PLACEHOLDER`].
pub fn explain_or_placeholder(explainer: Option<&dyn Explainer>, summary: &Summary) -> String {
    let Some(explainer) = explainer else {
        return PLACEHOLDER.to_string();
    };
    match explainer.explain(&prompt(summary)) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "explainer failed; using placeholder");
            PLACEHOLDER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use crate::regime::Regime;

    struct Echo;

    impl Explainer for Echo {
        fn explain(&self, prompt: &str) -> SimResult<String> {
            Ok(format!("echo: {prompt}"))
        }
    }

    struct Broken;

    impl Explainer for Broken {
        fn explain(&self, _prompt: &str) -> SimResult<String> {
            Err(SimError::ModelNotLoaded("explainer".into()))
        }
    }

    fn summary() -> Summary {
        Summary {
            mean_r: 0.123456,
            mean_v: -3.0,
            r_series: Vec::new(),
            v_series: Vec::new(),
            regime: Regime::Normal,
        }
    }

    #[test]
    fn prompt_format() {
        assert_eq!(
            prompt(&summary()),
            "Explain the neural dynamics for mean_r=0.123, mean_V=-3.000, state=normal"
        );
    }

    #[test]
    fn degrades_to_placeholder() {
        let s = summary();
        assert_eq!(explain_or_placeholder(None, &s), PLACEHOLDER);
        assert_eq!(explain_or_placeholder(Some(&Broken), &s), PLACEHOLDER);
        assert!(explain_or_placeholder(Some(&Echo), &s).starts_with("echo: Explain"));
    }
}
