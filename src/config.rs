//! # Run Configuration
//!
//! Every tunable of a preparation run lives in one explicit [`RunConfig`]
//! struct that is threaded through the pipeline. There is no module-level
//! default for the call threshold or the output prefix; components receive
//! the configuration they need as arguments.

use crate::types::GenotypeCoding;
use std::path::PathBuf;
use thiserror::Error;

/// Paths shared by every run mode. `genetic_confounders` is the only
/// required table; the extra lists are optional single-column name files.
#[derive(Debug, Clone)]
pub struct InputPaths {
    /// CSV of genetic principal components, keyed by SAMPLE_ID. Required.
    pub genetic_confounders: PathBuf,
    /// CSV of binary phenotypes, keyed by SAMPLE_ID.
    pub binary_phenotypes: Option<PathBuf>,
    /// CSV of continuous phenotypes, keyed by SAMPLE_ID.
    pub continuous_phenotypes: Option<PathBuf>,
    /// Plain-text list naming phenotype columns to treat as confounders.
    pub extra_confounders: Option<PathBuf>,
    /// Plain-text list naming phenotype columns to treat as covariates.
    pub extra_covariates: Option<PathBuf>,
    /// Plain-text list naming phenotype columns to treat as treatments.
    pub extra_treatments: Option<PathBuf>,
}

/// The three ways of obtaining causal-parameter templates.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Re-use existing parameter template files discovered by prefix.
    WithParamFiles { param_prefix: PathBuf },
    /// ASB SNPs as bQTLs crossed with a single trans-actor list
    /// (interaction orders 1 and 2).
    WithAsbTrans {
        asb_prefix: PathBuf,
        trans_actors: PathBuf,
    },
    /// Generate parameters from actor lists: a bQTL table, trans-actor
    /// tables discovered by prefix, and the extra-treatments list. At least
    /// two of the three sources must be present.
    FromActors {
        bqtls: Option<PathBuf>,
        trans_actors_prefix: Option<PathBuf>,
        orders: Vec<usize>,
    },
}

/// The full configuration of one preparation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Minimum posterior probability required to call a genotype.
    pub call_threshold: f64,
    /// Minimum empirical frequency required of every cell implied by a
    /// parameter's treatment setting. Zero still demands nonzero support.
    pub positivity_constraint: f64,
    /// Split phenotype lists into chunks of at most this size before the
    /// per-outcome expansion. `None` means one batch per outcome type.
    pub phenotype_batch_size: Option<usize>,
    pub genotype_coding: GenotypeCoding,
    pub paths: InputPaths,
    pub out_prefix: PathBuf,
    pub mode: Mode,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("call threshold must lie in [0, 1], got {0}")]
    ThresholdOutOfRange(f64),
    #[error("positivity constraint must be non-negative, got {0}")]
    NegativePositivity(f64),
    #[error("phenotype batch size must be a positive integer")]
    ZeroBatchSize,
    #[error("at least one of binary-phenotypes and continuous-phenotypes must be provided")]
    NoPhenotypeSource,
    #[error("interaction orders must be positive, got {0}")]
    ZeroOrder(usize),
    #[error("at least one interaction order is required in from-actors mode")]
    NoOrders,
}

impl RunConfig {
    /// Rejects configurations the pipeline could not act on. Called once,
    /// before any file is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.call_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.call_threshold));
        }
        if self.positivity_constraint < 0.0 {
            return Err(ConfigError::NegativePositivity(self.positivity_constraint));
        }
        if self.phenotype_batch_size == Some(0) {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.paths.binary_phenotypes.is_none() && self.paths.continuous_phenotypes.is_none() {
            return Err(ConfigError::NoPhenotypeSource);
        }
        if let Mode::FromActors { orders, .. } = &self.mode {
            if orders.is_empty() {
                return Err(ConfigError::NoOrders);
            }
            if let Some(&order) = orders.iter().find(|&&o| o == 0) {
                return Err(ConfigError::ZeroOrder(order));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: Mode) -> RunConfig {
        RunConfig {
            call_threshold: 0.9,
            positivity_constraint: 0.0,
            phenotype_batch_size: None,
            genotype_coding: GenotypeCoding::AllelePair,
            paths: InputPaths {
                genetic_confounders: PathBuf::from("pcs.csv"),
                binary_phenotypes: Some(PathBuf::from("binary.csv")),
                continuous_phenotypes: None,
                extra_confounders: None,
                extra_covariates: None,
                extra_treatments: None,
            },
            out_prefix: PathBuf::from("out/final"),
            mode,
        }
    }

    #[test]
    fn accepts_a_minimal_from_actors_config() {
        let config = base_config(Mode::FromActors {
            bqtls: Some(PathBuf::from("bqtls.csv")),
            trans_actors_prefix: Some(PathBuf::from("trans_")),
            orders: vec![1, 2],
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = base_config(Mode::WithParamFiles {
            param_prefix: PathBuf::from("params"),
        });
        config.call_threshold = 1.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_missing_phenotype_sources() {
        let mut config = base_config(Mode::WithParamFiles {
            param_prefix: PathBuf::from("params"),
        });
        config.paths.binary_phenotypes = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoPhenotypeSource)
        ));
    }

    #[test]
    fn rejects_zero_interaction_order() {
        let config = base_config(Mode::FromActors {
            bqtls: Some(PathBuf::from("bqtls.csv")),
            trans_actors_prefix: None,
            orders: vec![1, 0],
        });
        assert!(matches!(config.validate(), Err(ConfigError::ZeroOrder(0))));
    }
}
