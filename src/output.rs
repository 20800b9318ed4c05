//! Serialization of run outputs: role-keyed data tables
//! (`<prefix>.<role>.csv`) and sequentially numbered parameter files
//! (`<prefix>.<outcome-type>.parameter_<n>.yaml`). Planning is pure and
//! separate from I/O so the file sequence can be tested without touching
//! disk.

use crate::dataset::{AssembledData, DatasetError};
use crate::params::{phenotype_batches, ParameterTemplate};
use crate::types::OutcomeType;
use polars::prelude::*;
use serde_yaml::{Mapping, Value};
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// One parameter file to be written: the template expanded against a batch
/// of outcomes, with its 1-based index in the outcome type's sequence.
#[derive(Debug, Clone)]
pub struct ParameterFilePlan {
    pub index: usize,
    pub outcome_type: OutcomeType,
    pub template: ParameterTemplate,
    pub targets: Vec<String>,
}

/// Expands templates against the phenotype batches of both outcome streams.
///
/// Iteration is template-major so the refit-minimizing template order
/// survives in the numbered file sequence; binary and continuous files are
/// numbered independently, each starting at 1.
pub fn plan_parameter_files(
    templates: &[ParameterTemplate],
    binary_phenotypes: &[String],
    continuous_phenotypes: &[String],
    batch_size: Option<usize>,
) -> Vec<ParameterFilePlan> {
    let streams = [
        (OutcomeType::Binary, binary_phenotypes),
        (OutcomeType::Continuous, continuous_phenotypes),
    ];
    let mut plans = Vec::new();
    for (outcome_type, phenotypes) in streams {
        let batches = phenotype_batches(phenotypes, batch_size);
        let mut index = 0;
        for template in templates {
            for batch in &batches {
                index += 1;
                plans.push(ParameterFilePlan {
                    index,
                    outcome_type,
                    template: template.clone(),
                    targets: batch.clone(),
                });
            }
        }
    }
    plans
}

/// Renders one parameter specification as written to disk.
pub fn parameter_spec_yaml(template: &ParameterTemplate, targets: &[String]) -> Value {
    let string_seq = |names: &[String]| {
        Value::Sequence(names.iter().map(|n| Value::String(n.clone())).collect())
    };

    let mut parameter = Mapping::new();
    parameter.insert(
        Value::from("name"),
        Value::String(template.kind.label().to_string()),
    );
    for setting in template.settings() {
        let mut assignment = Mapping::new();
        assignment.insert(Value::from("case"), setting.case.to_yaml());
        assignment.insert(Value::from("control"), setting.control.to_yaml());
        parameter.insert(Value::String(setting.name.clone()), Value::Mapping(assignment));
    }

    let mut root = Mapping::new();
    root.insert(
        Value::from("Treatments"),
        string_seq(&template.treatment_names()),
    );
    root.insert(
        Value::from("Parameters"),
        Value::Sequence(vec![Value::Mapping(parameter)]),
    );
    root.insert(Value::from("Confounders"), string_seq(&template.confounders));
    if !template.covariates.is_empty() {
        root.insert(Value::from("Covariates"), string_seq(&template.covariates));
    }
    root.insert(Value::from("Targets"), string_seq(targets));
    Value::Mapping(root)
}

/// Writes the assembled tables and planned parameter files under one
/// output prefix.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    out_prefix: PathBuf,
}

impl OutputWriter {
    pub fn new(out_prefix: impl Into<PathBuf>) -> Self {
        Self {
            out_prefix: out_prefix.into(),
        }
    }

    fn suffixed(&self, suffix: &str) -> PathBuf {
        let mut name = self.out_prefix.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Writes the role tables. Covariates and the two phenotype tables are
    /// only written when their role has columns.
    pub fn write_role_tables(&self, assembled: &AssembledData) -> Result<(), OutputError> {
        self.write_table(".confounders.csv", assembled, &assembled.confounders)?;
        self.write_table(".treatments.csv", assembled, &assembled.treatments)?;
        if !assembled.covariates.is_empty() {
            self.write_table(".covariates.csv", assembled, &assembled.covariates)?;
        }
        if !assembled.binary_phenotypes.is_empty() {
            self.write_table(
                ".binary-phenotypes.csv",
                assembled,
                &assembled.binary_phenotypes,
            )?;
        }
        if !assembled.continuous_phenotypes.is_empty() {
            self.write_table(
                ".continuous-phenotypes.csv",
                assembled,
                &assembled.continuous_phenotypes,
            )?;
        }
        Ok(())
    }

    fn write_table(
        &self,
        suffix: &str,
        assembled: &AssembledData,
        columns: &[String],
    ) -> Result<(), OutputError> {
        let mut table = assembled.role_table(columns)?;
        let mut file = File::create(self.suffixed(suffix))?;
        CsvWriter::new(&mut file).finish(&mut table)?;
        Ok(())
    }

    /// Writes every planned parameter file, returning the paths written.
    pub fn write_parameter_files(
        &self,
        plans: &[ParameterFilePlan],
    ) -> Result<Vec<PathBuf>, OutputError> {
        let mut written = Vec::with_capacity(plans.len());
        for plan in plans {
            let path = self.parameter_path(plan.outcome_type, plan.index);
            let spec = parameter_spec_yaml(&plan.template, &plan.targets);
            serde_yaml::to_writer(File::create(&path)?, &spec)?;
            written.push(path);
        }
        Ok(written)
    }

    pub fn parameter_path(&self, outcome_type: OutcomeType, index: usize) -> PathBuf {
        self.suffixed(&format!(".{}.parameter_{index}.yaml", outcome_type.suffix()))
    }
}
