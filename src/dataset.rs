//! # Dataset Assembly
//!
//! Builds the one wide, SAMPLE_ID-keyed table every downstream stage works
//! from: genetic confounders, phenotypes, decoded genotypes and the extra
//! columns promoted out of the phenotype tables. Merging is strict inner
//! join: a sample absent from any required source is dropped (with a
//! count-only warning), never imputed.

use crate::catalog::{self, CatalogError};
use crate::types::SAMPLE_ID;
use ahash::AHashSet;
use log::warn;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("'{path}' has no SAMPLE_ID column")]
    MissingSampleId { path: PathBuf },
    #[error("'{path}' contains missing SAMPLE_ID values")]
    NullSampleId { path: PathBuf },
    #[error("'{path}' contains duplicate SAMPLE_ID values")]
    DuplicateSampleIds { path: PathBuf },
    #[error("column '{0}' appears in both phenotype tables")]
    AmbiguousPhenotype(String),
    #[error("outcome column '{0}' is neither numeric nor boolean-like")]
    BadOutcomeType(String),
    #[error("no treatment variables could be resolved from the genotype or extra-treatment data")]
    NoTreatments,
}

/// The assembled dataset plus the role each column plays downstream.
#[derive(Debug)]
pub struct AssembledData {
    /// Wide inner-joined table, sorted by SAMPLE_ID.
    pub dataset: DataFrame,
    /// Genetic principal components followed by the extra confounders.
    pub confounders: Vec<String>,
    pub covariates: Vec<String>,
    /// Genotype-derived treatments first, extra treatments after.
    pub treatments: Vec<String>,
    pub binary_phenotypes: Vec<String>,
    pub continuous_phenotypes: Vec<String>,
}

/// Input tables for one assembly, already resolved by the pipeline.
pub struct AssemblyInputs<'a> {
    pub genetic_confounders: &'a Path,
    pub binary_phenotypes: Option<&'a Path>,
    pub continuous_phenotypes: Option<&'a Path>,
    pub extra_confounders: Option<&'a Path>,
    pub extra_covariates: Option<&'a Path>,
    /// Decoded genotype calls (SAMPLE_ID plus one column per variant).
    pub genotype_calls: Option<DataFrame>,
    /// Phenotype columns to promote into treatments.
    pub extra_treatments: Vec<String>,
}

pub fn assemble(inputs: AssemblyInputs<'_>) -> Result<AssembledData, DatasetError> {
    let confounders_table = read_sample_table(inputs.genetic_confounders)?;
    let binary_table = inputs.binary_phenotypes.map(read_sample_table).transpose()?;
    let continuous_table = inputs
        .continuous_phenotypes
        .map(read_sample_table)
        .transpose()?;
    reject_shared_phenotype_columns(binary_table.as_ref(), continuous_table.as_ref())?;

    let mut binary_outcomes = non_key_columns(binary_table.as_ref());
    let mut continuous_outcomes = non_key_columns(continuous_table.as_ref());
    let phenotype_columns: AHashSet<String> = binary_outcomes
        .iter()
        .chain(continuous_outcomes.iter())
        .cloned()
        .collect();

    // Extra confounders/covariates/treatments name phenotype columns; a
    // promoted column stops being an outcome.
    let extra_confounders = resolve_extra(
        inputs.extra_confounders.map(catalog::read_name_list).transpose()?,
        &phenotype_columns,
        "confounder",
    );
    let extra_covariates = resolve_extra(
        inputs.extra_covariates.map(catalog::read_name_list).transpose()?,
        &phenotype_columns,
        "covariate",
    );
    let extra_treatments = resolve_extra(
        Some(inputs.extra_treatments),
        &phenotype_columns,
        "treatment",
    );
    let promoted: AHashSet<&String> = extra_confounders
        .iter()
        .chain(extra_covariates.iter())
        .chain(extra_treatments.iter())
        .collect();
    binary_outcomes.retain(|name| !promoted.contains(name));
    continuous_outcomes.retain(|name| !promoted.contains(name));

    let snp_treatments = non_key_columns(inputs.genotype_calls.as_ref());
    let mut treatments = snp_treatments;
    treatments.extend(extra_treatments);
    if treatments.is_empty() {
        return Err(DatasetError::NoTreatments);
    }

    let mut confounders = non_key_columns(Some(&confounders_table));
    confounders.extend(extra_confounders);

    // Inner join across every provided table, tracking how many samples
    // fall out of the intersection.
    let mut union_ids: AHashSet<String> = AHashSet::new();
    let mut merged = confounders_table;
    extend_sample_union(&mut union_ids, &merged)?;
    for table in [binary_table, continuous_table, inputs.genotype_calls]
        .into_iter()
        .flatten()
    {
        extend_sample_union(&mut union_ids, &table)?;
        merged = merged
            .lazy()
            .join(
                table.lazy(),
                [col(SAMPLE_ID)],
                [col(SAMPLE_ID)],
                JoinArgs::new(JoinType::Inner),
            )
            .collect()?;
    }
    let dropped = union_ids.len().saturating_sub(merged.height());
    if dropped > 0 {
        warn!("dropped {dropped} samples absent from at least one input table");
    }
    let dataset = merged.sort([SAMPLE_ID], Default::default())?;

    for outcome in binary_outcomes.iter().chain(continuous_outcomes.iter()) {
        if !is_outcome_dtype(dataset.column(outcome)?.dtype()) {
            return Err(DatasetError::BadOutcomeType(outcome.clone()));
        }
    }

    Ok(AssembledData {
        dataset,
        confounders,
        covariates: extra_covariates,
        treatments,
        binary_phenotypes: binary_outcomes,
        continuous_phenotypes: continuous_outcomes,
    })
}

impl AssembledData {
    /// Projects a role table: SAMPLE_ID first, then the requested columns
    /// in role order.
    pub fn role_table(&self, columns: &[String]) -> Result<DataFrame, DatasetError> {
        let mut selection: Vec<&str> = Vec::with_capacity(columns.len() + 1);
        selection.push(SAMPLE_ID);
        selection.extend(columns.iter().map(String::as_str));
        Ok(self.dataset.select(selection)?)
    }
}

/// Reads a SAMPLE_ID-keyed CSV, normalizing the key to strings so tables
/// with numeric and textual IDs join against each other.
fn read_sample_table(path: &Path) -> Result<DataFrame, DatasetError> {
    let mut df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    let has_key = df.get_column_names().iter().any(|c| c == &SAMPLE_ID);
    if !has_key {
        return Err(DatasetError::MissingSampleId {
            path: path.to_path_buf(),
        });
    }
    let ids = df.column(SAMPLE_ID)?.cast(&DataType::String)?;
    if ids.null_count() > 0 {
        return Err(DatasetError::NullSampleId {
            path: path.to_path_buf(),
        });
    }
    df.with_column(ids)?;
    if df.column(SAMPLE_ID)?.n_unique()? != df.height() {
        return Err(DatasetError::DuplicateSampleIds {
            path: path.to_path_buf(),
        });
    }
    Ok(df)
}

fn reject_shared_phenotype_columns(
    binary: Option<&DataFrame>,
    continuous: Option<&DataFrame>,
) -> Result<(), DatasetError> {
    let (Some(binary), Some(continuous)) = (binary, continuous) else {
        return Ok(());
    };
    let binary_columns: AHashSet<String> = non_key_columns(Some(binary)).into_iter().collect();
    for name in non_key_columns(Some(continuous)) {
        if binary_columns.contains(&name) {
            return Err(DatasetError::AmbiguousPhenotype(name));
        }
    }
    Ok(())
}

fn non_key_columns(df: Option<&DataFrame>) -> Vec<String> {
    df.map(|df| {
        df.get_column_names()
            .into_iter()
            .filter(|name| *name != SAMPLE_ID)
            .map(|name| name.to_string())
            .collect()
    })
    .unwrap_or_default()
}

/// Keeps the names that exist as phenotype columns; the rest are dropped
/// with a warning naming them, and processing continues with the subset.
fn resolve_extra(
    requested: Option<Vec<String>>,
    phenotype_columns: &AHashSet<String>,
    role: &str,
) -> Vec<String> {
    let Some(requested) = requested else {
        return Vec::new();
    };
    let (found, missing): (Vec<String>, Vec<String>) = requested
        .into_iter()
        .partition(|name| phenotype_columns.contains(name));
    if !missing.is_empty() {
        warn!(
            "dropping extra {role} variable(s) absent from the phenotype tables: {}",
            missing.join(", ")
        );
    }
    found
}

fn extend_sample_union(
    union_ids: &mut AHashSet<String>,
    df: &DataFrame,
) -> Result<(), DatasetError> {
    let ids = df.column(SAMPLE_ID)?.str()?.clone();
    for id in ids.into_no_null_iter() {
        union_ids.insert(id.to_string());
    }
    Ok(())
}

fn is_outcome_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Boolean
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
    )
}
