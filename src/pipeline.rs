// ========================================================================================
//
//                               The pipeline orchestrator
//
// ========================================================================================
//
// One deterministic pass: resolve treatment sources for the selected mode, decode the
// genotypes they need, assemble the dataset, enumerate (or load) and filter the causal
// parameters, write every output, exit. All inputs are read fully into memory; nothing
// is written until every parameter has survived filtering.

use crate::catalog::{self, ActorSources, CatalogError};
use crate::config::{ConfigError, Mode, RunConfig};
use crate::dataset::{self, AssembledData, AssemblyInputs, DatasetError};
use crate::genotype::{call_genotypes, GenotypeError, GenotypeSource};
use crate::output::{plan_parameter_files, OutputError, OutputWriter};
use crate::params::{
    enumerate_parameters, filter_templates, read_parameter_templates, EnumerationInputs,
    ParameterTemplate, ParamsError, TreatmentSlots,
};
use crate::types::OutcomeType;
use ahash::AHashSet;
use log::{info, warn};
use polars::prelude::DataFrame;
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    pub samples: usize,
    pub parameters: usize,
    pub binary_files: usize,
    pub continuous_files: usize,
}

/// Runs the whole preparation pipeline for the configured mode.
pub fn run<S>(config: &RunConfig, source: &S) -> Result<RunSummary, PipelineError>
where
    S: GenotypeSource + ?Sized,
{
    config.validate()?;
    if let Some(parent) = config.out_prefix.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    match &config.mode {
        Mode::FromActors {
            bqtls,
            trans_actors_prefix,
            orders,
        } => {
            let sources = catalog::treatments_from_actors(
                bqtls.as_deref(),
                config.paths.extra_treatments.as_deref(),
                trans_actors_prefix.as_deref(),
            )?;
            run_generated(config, source, sources, orders.clone())
        }
        Mode::WithAsbTrans {
            asb_prefix,
            trans_actors,
        } => {
            let sources = ActorSources {
                bqtls: catalog::asb_snps(asb_prefix)?,
                trans_tables: vec![catalog::trans_actors(trans_actors)?],
                extra_treatments: read_extra_treatment_names(config)?,
            };
            run_generated(config, source, sources, vec![1, 2])
        }
        Mode::WithParamFiles { param_prefix } => {
            let templates = read_parameter_templates(param_prefix, &[], &[])?;
            run_with_templates(config, source, templates)
        }
    }
}

/// The generating modes: actor sources -> combinations -> parameters.
fn run_generated<S>(
    config: &RunConfig,
    source: &S,
    sources: ActorSources,
    orders: Vec<usize>,
) -> Result<RunSummary, PipelineError>
where
    S: GenotypeSource + ?Sized,
{
    // Probe every SNP treatment up front; unavailable ones are dropped from
    // the combination space with a warning, not decoded into a fatal error.
    let mut requested: Vec<String> = Vec::new();
    let mut seen = AHashSet::new();
    for snp in sources
        .bqtls
        .iter()
        .chain(sources.trans_tables.iter().flatten())
    {
        if seen.insert(snp.clone()) {
            requested.push(snp.clone());
        }
    }
    let (available, missing): (Vec<String>, Vec<String>) = requested
        .into_iter()
        .partition(|snp| source.has_variant(snp));
    if !missing.is_empty() {
        warn!(
            "dropping treatment variant(s) absent from the genotype source: {}",
            missing.join(", ")
        );
    }
    let available_set: AHashSet<&String> = available.iter().collect();

    let calls = decode_calls(config, source, &available)?;
    let assembled = dataset::assemble(AssemblyInputs {
        genetic_confounders: &config.paths.genetic_confounders,
        binary_phenotypes: config.paths.binary_phenotypes.as_deref(),
        continuous_phenotypes: config.paths.continuous_phenotypes.as_deref(),
        extra_confounders: config.paths.extra_confounders.as_deref(),
        extra_covariates: config.paths.extra_covariates.as_deref(),
        genotype_calls: calls,
        extra_treatments: sources.extra_treatments.clone(),
    })?;
    let assembled_treatments: AHashSet<&String> = assembled.treatments.iter().collect();

    let mut slots: Vec<Vec<String>> = sources
        .trans_tables
        .iter()
        .map(|table| {
            table
                .iter()
                .filter(|snp| available_set.contains(snp))
                .cloned()
                .collect::<Vec<String>>()
        })
        .filter(|table| !table.is_empty())
        .collect();
    let extras: Vec<String> = sources
        .extra_treatments
        .iter()
        .filter(|name| assembled_treatments.contains(name))
        .cloned()
        .collect();
    if !extras.is_empty() {
        slots.push(extras);
    }
    let slots = TreatmentSlots {
        bqtls: sources
            .bqtls
            .iter()
            .filter(|snp| available_set.contains(snp))
            .cloned()
            .collect(),
        slots,
    };

    let templates = enumerate_parameters(EnumerationInputs {
        dataset: &assembled.dataset,
        slots,
        orders,
        confounders: assembled.confounders.clone(),
        covariates: assembled.covariates.clone(),
        positivity_constraint: config.positivity_constraint,
    })?;

    write_outputs(config, &assembled, templates)
}

/// The with-param-files mode: externally supplied templates are aligned
/// with the assembled dataset, then pushed through the same filter path.
fn run_with_templates<S>(
    config: &RunConfig,
    source: &S,
    mut templates: Vec<ParameterTemplate>,
) -> Result<RunSummary, PipelineError>
where
    S: GenotypeSource + ?Sized,
{
    let extra_treatments = read_extra_treatment_names(config)?;
    let extra_set: AHashSet<&String> = extra_treatments.iter().collect();

    // Every template treatment that is not a declared extra treatment is a
    // SNP to decode.
    let mut snps: Vec<String> = Vec::new();
    let mut seen = AHashSet::new();
    for template in &templates {
        for name in template.treatment_names() {
            if !extra_set.contains(&name) && seen.insert(name.clone()) {
                snps.push(name);
            }
        }
    }
    let (available, missing): (Vec<String>, Vec<String>) =
        snps.into_iter().partition(|snp| source.has_variant(snp));
    if !missing.is_empty() {
        warn!(
            "dropping treatment variant(s) absent from the genotype source: {}",
            missing.join(", ")
        );
    }

    let calls = decode_calls(config, source, &available)?;
    let assembled = dataset::assemble(AssemblyInputs {
        genetic_confounders: &config.paths.genetic_confounders,
        binary_phenotypes: config.paths.binary_phenotypes.as_deref(),
        continuous_phenotypes: config.paths.continuous_phenotypes.as_deref(),
        extra_confounders: config.paths.extra_confounders.as_deref(),
        extra_covariates: config.paths.extra_covariates.as_deref(),
        genotype_calls: calls,
        extra_treatments,
    })?;

    // Templates referencing a treatment that did not make it into the
    // dataset are skipped; the rest carry the run's confounders and
    // covariates.
    let resolved: AHashSet<&String> = assembled.treatments.iter().collect();
    let mut dropped: Vec<String> = Vec::new();
    templates.retain(|template| {
        let names = template.treatment_names();
        let usable = names.iter().all(|name| resolved.contains(name));
        if !usable {
            dropped.extend(names.into_iter().filter(|name| !resolved.contains(name)));
        }
        usable
    });
    if !dropped.is_empty() {
        dropped.sort();
        dropped.dedup();
        warn!(
            "skipping parameter template(s) whose treatment(s) are unavailable: {}",
            dropped.join(", ")
        );
    }
    for template in &mut templates {
        template.confounders = assembled.confounders.clone();
        template.covariates = assembled.covariates.clone();
    }

    let templates =
        filter_templates(templates, &assembled.dataset, config.positivity_constraint)?;
    write_outputs(config, &assembled, templates)
}

fn read_extra_treatment_names(config: &RunConfig) -> Result<Vec<String>, CatalogError> {
    config
        .paths
        .extra_treatments
        .as_deref()
        .map(catalog::read_name_list)
        .transpose()
        .map(Option::unwrap_or_default)
}

fn decode_calls<S>(
    config: &RunConfig,
    source: &S,
    rsids: &[String],
) -> Result<Option<DataFrame>, GenotypeError>
where
    S: GenotypeSource + ?Sized,
{
    if rsids.is_empty() {
        return Ok(None);
    }
    info!("decoding {} variant(s) at call threshold {}", rsids.len(), config.call_threshold);
    call_genotypes(source, rsids, config.call_threshold, config.genotype_coding).map(Some)
}

fn write_outputs(
    config: &RunConfig,
    assembled: &AssembledData,
    templates: Vec<ParameterTemplate>,
) -> Result<RunSummary, PipelineError> {
    let writer = OutputWriter::new(&config.out_prefix);
    writer.write_role_tables(assembled)?;

    let plans = plan_parameter_files(
        &templates,
        &assembled.binary_phenotypes,
        &assembled.continuous_phenotypes,
        config.phenotype_batch_size,
    );
    writer.write_parameter_files(&plans)?;

    let count_for = |outcome_type: OutcomeType| {
        plans
            .iter()
            .filter(|plan| plan.outcome_type == outcome_type)
            .count()
    };
    let summary = RunSummary {
        samples: assembled.dataset.height(),
        parameters: templates.len(),
        binary_files: count_for(OutcomeType::Binary),
        continuous_files: count_for(OutcomeType::Continuous),
    };
    info!(
        "wrote {} parameter file(s) ({} binary, {} continuous) over {} samples",
        summary.binary_files + summary.continuous_files,
        summary.binary_files,
        summary.continuous_files,
        summary.samples
    );
    Ok(summary)
}
