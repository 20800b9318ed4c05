// ========================================================================================
//
//                          The command-line entry point: tmle-prep
//
// ========================================================================================
//
// Argument parsing only: flags are mapped onto an explicit RunConfig and handed to the
// pipeline together with the genotype source resolved from the --bgen-prefix pair.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tmle_prep::config::{InputPaths, Mode, RunConfig};
use tmle_prep::genotype::DosageFileSource;
use tmle_prep::pipeline;
use tmle_prep::types::GenotypeCoding;

#[derive(Parser)]
#[clap(
    name = "tmle-prep",
    version,
    about = "Prepares datasets and causal-parameter files for TMLE-based genetic association studies."
)]
struct Cli {
    #[clap(flatten)]
    common: CommonArgs,

    #[clap(subcommand)]
    mode: ModeCommand,
}

#[derive(Args)]
struct CommonArgs {
    /// Prefix of the genotype dosage export: resolves to
    /// `<prefix>.variants.csv` and `<prefix>.dosages.csv`.
    #[clap(long, value_name = "PREFIX")]
    bgen_prefix: PathBuf,

    /// Minimum posterior probability required to call a genotype.
    #[clap(long, default_value = "0.9")]
    call_threshold: f64,

    /// Minimum empirical frequency required of every implied treatment cell.
    #[clap(long, default_value = "0.0")]
    positivity_constraint: f64,

    /// Split phenotype lists into chunks of at most this size.
    #[clap(long, value_name = "N")]
    phenotype_batch_size: Option<usize>,

    /// Write genotype calls as minor-allele counts instead of allele pairs.
    #[clap(long)]
    genotypes_as_int: bool,

    /// CSV of genetic principal components keyed by SAMPLE_ID.
    #[clap(long, value_name = "CSV")]
    genetic_confounders: PathBuf,

    /// CSV of binary phenotypes keyed by SAMPLE_ID.
    #[clap(long, value_name = "CSV")]
    binary_phenotypes: Option<PathBuf>,

    /// CSV of continuous phenotypes keyed by SAMPLE_ID.
    #[clap(long, value_name = "CSV")]
    continuous_phenotypes: Option<PathBuf>,

    /// Plain-text list of phenotype columns to use as extra confounders.
    #[clap(long, value_name = "LIST")]
    extra_confounders: Option<PathBuf>,

    /// Plain-text list of phenotype columns to use as covariates.
    #[clap(long, value_name = "LIST")]
    extra_covariates: Option<PathBuf>,

    /// Plain-text list of phenotype columns to use as extra treatments.
    #[clap(long, value_name = "LIST")]
    extra_treatments: Option<PathBuf>,

    /// Prefix every output file is written under.
    #[clap(long, value_name = "PREFIX")]
    out_prefix: PathBuf,
}

#[derive(Subcommand)]
enum ModeCommand {
    /// Re-use existing parameter template files discovered by prefix.
    WithParamFiles {
        #[clap(long, value_name = "PREFIX")]
        param_prefix: PathBuf,
    },
    /// Cross ASB bQTLs against a trans-actor list (orders 1 and 2).
    WithAsbTrans {
        #[clap(long, value_name = "PREFIX")]
        asb_prefix: PathBuf,

        #[clap(long, value_name = "CSV")]
        trans_actors: PathBuf,
    },
    /// Generate parameters from actor lists (bQTLs, trans-actors,
    /// extra treatments; at least two sources required).
    FromActors {
        #[clap(long, value_name = "CSV")]
        bqtls: Option<PathBuf>,

        #[clap(long, value_name = "PREFIX")]
        trans_actors_prefix: Option<PathBuf>,

        /// Interaction orders, e.g. `--orders 1,2`.
        #[clap(long, value_delimiter = ',', default_value = "1")]
        orders: Vec<usize>,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mode = match cli.mode {
        ModeCommand::WithParamFiles { param_prefix } => Mode::WithParamFiles { param_prefix },
        ModeCommand::WithAsbTrans {
            asb_prefix,
            trans_actors,
        } => Mode::WithAsbTrans {
            asb_prefix,
            trans_actors,
        },
        ModeCommand::FromActors {
            bqtls,
            trans_actors_prefix,
            orders,
        } => Mode::FromActors {
            bqtls,
            trans_actors_prefix,
            orders,
        },
    };

    let common = cli.common;
    let config = RunConfig {
        call_threshold: common.call_threshold,
        positivity_constraint: common.positivity_constraint,
        phenotype_batch_size: common.phenotype_batch_size,
        genotype_coding: if common.genotypes_as_int {
            GenotypeCoding::MinorAlleleCount
        } else {
            GenotypeCoding::AllelePair
        },
        paths: InputPaths {
            genetic_confounders: common.genetic_confounders,
            binary_phenotypes: common.binary_phenotypes,
            continuous_phenotypes: common.continuous_phenotypes,
            extra_confounders: common.extra_confounders,
            extra_covariates: common.extra_covariates,
            extra_treatments: common.extra_treatments,
        },
        out_prefix: common.out_prefix,
        mode,
    };

    let source = DosageFileSource::open(&common.bgen_prefix)?;
    let summary = pipeline::run(&config, &source)?;
    println!(
        "Wrote {} parameter(s) as {} binary and {} continuous file(s) over {} samples.",
        summary.parameters, summary.binary_files, summary.continuous_files, summary.samples
    );
    Ok(())
}
