//! End-to-end pipeline tests over synthetic fixtures: CSV inputs in a
//! temporary directory plus an in-memory genotype source.

use ndarray::Array2;
use polars::prelude::*;
use serde_yaml::Value;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tmle_prep::config::{InputPaths, Mode, RunConfig};
use tmle_prep::genotype::{InMemoryGenotypes, VariantInfo};
use tmle_prep::pipeline::{run, RunSummary};
use tmle_prep::types::{AllelePosition, GenotypeCoding};

const RETAINED: usize = 18;

fn sample_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("S{i:02}")).collect()
}

/// A confident probability row for the given class, or a diffuse row that
/// stays below any reasonable call threshold.
fn prob_row(class: Option<usize>) -> [f64; 3] {
    match class {
        Some(0) => [0.9, 0.05, 0.05],
        Some(1) => [0.05, 0.9, 0.05],
        Some(2) => [0.05, 0.05, 0.9],
        _ => [0.5, 0.3, 0.2],
    }
}

fn matrix(classes: &[Option<usize>]) -> Array2<f64> {
    let mut flat = Vec::with_capacity(classes.len() * 3);
    for class in classes {
        flat.extend_from_slice(&prob_row(*class));
    }
    Array2::from_shape_vec((classes.len(), 3), flat).unwrap()
}

/// Twenty samples; the first eighteen survive the phenotype join. rs1 calls
/// split evenly into AA/AG/GG sixes, rs2 alternates CC/CT, so every joint
/// cell holds exactly three samples.
fn genotype_source() -> InMemoryGenotypes {
    let mut source = InMemoryGenotypes::new(sample_ids(20));

    let rs1_classes: Vec<Option<usize>> = (1..=20)
        .map(|i| match i {
            1..=6 => Some(0),
            7..=12 => Some(1),
            13..=18 => Some(2),
            19 => None,
            _ => Some(0),
        })
        .collect();
    source.add_variant(
        VariantInfo {
            rsid: "rs1".to_string(),
            chromosome: "1".to_string(),
            alleles: ["A".to_string(), "G".to_string()],
            minor: AllelePosition::Second,
        },
        matrix(&rs1_classes),
    );

    let rs2_classes: Vec<Option<usize>> = (1..=20)
        .map(|i| Some(if i % 2 == 1 { 0 } else { 1 }))
        .collect();
    source.add_variant(
        VariantInfo {
            rsid: "rs2".to_string(),
            chromosome: "2".to_string(),
            alleles: ["C".to_string(), "T".to_string()],
            minor: AllelePosition::Second,
        },
        matrix(&rs2_classes),
    );

    source
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    write!(file, "{content}").unwrap();
    path
}

struct Fixture {
    dir: TempDir,
    paths: InputPaths,
}

/// PCs for all twenty samples, phenotypes for the first eighteen. The
/// phenotype tables carry the UK-Biobank-style fields 21003 and 22001 that
/// the extra-confounders list promotes out of the outcome streams.
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();

    let mut pcs = String::from("SAMPLE_ID,PC1,PC2\n");
    for (i, id) in sample_ids(20).iter().enumerate() {
        pcs.push_str(&format!("{id},{:.2},{:.2}\n", 0.01 * i as f64, -0.01 * i as f64));
    }
    let genetic_confounders = write_file(dir.path(), "pcs.csv", &pcs);

    let mut binary = String::from("SAMPLE_ID,disease,disease2,22001\n");
    for (i, id) in sample_ids(RETAINED).iter().enumerate() {
        binary.push_str(&format!("{id},{},{},{}\n", i % 2, (i / 3) % 2, (i + 1) % 2));
    }
    let binary_phenotypes = write_file(dir.path(), "binary.csv", &binary);

    let mut continuous = String::from("SAMPLE_ID,height,21003\n");
    for (i, id) in sample_ids(RETAINED).iter().enumerate() {
        continuous.push_str(&format!("{id},{:.1},{}\n", 160.0 + i as f64, 40 + i));
    }
    let continuous_phenotypes = write_file(dir.path(), "continuous.csv", &continuous);

    let extra_confounders = write_file(dir.path(), "extra_confounders.txt", "21003\n22001\n");

    let paths = InputPaths {
        genetic_confounders,
        binary_phenotypes: Some(binary_phenotypes),
        continuous_phenotypes: Some(continuous_phenotypes),
        extra_confounders: Some(extra_confounders),
        extra_covariates: None,
        extra_treatments: None,
    };
    Fixture { dir, paths }
}

fn from_actors_config(fixture: &Fixture, positivity_constraint: f64) -> RunConfig {
    let bqtls = write_file(fixture.dir.path(), "bqtls.csv", "ID,CHR\nrs1,1\n");
    write_file(fixture.dir.path(), "trans_tf1.csv", "ID\nrs2\nrs_missing\n");

    RunConfig {
        call_threshold: 0.8,
        positivity_constraint,
        phenotype_batch_size: None,
        genotype_coding: GenotypeCoding::AllelePair,
        paths: fixture.paths.clone(),
        out_prefix: fixture.dir.path().join("out").join("final"),
        mode: Mode::FromActors {
            bqtls: Some(bqtls),
            trans_actors_prefix: Some(fixture.dir.path().join("trans_")),
            orders: vec![1, 2],
        },
    }
}

fn column_names(path: &Path) -> Vec<String> {
    let df = CsvReader::new(File::open(path).unwrap())
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()
        .unwrap();
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

fn csv_height(path: &Path) -> usize {
    CsvReader::new(File::open(path).unwrap())
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()
        .unwrap()
        .height()
}

#[test]
fn from_actors_builds_tables_and_parameters() {
    let fixture = fixture();
    let config = from_actors_config(&fixture, 0.0);
    let source = genotype_source();

    let summary = run(&config, &source).unwrap();
    // Order 1: three rs1 value pairs. Order 2: those pairs pinned at the
    // two rs2 values (six ATEs) plus three IATEs.
    assert_eq!(
        summary,
        RunSummary {
            samples: RETAINED,
            parameters: 12,
            binary_files: 12,
            continuous_files: 12,
        }
    );

    let out = fixture.dir.path().join("out");
    assert_eq!(
        column_names(&out.join("final.confounders.csv")),
        vec!["SAMPLE_ID", "PC1", "PC2", "21003", "22001"]
    );
    assert_eq!(csv_height(&out.join("final.confounders.csv")), RETAINED);
    assert_eq!(
        column_names(&out.join("final.treatments.csv")),
        vec!["SAMPLE_ID", "rs1", "rs2"]
    );
    // Promoted fields left the outcome streams.
    assert_eq!(
        column_names(&out.join("final.binary-phenotypes.csv")),
        vec!["SAMPLE_ID", "disease", "disease2"]
    );
    assert_eq!(
        column_names(&out.join("final.continuous-phenotypes.csv")),
        vec!["SAMPLE_ID", "height"]
    );
    assert!(!out.join("final.covariates.csv").exists());

    // Both streams are numbered independently from 1 and end at 12.
    for stream in ["binary", "continuous"] {
        assert!(out.join(format!("final.{stream}.parameter_1.yaml")).exists());
        assert!(out.join(format!("final.{stream}.parameter_12.yaml")).exists());
        assert!(!out.join(format!("final.{stream}.parameter_13.yaml")).exists());
    }

    // The first files are the singleton-treatment ATEs (grouped ordering),
    // and binary files target the binary outcome only.
    let first: Value = serde_yaml::from_reader(
        File::open(out.join("final.binary.parameter_1.yaml")).unwrap(),
    )
    .unwrap();
    let root = first.as_mapping().unwrap();
    let treatments = root
        .get(&Value::from("Treatments"))
        .and_then(Value::as_sequence)
        .unwrap();
    assert_eq!(treatments.len(), 1);
    assert_eq!(treatments[0].as_str(), Some("rs1"));
    let targets = root
        .get(&Value::from("Targets"))
        .and_then(Value::as_sequence)
        .unwrap();
    assert_eq!(targets[0].as_str(), Some("disease"));
    let confounders: Vec<&str> = root
        .get(&Value::from("Confounders"))
        .and_then(Value::as_sequence)
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(confounders, vec!["PC1", "PC2", "21003", "22001"]);
}

#[test]
fn tightening_positivity_prunes_joint_parameters() {
    let fixture = fixture();
    // Joint cells hold 3/18 = 0.167 of the samples, marginal rs1 cells
    // 6/18. A 0.2 constraint therefore kills every two-treatment parameter.
    let config = from_actors_config(&fixture, 0.2);
    let source = genotype_source();

    let summary = run(&config, &source).unwrap();
    assert_eq!(summary.parameters, 3);
    assert_eq!(summary.binary_files, 3);

    let out = fixture.dir.path().join("out");
    assert!(out.join("final.binary.parameter_3.yaml").exists());
    assert!(!out.join("final.binary.parameter_4.yaml").exists());
}

#[test]
fn impossible_positivity_fails_naming_the_constraint() {
    let fixture = fixture();
    let config = from_actors_config(&fixture, 0.9);
    let source = genotype_source();

    let err = run(&config, &source).unwrap_err();
    assert!(err.to_string().contains("0.9"));
}

#[test]
fn batching_multiplies_parameter_files() {
    let fixture = fixture();
    let mut config = from_actors_config(&fixture, 0.2);
    config.phenotype_batch_size = Some(1);
    let source = genotype_source();

    // Three surviving templates. Two binary outcomes split into two
    // batches of one, doubling the binary file count; the single
    // continuous outcome still fits one batch.
    let summary = run(&config, &source).unwrap();
    assert_eq!(summary.binary_files, 6);
    assert_eq!(summary.continuous_files, 3);

    let out = fixture.dir.path().join("out");
    let first: Value = serde_yaml::from_reader(
        File::open(out.join("final.binary.parameter_1.yaml")).unwrap(),
    )
    .unwrap();
    let targets = first
        .as_mapping()
        .unwrap()
        .get(&Value::from("Targets"))
        .and_then(Value::as_sequence)
        .unwrap();
    assert_eq!(targets.len(), 1);
}

#[test]
fn with_asb_trans_crosses_asb_snps_and_trans_actors() {
    let fixture = fixture();
    write_file(fixture.dir.path(), "asb_chr1.txt", "rs1\n");
    write_file(fixture.dir.path(), "asb_chr2.txt", "rs_nope\n");
    let trans = write_file(fixture.dir.path(), "trans_actors.csv", "ID\nrs2\n");

    let config = RunConfig {
        call_threshold: 0.8,
        positivity_constraint: 0.0,
        phenotype_batch_size: None,
        genotype_coding: GenotypeCoding::MinorAlleleCount,
        paths: fixture.paths.clone(),
        out_prefix: fixture.dir.path().join("out").join("final"),
        mode: Mode::WithAsbTrans {
            asb_prefix: fixture.dir.path().join("asb_"),
            trans_actors: trans,
        },
    };
    let source = genotype_source();
    let summary = run(&config, &source).unwrap();
    assert_eq!(summary.parameters, 12);

    let out = fixture.dir.path().join("out");
    assert_eq!(
        column_names(&out.join("final.treatments.csv")),
        vec!["SAMPLE_ID", "rs1", "rs2"]
    );

    // Integer coding surfaces in the parameter files.
    let spec: Value = serde_yaml::from_reader(
        File::open(out.join("final.binary.parameter_1.yaml")).unwrap(),
    )
    .unwrap();
    let parameters = spec
        .as_mapping()
        .unwrap()
        .get(&Value::from("Parameters"))
        .and_then(Value::as_sequence)
        .unwrap();
    let rs1 = parameters[0]
        .as_mapping()
        .unwrap()
        .get(&Value::from("rs1"))
        .and_then(Value::as_mapping)
        .unwrap();
    assert!(rs1.get(&Value::from("case")).unwrap().is_i64());
}

#[test]
fn with_param_files_filters_and_renumbers_templates() {
    let fixture = fixture();
    write_file(
        fixture.dir.path(),
        "param_set1.yaml",
        "Treatments:\n  - rs1\n  - rs2\nParameters:\n  - name: IATE\n    rs1: {case: AG, control: AA}\n    rs2: {case: CT, control: CC}\n  - name: ATE\n    rs1: {case: GG, control: AA}\n    rs2: {case: CC, control: CC}\n",
    );
    write_file(
        fixture.dir.path(),
        "param_set2.yaml",
        "Parameters:\n  - name: ATE\n    rs_missing: {case: AG, control: AA}\n",
    );

    let config = RunConfig {
        call_threshold: 0.8,
        positivity_constraint: 0.0,
        phenotype_batch_size: None,
        genotype_coding: GenotypeCoding::AllelePair,
        paths: fixture.paths.clone(),
        out_prefix: fixture.dir.path().join("out").join("final"),
        mode: Mode::WithParamFiles {
            param_prefix: fixture.dir.path().join("param_"),
        },
    };
    let source = genotype_source();
    let summary = run(&config, &source).unwrap();

    // The rs_missing template is skipped; the two usable ones survive.
    assert_eq!(summary.parameters, 2);
    assert_eq!(summary.binary_files, 2);
    assert_eq!(summary.continuous_files, 2);

    let out = fixture.dir.path().join("out");
    let spec: Value = serde_yaml::from_reader(
        File::open(out.join("final.continuous.parameter_1.yaml")).unwrap(),
    )
    .unwrap();
    let confounders: Vec<&str> = spec
        .as_mapping()
        .unwrap()
        .get(&Value::from("Confounders"))
        .and_then(Value::as_sequence)
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(confounders, vec!["PC1", "PC2", "21003", "22001"]);
}
