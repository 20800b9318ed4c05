//! # Genotype Decoding
//!
//! This module is the exclusive entry point for genotype data. The BGEN
//! codec itself lives outside the crate; whatever produces per-variant
//! dosage probability matrices is reached through the [`GenotypeSource`]
//! trait, and everything downstream only ever sees decoded calls.
//!
//! Decoding is a thresholded argmax: a sample is called with the genotype
//! class of its highest probability iff that probability reaches the call
//! threshold, and is missing otherwise. Rows containing undefined (NaN)
//! probabilities are missing by design, never an error.

use crate::types::{AllelePosition, GenotypeCoding, SAMPLE_ID};
use ahash::AHashMap;
use ndarray::Array2;
use polars::prelude::*;
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("variant '{0}' was not found in the genotype source")]
    VariantNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("genotype source '{path}' is malformed: {message}")]
    MalformedSource { path: PathBuf, message: String },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
}

/// Immutable description of one variant as read from the genotype source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantInfo {
    pub rsid: String,
    pub chromosome: String,
    /// The two alleles in source file order.
    pub alleles: [String; 2],
    /// Which listed allele is the minor allele.
    pub minor: AllelePosition,
}

impl VariantInfo {
    pub fn minor_allele(&self) -> &str {
        match self.minor {
            AllelePosition::First => &self.alleles[0],
            AllelePosition::Second => &self.alleles[1],
        }
    }

    pub fn major_allele(&self) -> &str {
        match self.minor {
            AllelePosition::First => &self.alleles[1],
            AllelePosition::Second => &self.alleles[0],
        }
    }

    /// Maps a probability-column index onto a genotype class.
    ///
    /// Classes count minor-allele copies: class 0 is homozygous major,
    /// class 2 homozygous minor. When the minor allele is listed second the
    /// column-to-class mapping is the reverse of the minor-first layout.
    fn class_encoding(&self) -> [u8; 3] {
        match self.minor {
            AllelePosition::First => [0, 1, 2],
            AllelePosition::Second => [2, 1, 0],
        }
    }

    /// Allele-pair labels indexed by genotype class, major allele first.
    fn pair_labels(&self) -> [String; 3] {
        let major = self.major_allele();
        let minor = self.minor_allele();
        [
            format!("{major}{major}"),
            format!("{major}{minor}"),
            format!("{minor}{minor}"),
        ]
    }
}

/// One variant's dosage probabilities: rows are samples, the three columns
/// are the genotype-class probabilities in source column order.
#[derive(Debug, Clone)]
pub struct VariantDosages {
    pub info: VariantInfo,
    pub probabilities: Array2<f64>,
}

/// The external-collaborator boundary around the genotype file reader.
///
/// Implementations must present a stable sample order; every probability
/// matrix they return is row-aligned with `samples()`.
pub trait GenotypeSource: Sync {
    fn samples(&self) -> &[String];
    fn has_variant(&self, rsid: &str) -> bool;
    fn read_variant(&self, rsid: &str) -> Result<VariantDosages, GenotypeError>;
}

/// Decodes one variant into per-sample genotype classes.
///
/// Returns one entry per probability row: the class of the maximum
/// probability when that maximum reaches `threshold`, `None` otherwise.
/// Rows containing NaN always decode to `None`.
pub fn call_variant(dosages: &VariantDosages, threshold: f64) -> Vec<Option<u8>> {
    let encoding = dosages.info.class_encoding();
    dosages
        .probabilities
        .outer_iter()
        .map(|row| {
            if row.iter().any(|p| p.is_nan()) {
                return None;
            }
            let mut best = 0usize;
            let mut best_p = row[0];
            for (class, &p) in row.iter().enumerate().skip(1) {
                if p > best_p {
                    best = class;
                    best_p = p;
                }
            }
            (best_p >= threshold).then(|| encoding[best])
        })
        .collect()
}

/// Renders decoded calls as a dataset column named after the variant.
pub fn encode_calls(info: &VariantInfo, calls: &[Option<u8>], coding: GenotypeCoding) -> Series {
    let name: PlSmallStr = info.rsid.as_str().into();
    match coding {
        GenotypeCoding::MinorAlleleCount => {
            let values: Vec<Option<i64>> = calls.iter().map(|c| c.map(i64::from)).collect();
            Series::new(name, values)
        }
        GenotypeCoding::AllelePair => {
            let labels = info.pair_labels();
            let values: Vec<Option<String>> = calls
                .iter()
                .map(|c| c.map(|class| labels[class as usize].clone()))
                .collect();
            Series::new(name, values)
        }
    }
}

/// Decodes a list of variants into one SAMPLE_ID-keyed table.
///
/// The first column is SAMPLE_ID; one column per requested variant follows in
/// request order. A variant missing from the source is a fatal lookup error.
/// Variants decode independently, so the work fans out across a thread pool.
pub fn call_genotypes<S>(
    source: &S,
    rsids: &[String],
    threshold: f64,
    coding: GenotypeCoding,
) -> Result<DataFrame, GenotypeError>
where
    S: GenotypeSource + ?Sized,
{
    let decoded: Vec<Series> = rsids
        .par_iter()
        .map(|rsid| {
            let dosages = source.read_variant(rsid)?;
            let calls = call_variant(&dosages, threshold);
            Ok(encode_calls(&dosages.info, &calls, coding))
        })
        .collect::<Result<_, GenotypeError>>()?;

    let mut columns = Vec::with_capacity(rsids.len() + 1);
    columns.push(Series::new(SAMPLE_ID.into(), source.samples().to_vec()).into());
    columns.extend(decoded.into_iter().map(Into::into));
    Ok(DataFrame::new(columns)?)
}

/// An in-process genotype source. Used as the test fixture throughout the
/// crate and by embedders that already hold dosage matrices in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryGenotypes {
    samples: Vec<String>,
    variants: AHashMap<String, VariantDosages>,
}

impl InMemoryGenotypes {
    pub fn new(samples: Vec<String>) -> Self {
        Self {
            samples,
            variants: AHashMap::new(),
        }
    }

    /// Registers a variant. The matrix must have one row per sample and
    /// three probability columns.
    pub fn add_variant(&mut self, info: VariantInfo, probabilities: Array2<f64>) {
        assert_eq!(
            probabilities.nrows(),
            self.samples.len(),
            "probability matrix rows must match the sample count"
        );
        assert_eq!(probabilities.ncols(), 3, "expected three genotype classes");
        let rsid = info.rsid.clone();
        self.variants.insert(
            rsid,
            VariantDosages {
                info,
                probabilities,
            },
        );
    }
}

impl GenotypeSource for InMemoryGenotypes {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn has_variant(&self, rsid: &str) -> bool {
        self.variants.contains_key(rsid)
    }

    fn read_variant(&self, rsid: &str) -> Result<VariantDosages, GenotypeError> {
        self.variants
            .get(rsid)
            .cloned()
            .ok_or_else(|| GenotypeError::VariantNotFound(rsid.to_string()))
    }
}

/// A [`GenotypeSource`] over the indexed dosage-matrix export of the
/// upstream BGEN extractor: a `<prefix>.variants.csv` index and a
/// `<prefix>.dosages.csv` matrix sharing the prefix.
///
/// The index lists RSID, CHR, ALLELE_1, ALLELE_2 and MINOR_ALLELE per
/// variant; the matrix holds one `RSID,SAMPLE_ID,P0,P1,P2` row per sample
/// and variant, grouped by variant with a consistent sample order. Empty or
/// `NA` probability cells mean "no call" and surface as NaN rows.
#[derive(Debug)]
pub struct DosageFileSource {
    samples: Vec<String>,
    variants: AHashMap<String, VariantDosages>,
}

impl DosageFileSource {
    pub fn open(prefix: &Path) -> Result<Self, GenotypeError> {
        let index_path = suffixed(prefix, ".variants.csv");
        let matrix_path = suffixed(prefix, ".dosages.csv");

        let infos = read_variant_index(&index_path)?;
        let (samples, matrices) = read_dosage_matrix(&matrix_path)?;

        let mut variants = AHashMap::with_capacity(infos.len());
        for info in infos {
            let probabilities = matrices.get(&info.rsid).cloned().ok_or_else(|| {
                GenotypeError::MalformedSource {
                    path: matrix_path.clone(),
                    message: format!("variant '{}' listed in the index has no dosage rows", info.rsid),
                }
            })?;
            variants.insert(info.rsid.clone(), VariantDosages { info, probabilities });
        }

        Ok(Self { samples, variants })
    }
}

impl GenotypeSource for DosageFileSource {
    fn samples(&self) -> &[String] {
        &self.samples
    }

    fn has_variant(&self, rsid: &str) -> bool {
        self.variants.contains_key(rsid)
    }

    fn read_variant(&self, rsid: &str) -> Result<VariantDosages, GenotypeError> {
        self.variants
            .get(rsid)
            .cloned()
            .ok_or_else(|| GenotypeError::VariantNotFound(rsid.to_string()))
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn malformed(path: &Path, message: impl Into<String>) -> GenotypeError {
    GenotypeError::MalformedSource {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn read_variant_index(path: &Path) -> Result<Vec<VariantInfo>, GenotypeError> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| malformed(path, format!("missing required column '{name}'")))
    };
    let (rsid_at, chr_at) = (column("RSID")?, column("CHR")?);
    let (a1_at, a2_at) = (column("ALLELE_1")?, column("ALLELE_2")?);
    let minor_at = column("MINOR_ALLELE")?;

    let mut infos = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |at: usize| record.get(at).unwrap_or_default().to_string();
        let alleles = [field(a1_at), field(a2_at)];
        let minor_allele = field(minor_at);
        let minor = if minor_allele == alleles[0] {
            AllelePosition::First
        } else if minor_allele == alleles[1] {
            AllelePosition::Second
        } else {
            return Err(malformed(
                path,
                format!(
                    "minor allele '{minor_allele}' of '{}' matches neither listed allele",
                    field(rsid_at)
                ),
            ));
        };
        infos.push(VariantInfo {
            rsid: field(rsid_at),
            chromosome: field(chr_at),
            alleles,
            minor,
        });
    }
    Ok(infos)
}

type DosageMatrices = (Vec<String>, AHashMap<String, Array2<f64>>);

fn read_dosage_matrix(path: &Path) -> Result<DosageMatrices, GenotypeError> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let headers = reader.headers()?.clone();
    let expected = ["RSID", "SAMPLE_ID", "P0", "P1", "P2"];
    if headers.iter().collect::<Vec<_>>() != expected {
        return Err(malformed(
            path,
            format!("expected header {expected:?}, got {headers:?}"),
        ));
    }

    // Rows are grouped by variant; the first block fixes the sample order
    // and every later block must repeat it exactly.
    let mut samples: Vec<String> = Vec::new();
    let mut first_block_done = false;
    let mut matrices: AHashMap<String, Array2<f64>> = AHashMap::new();
    let mut current_rsid: Option<String> = None;
    let mut current_rows: Vec<f64> = Vec::new();
    let mut current_samples: Vec<String> = Vec::new();

    let mut flush = |rsid: Option<String>,
                     rows: &mut Vec<f64>,
                     block_samples: &mut Vec<String>,
                     samples: &mut Vec<String>,
                     first_block_done: &mut bool|
     -> Result<(), GenotypeError> {
        let Some(rsid) = rsid else { return Ok(()) };
        if !*first_block_done {
            *samples = std::mem::take(block_samples);
            *first_block_done = true;
        } else if block_samples != samples {
            return Err(malformed(
                path,
                format!("variant '{rsid}' lists samples in a different order"),
            ));
        } else {
            block_samples.clear();
        }
        let n = samples.len();
        let matrix = Array2::from_shape_vec((n, 3), std::mem::take(rows))
            .map_err(|e| malformed(path, format!("variant '{rsid}': {e}")))?;
        matrices.insert(rsid, matrix);
        Ok(())
    };

    for record in reader.records() {
        let record = record?;
        let rsid = record.get(0).unwrap_or_default().to_string();
        if current_rsid.as_deref() != Some(rsid.as_str()) {
            flush(
                current_rsid.take(),
                &mut current_rows,
                &mut current_samples,
                &mut samples,
                &mut first_block_done,
            )?;
            current_rsid = Some(rsid);
        }
        current_samples.push(record.get(1).unwrap_or_default().to_string());
        for at in 2..5 {
            current_rows.push(parse_probability(record.get(at).unwrap_or_default(), path)?);
        }
    }
    flush(
        current_rsid.take(),
        &mut current_rows,
        &mut current_samples,
        &mut samples,
        &mut first_block_done,
    )?;

    Ok((samples, matrices))
}

fn parse_probability(raw: &str, path: &Path) -> Result<f64, GenotypeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") {
        return Ok(f64::NAN);
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| malformed(path, format!("'{trimmed}' is not a probability")))
}
