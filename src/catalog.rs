//! Resolution of actor lists (bQTLs, trans-actors, ASB SNPs, extra
//! treatments) from CSV tables, plain-text lists and file-prefix
//! conventions into normalized treatment inputs.

use ahash::AHashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("'{path}' has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("no file name starts with '{0}'")]
    NoFilesMatchingPrefix(PathBuf),
    #[error(
        "at least two of bqtls, extra treatments and trans-actors must be supplied \
         to generate treatment combinations"
    )]
    NotEnoughSources,
}

/// The treatment-producing inputs of a parameter-generation run.
///
/// Each trans-actor table is kept as its own list: every table is one
/// selectable slot when combinations are formed, and merging them would
/// change the combination space.
#[derive(Debug, Clone, Default)]
pub struct ActorSources {
    pub bqtls: Vec<String>,
    pub trans_tables: Vec<Vec<String>>,
    pub extra_treatments: Vec<String>,
}

/// Reads a single-column plain-text list, one name per line. Blank lines
/// and surrounding whitespace are ignored.
pub fn read_name_list(path: &Path) -> Result<Vec<String>, CatalogError> {
    let reader = BufReader::new(File::open(path)?);
    let mut names = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            names.push(trimmed.to_string());
        }
    }
    Ok(names)
}

/// Concatenates every prefix-matched single-column SNP list into one
/// deduplicated, insertion-ordered list. Files are visited in lexicographic
/// name order so the result is deterministic.
pub fn asb_snps(prefix: &Path) -> Result<Vec<String>, CatalogError> {
    let mut seen = AHashSet::new();
    let mut snps = Vec::new();
    for path in files_with_prefix(prefix)? {
        for snp in read_name_list(&path)? {
            if seen.insert(snp.clone()) {
                snps.push(snp);
            }
        }
    }
    Ok(snps)
}

/// Reads the `ID` column of a CSV, returning unique IDs in file order.
pub fn trans_actors(path: &Path) -> Result<Vec<String>, CatalogError> {
    read_id_column(path, &[])
}

/// One trans-actor table per prefix-matched file, in lexicographic file
/// order. Tables are deliberately not merged.
pub fn trans_actor_tables(prefix: &Path) -> Result<Vec<Vec<String>>, CatalogError> {
    files_with_prefix(prefix)?
        .iter()
        .map(|path| trans_actors(path))
        .collect()
}

/// Reads a bQTL table: a CSV carrying at least `ID` and `CHR` columns.
pub fn bqtls(path: &Path) -> Result<Vec<String>, CatalogError> {
    read_id_column(path, &["CHR"])
}

/// Resolves the from-actors treatment sources. At least two of the three
/// inputs must be present; fewer is a configuration error.
pub fn treatments_from_actors(
    bqtl_file: Option<&Path>,
    env_file: Option<&Path>,
    trans_actors_prefix: Option<&Path>,
) -> Result<ActorSources, CatalogError> {
    let supplied = [
        bqtl_file.is_some(),
        env_file.is_some(),
        trans_actors_prefix.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if supplied < 2 {
        return Err(CatalogError::NotEnoughSources);
    }

    Ok(ActorSources {
        bqtls: bqtl_file.map(bqtls).transpose()?.unwrap_or_default(),
        trans_tables: trans_actors_prefix
            .map(trans_actor_tables)
            .transpose()?
            .unwrap_or_default(),
        extra_treatments: env_file.map(read_name_list).transpose()?.unwrap_or_default(),
    })
}

fn read_id_column(path: &Path, also_required: &[&str]) -> Result<Vec<String>, CatalogError> {
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let headers = reader.headers()?.clone();
    let position = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| CatalogError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };
    for column in also_required {
        position(column)?;
    }
    let id_at = position("ID")?;

    let mut seen = AHashSet::new();
    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_at).unwrap_or_default().trim().to_string();
        if !id.is_empty() && seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Enumerates files whose names start with the prefix's file-name
/// component, sorted lexicographically. Matching nothing is an error: a
/// silent empty match would make a whole treatment source disappear.
pub(crate) fn files_with_prefix(prefix: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let dir = match prefix.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = prefix
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut matches = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&stem) {
            matches.push(entry.path());
        }
    }
    if matches.is_empty() {
        return Err(CatalogError::NoFilesMatchingPrefix(prefix.to_path_buf()));
    }
    matches.sort();
    Ok(matches)
}
