// ========================================================================================
//
//                         The causal-parameter enumeration engine
//
// ========================================================================================
//
// This module turns treatment sources and the assembled dataset into the maximal set of
// valid causal parameters. Treatment combinations are generated lazily (bQTLs crossed
// against slot subsets), every candidate parameter is checked against the empirical joint
// frequency of its implied cells, and survivors are deduplicated and reordered so that
// parameters sharing a treatment set sit next to each other in the output sequence.

use crate::catalog::{files_with_prefix, CatalogError};
use crate::types::TreatmentValue;
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use polars::prelude::*;
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("treatment column '{0}' holds values that are neither discrete nor boolean-like")]
    UnsupportedTreatmentColumn(String),
    #[error("parameter file '{path}' is malformed: {message}")]
    MalformedTemplate { path: PathBuf, message: String },
    #[error("no causal parameters remain after applying the positivity constraint {0}")]
    NoParametersLeft(f64),
}

// ========================================================================================
//                              Treatment combinations
// ========================================================================================

/// An ordered treatment tuple. The bQTL convention ("first element is the
/// primary treatment") is a named field here, not a tuple position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreatmentCombination {
    pub primary: String,
    pub others: Vec<String>,
}

impl TreatmentCombination {
    pub fn len(&self) -> usize {
        1 + self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.others.iter().map(String::as_str))
    }

    /// A variable cannot interact with itself; combinations repeating a
    /// name are skipped during generation.
    fn has_duplicate_names(&self) -> bool {
        let mut seen = AHashSet::new();
        self.names().any(|name| !seen.insert(name))
    }
}

/// The treatment-producing units combinations are drawn from: the bQTL list
/// plus one slot per trans-actor table and (when present) one slot holding
/// the extra treatments. Slots are selected without replacement.
#[derive(Debug, Clone, Default)]
pub struct TreatmentSlots {
    pub bqtls: Vec<String>,
    pub slots: Vec<Vec<String>>,
}

impl TreatmentSlots {
    /// Lazily yields every combination of the given interaction order.
    ///
    /// With bQTLs present: order 1 is one singleton per bQTL; order k
    /// crosses every bQTL against the members of every (k-1)-subset of the
    /// slots. Without bQTLs, order k draws across k distinct slots and the
    /// first slot's member takes the primary position.
    pub fn combinations(&self, order: usize) -> Box<dyn Iterator<Item = TreatmentCombination> + '_> {
        if order == 0 {
            return Box::new(std::iter::empty());
        }
        let combos: Box<dyn Iterator<Item = TreatmentCombination> + '_> =
            if !self.bqtls.is_empty() {
                if order == 1 {
                    Box::new(self.bqtls.iter().map(|bqtl| TreatmentCombination {
                        primary: bqtl.clone(),
                        others: Vec::new(),
                    }))
                } else {
                    Box::new(self.slots.iter().combinations(order - 1).flat_map(
                        move |chosen| {
                            let members = chosen
                                .into_iter()
                                .map(|slot| slot.iter().cloned())
                                .multi_cartesian_product();
                            self.bqtls.iter().cloned().cartesian_product(members).map(
                                |(primary, others)| TreatmentCombination { primary, others },
                            )
                        },
                    ))
                }
            } else {
                Box::new(
                    self.slots
                        .iter()
                        .combinations(order)
                        .flat_map(|chosen| {
                            chosen
                                .into_iter()
                                .map(|slot| slot.iter().cloned())
                                .multi_cartesian_product()
                        })
                        .map(|mut members| {
                            let primary = members.remove(0);
                            TreatmentCombination {
                                primary,
                                others: members,
                            }
                        }),
                )
            };
        Box::new(combos.filter(|combo| !combo.has_duplicate_names()))
    }
}

// ========================================================================================
//                               Frequency tables
// ========================================================================================

/// Reads a treatment column of the assembled dataset into discrete values.
/// Nulls stay `None`; float columns are accepted only when integral.
pub fn treatment_column(
    df: &DataFrame,
    name: &str,
) -> Result<Vec<Option<TreatmentValue>>, ParamsError> {
    let column = df.column(name)?;
    match column.dtype() {
        DataType::Boolean => Ok(column
            .bool()?
            .into_iter()
            .map(|v| v.map(TreatmentValue::Bool))
            .collect()),
        DataType::String => Ok(column
            .str()?
            .into_iter()
            .map(|v| v.map(|s| TreatmentValue::Str(s.to_string())))
            .collect()),
        DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64 => {
            let casted = column.cast(&DataType::Int64)?;
            Ok(casted
                .i64()?
                .into_iter()
                .map(|v| v.map(TreatmentValue::Int))
                .collect())
        }
        DataType::Float32 | DataType::Float64 => {
            let casted = column.cast(&DataType::Float64)?;
            casted
                .f64()?
                .into_iter()
                .map(|v| match v {
                    None => Ok(None),
                    Some(f) if f.fract() == 0.0 => Ok(Some(TreatmentValue::Int(f as i64))),
                    Some(_) => Err(ParamsError::UnsupportedTreatmentColumn(name.to_string())),
                })
                .collect()
        }
        _ => Err(ParamsError::UnsupportedTreatmentColumn(name.to_string())),
    }
}

/// Joint empirical frequencies of the observed treatment-value tuples.
/// Rows with a missing value in any treatment are excluded; `total` counts
/// the complete rows.
#[derive(Debug, Clone)]
pub struct FrequencyTable {
    counts: AHashMap<Vec<TreatmentValue>, usize>,
    total: usize,
}

impl FrequencyTable {
    pub fn from_columns(columns: &[&[Option<TreatmentValue>]]) -> Self {
        let height = columns.first().map(|c| c.len()).unwrap_or(0);
        let mut counts: AHashMap<Vec<TreatmentValue>, usize> = AHashMap::new();
        let mut total = 0usize;
        'rows: for row in 0..height {
            let mut key = Vec::with_capacity(columns.len());
            for column in columns {
                match &column[row] {
                    Some(value) => key.push(value.clone()),
                    None => continue 'rows,
                }
            }
            *counts.entry(key).or_insert(0) += 1;
            total += 1;
        }
        Self { counts, total }
    }

    pub fn from_dataset(df: &DataFrame, names: &[String]) -> Result<Self, ParamsError> {
        let columns: Vec<Vec<Option<TreatmentValue>>> = names
            .iter()
            .map(|name| treatment_column(df, name))
            .collect::<Result<_, _>>()?;
        let views: Vec<&[Option<TreatmentValue>]> =
            columns.iter().map(|c| c.as_slice()).collect();
        Ok(Self::from_columns(&views))
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn count(&self, cell: &[TreatmentValue]) -> usize {
        self.counts.get(cell).copied().unwrap_or(0)
    }

    pub fn frequency(&self, cell: &[TreatmentValue]) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(cell) as f64 / self.total as f64
    }

    /// The sorted unique values observed for the treatment at `index`.
    pub fn observed_values(&self, index: usize) -> Vec<TreatmentValue> {
        let unique: BTreeSet<TreatmentValue> = self
            .counts
            .keys()
            .map(|key| key[index].clone())
            .collect();
        unique.into_iter().collect()
    }
}

// ========================================================================================
//                              Parameter templates
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// One treatment (the primary) varies; all others are pinned.
    Ate,
    /// Every treatment in the combination varies.
    Iate,
}

impl ParameterKind {
    pub fn label(&self) -> &'static str {
        match self {
            ParameterKind::Ate => "ATE",
            ParameterKind::Iate => "IATE",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        match label {
            "ATE" => Some(ParameterKind::Ate),
            "IATE" => Some(ParameterKind::Iate),
            _ => None,
        }
    }
}

/// One treatment's case/control assignment within a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreatmentSetting {
    pub name: String,
    pub case: TreatmentValue,
    pub control: TreatmentValue,
}

impl TreatmentSetting {
    pub fn varies(&self) -> bool {
        self.case != self.control
    }

    fn fixed(name: &str, value: TreatmentValue) -> Self {
        Self {
            name: name.to_string(),
            case: value.clone(),
            control: value,
        }
    }

    fn varying(name: &str, control: TreatmentValue, case: TreatmentValue) -> Self {
        Self {
            name: name.to_string(),
            case,
            control,
        }
    }
}

/// A causal parameter before outcome expansion: the target variable is a
/// placeholder substituted with actual phenotype names at write time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterTemplate {
    pub kind: ParameterKind,
    pub primary: TreatmentSetting,
    pub others: Vec<TreatmentSetting>,
    pub confounders: Vec<String>,
    pub covariates: Vec<String>,
}

impl ParameterTemplate {
    /// All settings, primary first.
    pub fn settings(&self) -> impl Iterator<Item = &TreatmentSetting> {
        std::iter::once(&self.primary).chain(self.others.iter())
    }

    pub fn treatment_names(&self) -> Vec<String> {
        self.settings().map(|s| s.name.clone()).collect()
    }
}

/// All unordered pairs of distinct values, lower value as control.
fn value_pairs(values: &[TreatmentValue]) -> Vec<(TreatmentValue, TreatmentValue)> {
    values
        .iter()
        .cloned()
        .tuple_combinations::<(_, _)>()
        .collect()
}

/// The cartesian product of the given value sets; a single empty choice
/// when there are no sets at all.
fn cartesian<T: Clone>(sets: &[Vec<T>]) -> Box<dyn Iterator<Item = Vec<T>> + '_> {
    if sets.is_empty() {
        return Box::new(std::iter::once(Vec::new()));
    }
    Box::new(sets.iter().map(|s| s.iter().cloned()).multi_cartesian_product())
}

/// Generates every candidate ATE and IATE parameter of one combination,
/// before positivity filtering.
pub fn templates_for_combination(
    combo: &TreatmentCombination,
    freq: &FrequencyTable,
    confounders: &[String],
    covariates: &[String],
) -> Vec<ParameterTemplate> {
    let mut out = Vec::new();
    let primary_values = freq.observed_values(0);
    let other_values: Vec<Vec<TreatmentValue>> =
        (1..combo.len()).map(|i| freq.observed_values(i)).collect();

    // ATE: the primary varies over its observed value pairs, the rest are
    // pinned at each of their own observed values.
    for (control, case) in value_pairs(&primary_values) {
        for pinned in cartesian(&other_values) {
            out.push(ParameterTemplate {
                kind: ParameterKind::Ate,
                primary: TreatmentSetting::varying(&combo.primary, control.clone(), case.clone()),
                others: combo
                    .others
                    .iter()
                    .zip(pinned)
                    .map(|(name, value)| TreatmentSetting::fixed(name, value))
                    .collect(),
                confounders: confounders.to_vec(),
                covariates: covariates.to_vec(),
            });
        }
    }

    // IATE: every treatment varies jointly. Only defined for genuine
    // interactions (two or more treatments).
    if combo.len() >= 2 {
        let mut pair_choices = vec![value_pairs(&primary_values)];
        pair_choices.extend(other_values.iter().map(|values| value_pairs(values)));
        for assignment in cartesian(&pair_choices) {
            let mut settings = combo
                .names()
                .zip(assignment)
                .map(|(name, (control, case))| TreatmentSetting::varying(name, control, case));
            let primary = settings.next().expect("combination has a primary");
            out.push(ParameterTemplate {
                kind: ParameterKind::Iate,
                primary,
                others: settings.collect(),
                confounders: confounders.to_vec(),
                covariates: covariates.to_vec(),
            });
        }
    }

    out
}

/// The positivity test: every cell implied by the case/control assignment
/// must be observed, and its empirical frequency must reach the constraint.
/// A constraint of zero therefore still demands nonzero support.
pub fn satisfies_positivity(
    template: &ParameterTemplate,
    freq: &FrequencyTable,
    constraint: f64,
) -> bool {
    let choices: Vec<Vec<TreatmentValue>> = template
        .settings()
        .map(|setting| {
            if setting.varies() {
                vec![setting.control.clone(), setting.case.clone()]
            } else {
                vec![setting.control.clone()]
            }
        })
        .collect();
    let ok = cartesian(&choices).all(|cell| freq.count(&cell) > 0 && freq.frequency(&cell) >= constraint);
    ok
}

// ========================================================================================
//                         Enumeration, dedup and ordering
// ========================================================================================

pub struct EnumerationInputs<'a> {
    pub dataset: &'a DataFrame,
    pub slots: TreatmentSlots,
    pub orders: Vec<usize>,
    pub confounders: Vec<String>,
    pub covariates: Vec<String>,
    pub positivity_constraint: f64,
}

/// Generates, filters, deduplicates and orders the full parameter set.
/// Failing to keep a single parameter is fatal and names the constraint.
pub fn enumerate_parameters(
    inputs: EnumerationInputs<'_>,
) -> Result<Vec<ParameterTemplate>, ParamsError> {
    let mut cache: AHashMap<String, Vec<Option<TreatmentValue>>> = AHashMap::new();
    let mut seen: AHashSet<ParameterTemplate> = AHashSet::new();
    let mut kept = Vec::new();

    for &order in &inputs.orders {
        for combo in inputs.slots.combinations(order) {
            let freq = frequency_for(&combo, inputs.dataset, &mut cache)?;
            for template in
                templates_for_combination(&combo, &freq, &inputs.confounders, &inputs.covariates)
            {
                if satisfies_positivity(&template, &freq, inputs.positivity_constraint)
                    && seen.insert(template.clone())
                {
                    kept.push(template);
                }
            }
        }
    }

    if kept.is_empty() {
        return Err(ParamsError::NoParametersLeft(inputs.positivity_constraint));
    }
    optimize_ordering(&mut kept);
    Ok(kept)
}

/// Applies positivity filtering, dedup and ordering to externally supplied
/// templates (the with-param-files path).
pub fn filter_templates(
    templates: Vec<ParameterTemplate>,
    dataset: &DataFrame,
    constraint: f64,
) -> Result<Vec<ParameterTemplate>, ParamsError> {
    let mut freq_cache: AHashMap<Vec<String>, FrequencyTable> = AHashMap::new();
    let mut seen: AHashSet<ParameterTemplate> = AHashSet::new();
    let mut kept = Vec::new();

    for template in templates {
        let names = template.treatment_names();
        if !freq_cache.contains_key(&names) {
            let freq = FrequencyTable::from_dataset(dataset, &names)?;
            freq_cache.insert(names.clone(), freq);
        }
        let freq = &freq_cache[&names];
        if satisfies_positivity(&template, freq, constraint) && seen.insert(template.clone()) {
            kept.push(template);
        }
    }

    if kept.is_empty() {
        return Err(ParamsError::NoParametersLeft(constraint));
    }
    optimize_ordering(&mut kept);
    Ok(kept)
}

fn frequency_for(
    combo: &TreatmentCombination,
    dataset: &DataFrame,
    cache: &mut AHashMap<String, Vec<Option<TreatmentValue>>>,
) -> Result<FrequencyTable, ParamsError> {
    for name in combo.names() {
        if !cache.contains_key(name) {
            cache.insert(name.to_string(), treatment_column(dataset, name)?);
        }
    }
    let columns: Vec<&[Option<TreatmentValue>]> =
        combo.names().map(|name| cache[name].as_slice()).collect();
    Ok(FrequencyTable::from_columns(&columns))
}

/// Groups parameters sharing a treatment set (then confounder and covariate
/// sets) adjacently. This is a downstream scheduling hint: adjacent
/// parameters let the estimator reuse nuisance fits. The sort is stable, so
/// generation order is preserved within groups.
pub fn optimize_ordering(templates: &mut [ParameterTemplate]) {
    templates.sort_by_cached_key(|template| {
        (
            template.treatment_names(),
            template.confounders.clone(),
            template.covariates.clone(),
        )
    });
}

/// Splits an outcome list into chunks of at most `batch_size`. Absent batch
/// size means a single batch holding every phenotype of the type.
pub fn phenotype_batches(names: &[String], batch_size: Option<usize>) -> Vec<Vec<String>> {
    if names.is_empty() {
        return Vec::new();
    }
    match batch_size {
        None => vec![names.to_vec()],
        Some(size) => names.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect(),
    }
}

// ========================================================================================
//                      Parameter template files (with-param-files)
// ========================================================================================

/// Reads every prefix-matched `.yaml` template file into parameter
/// templates. Confounders and covariates are supplied by the run
/// configuration, not the files.
pub fn read_parameter_templates(
    prefix: &Path,
    confounders: &[String],
    covariates: &[String],
) -> Result<Vec<ParameterTemplate>, ParamsError> {
    let mut templates = Vec::new();
    for path in files_with_prefix(prefix)? {
        let is_yaml = path
            .extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }
        let document: Value = serde_yaml::from_reader(File::open(&path)?)?;
        templates.extend(parse_template_file(&path, &document, confounders, covariates)?);
    }
    Ok(templates)
}

fn parse_template_file(
    path: &Path,
    document: &Value,
    confounders: &[String],
    covariates: &[String],
) -> Result<Vec<ParameterTemplate>, ParamsError> {
    let malformed = |message: String| ParamsError::MalformedTemplate {
        path: path.to_path_buf(),
        message,
    };

    let root = document
        .as_mapping()
        .ok_or_else(|| malformed("document root is not a mapping".to_string()))?;
    let parameters = root
        .get(&Value::from("Parameters"))
        .and_then(Value::as_sequence)
        .ok_or_else(|| malformed("missing 'Parameters' sequence".to_string()))?;

    // An explicit Treatments list fixes the order (primary first);
    // otherwise the insertion order of each parameter mapping is used.
    let declared_order: Option<Vec<String>> = root
        .get(&Value::from("Treatments"))
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });

    let mut templates = Vec::new();
    for entry in parameters {
        let mapping = entry
            .as_mapping()
            .ok_or_else(|| malformed("parameter entry is not a mapping".to_string()))?;
        let kind_label = mapping
            .get(&Value::from("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("parameter entry has no 'name'".to_string()))?;
        let kind = ParameterKind::parse(kind_label)
            .ok_or_else(|| malformed(format!("unknown parameter kind '{kind_label}'")))?;

        let mut settings_by_name: AHashMap<String, TreatmentSetting> = AHashMap::new();
        let mut insertion_order = Vec::new();
        for (key, value) in mapping {
            let Some(name) = key.as_str() else { continue };
            if name == "name" {
                continue;
            }
            let assignment = value
                .as_mapping()
                .ok_or_else(|| malformed(format!("treatment '{name}' is not a case/control mapping")))?;
            let read_value = |field: &str| {
                assignment
                    .get(&Value::from(field))
                    .and_then(TreatmentValue::from_yaml)
                    .ok_or_else(|| malformed(format!("treatment '{name}' has no usable '{field}'")))
            };
            let setting = TreatmentSetting {
                name: name.to_string(),
                case: read_value("case")?,
                control: read_value("control")?,
            };
            insertion_order.push(name.to_string());
            settings_by_name.insert(name.to_string(), setting);
        }

        let order = declared_order.clone().unwrap_or(insertion_order);
        let mut ordered = Vec::with_capacity(order.len());
        for name in &order {
            let setting = settings_by_name.remove(name).ok_or_else(|| {
                malformed(format!("treatment '{name}' is declared but has no setting"))
            })?;
            ordered.push(setting);
        }
        if ordered.is_empty() {
            return Err(malformed("parameter entry declares no treatments".to_string()));
        }
        if let Some(stray) = settings_by_name.keys().next() {
            return Err(malformed(format!(
                "treatment '{stray}' has a setting but is missing from the 'Treatments' list"
            )));
        }

        let template = ParameterTemplate {
            kind,
            primary: ordered.remove(0),
            others: ordered,
            confounders: confounders.to_vec(),
            covariates: covariates.to_vec(),
        };
        match kind {
            ParameterKind::Ate => {
                if !template.primary.varies()
                    || template.others.iter().any(TreatmentSetting::varies)
                {
                    return Err(malformed(
                        "an ATE varies exactly its primary treatment".to_string(),
                    ));
                }
            }
            ParameterKind::Iate => {
                if template.others.is_empty()
                    || !template.settings().all(TreatmentSetting::varies)
                {
                    return Err(malformed(
                        "an IATE requires two or more treatments, all varying".to_string(),
                    ));
                }
            }
        }
        templates.push(template);
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLE_ID;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn s(value: &str) -> TreatmentValue {
        TreatmentValue::Str(value.to_string())
    }

    fn slots() -> TreatmentSlots {
        TreatmentSlots {
            bqtls: vec!["b1".to_string(), "b2".to_string()],
            slots: vec![
                vec!["t1".to_string(), "t2".to_string()],
                vec!["e1".to_string()],
            ],
        }
    }

    #[test]
    fn order_one_yields_bqtl_singletons() {
        let combos: Vec<_> = slots().combinations(1).collect();
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c.others.is_empty()));
    }

    #[test]
    fn higher_orders_cross_bqtls_against_slot_subsets() {
        let slots = slots();
        // order 2: 2 bqtls x (2 members + 1 member) = 6 pairs.
        assert_eq!(slots.combinations(2).count(), 6);
        // order 3: 2 bqtls x (2 x 1) member tuples = 4 triples.
        let triples: Vec<_> = slots.combinations(3).collect();
        assert_eq!(triples.len(), 4);
        assert!(triples.iter().all(|c| c.len() == 3));
        // order 4 needs three slots; only two exist.
        assert_eq!(slots.combinations(4).count(), 0);
    }

    #[test]
    fn combinations_repeating_a_name_are_skipped() {
        let slots = TreatmentSlots {
            bqtls: vec!["rs1".to_string()],
            slots: vec![vec!["rs1".to_string(), "rs2".to_string()]],
        };
        let combos: Vec<_> = slots.combinations(2).collect();
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].others, vec!["rs2".to_string()]);
    }

    #[test]
    fn without_bqtls_the_first_slot_member_is_primary() {
        let slots = TreatmentSlots {
            bqtls: Vec::new(),
            slots: vec![vec!["env1".to_string()], vec!["rs9".to_string()]],
        };
        let combos: Vec<_> = slots.combinations(2).collect();
        assert_eq!(combos.len(), 1);
        assert_eq!(combos[0].primary, "env1");
        assert_eq!(combos[0].others, vec!["rs9".to_string()]);
    }

    fn freq_from(rows: &[(&str, &str)]) -> FrequencyTable {
        let left: Vec<Option<TreatmentValue>> = rows.iter().map(|(l, _)| Some(s(l))).collect();
        let right: Vec<Option<TreatmentValue>> = rows.iter().map(|(_, r)| Some(s(r))).collect();
        FrequencyTable::from_columns(&[&left, &right])
    }

    #[test]
    fn frequency_table_skips_incomplete_rows() {
        let left = vec![Some(s("AA")), None, Some(s("AG"))];
        let right = vec![Some(s("CC")), Some(s("CC")), Some(s("CT"))];
        let freq = FrequencyTable::from_columns(&[&left, &right]);
        assert_eq!(freq.total(), 2);
        assert_eq!(freq.count(&[s("AA"), s("CC")]), 1);
        assert_eq!(freq.count(&[s("AG"), s("CC")]), 0);
        assert_eq!(freq.observed_values(0), vec![s("AA"), s("AG")]);
        assert_abs_diff_eq!(freq.frequency(&[s("AA"), s("CC")]), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(freq.frequency(&[s("AG"), s("CC")]), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn ate_varies_exactly_the_primary() {
        let combo = TreatmentCombination {
            primary: "rs1".to_string(),
            others: vec!["rs2".to_string()],
        };
        let freq = freq_from(&[("AA", "CC"), ("AG", "CC"), ("AA", "CT"), ("AG", "CT")]);
        let templates = templates_for_combination(&combo, &freq, &[], &[]);
        let ates: Vec<_> = templates
            .iter()
            .filter(|t| t.kind == ParameterKind::Ate)
            .collect();
        // One primary pair (AA, AG) x two pinned values of rs2.
        assert_eq!(ates.len(), 2);
        for ate in ates {
            assert!(ate.primary.varies());
            assert!(ate.others.iter().all(|o| !o.varies()));
            assert!(ate.primary.control < ate.primary.case);
        }
    }

    #[test]
    fn iate_varies_every_treatment() {
        let combo = TreatmentCombination {
            primary: "rs1".to_string(),
            others: vec!["rs2".to_string()],
        };
        let freq = freq_from(&[("AA", "CC"), ("AG", "CC"), ("AA", "CT"), ("AG", "CT")]);
        let templates = templates_for_combination(&combo, &freq, &[], &[]);
        let iates: Vec<_> = templates
            .iter()
            .filter(|t| t.kind == ParameterKind::Iate)
            .collect();
        // One value pair per treatment.
        assert_eq!(iates.len(), 1);
        assert!(iates[0].settings().all(TreatmentSetting::varies));
    }

    #[test]
    fn singleton_combinations_generate_no_iate() {
        let combo = TreatmentCombination {
            primary: "rs1".to_string(),
            others: Vec::new(),
        };
        let left = vec![Some(s("AA")), Some(s("AG"))];
        let freq = FrequencyTable::from_columns(&[&left]);
        let templates = templates_for_combination(&combo, &freq, &[], &[]);
        assert!(templates.iter().all(|t| t.kind == ParameterKind::Ate));
        assert_eq!(templates.len(), 1);
    }

    #[test]
    fn positivity_requires_every_implied_cell() {
        // (AG, CT) never observed together.
        let freq = freq_from(&[("AA", "CC"), ("AG", "CC"), ("AA", "CT")]);
        let observed = ParameterTemplate {
            kind: ParameterKind::Ate,
            primary: TreatmentSetting::varying("rs1", s("AA"), s("AG")),
            others: vec![TreatmentSetting::fixed("rs2", s("CC"))],
            confounders: Vec::new(),
            covariates: Vec::new(),
        };
        assert!(satisfies_positivity(&observed, &freq, 0.0));

        let unobserved = ParameterTemplate {
            others: vec![TreatmentSetting::fixed("rs2", s("CT"))],
            ..observed.clone()
        };
        assert!(!satisfies_positivity(&unobserved, &freq, 0.0));
    }

    #[test]
    fn tightening_the_constraint_filters_thin_cells() {
        // AA/CC dominates; AG/CC holds a single observation out of ten.
        let mut rows = vec![("AG", "CC")];
        rows.extend(std::iter::repeat(("AA", "CC")).take(9));
        let freq = freq_from(&rows);
        let template = ParameterTemplate {
            kind: ParameterKind::Ate,
            primary: TreatmentSetting::varying("rs1", s("AA"), s("AG")),
            others: vec![TreatmentSetting::fixed("rs2", s("CC"))],
            confounders: Vec::new(),
            covariates: Vec::new(),
        };
        assert!(satisfies_positivity(&template, &freq, 0.05));
        assert!(!satisfies_positivity(&template, &freq, 0.2));
    }

    fn toy_dataset() -> DataFrame {
        let ids: Vec<String> = (0..8).map(|i| format!("S{i}")).collect();
        let rs1 = vec!["AA", "AA", "AG", "AG", "AA", "AG", "AA", "AG"];
        let env = vec![0i64, 1, 0, 1, 0, 1, 1, 0];
        DataFrame::new(vec![
            Series::new(SAMPLE_ID.into(), ids).into(),
            Series::new("rs1".into(), rs1.iter().map(|v| v.to_string()).collect::<Vec<_>>()).into(),
            Series::new("env".into(), env).into(),
        ])
        .unwrap()
    }

    #[test]
    fn enumeration_deduplicates_repeated_orders() {
        let df = toy_dataset();
        let slots = TreatmentSlots {
            bqtls: vec!["rs1".to_string()],
            slots: vec![vec!["env".to_string()]],
        };
        let once = enumerate_parameters(EnumerationInputs {
            dataset: &df,
            slots: slots.clone(),
            orders: vec![1, 2],
            confounders: vec!["PC1".to_string()],
            covariates: Vec::new(),
            positivity_constraint: 0.0,
        })
        .unwrap();
        let twice = enumerate_parameters(EnumerationInputs {
            dataset: &df,
            slots,
            orders: vec![1, 2, 1, 2],
            confounders: vec!["PC1".to_string()],
            covariates: Vec::new(),
            positivity_constraint: 0.0,
        })
        .unwrap();
        assert_eq!(once, twice);
        // order 1: one ATE. order 2: 2 pinned ATEs + 1 IATE.
        assert_eq!(once.len(), 4);
    }

    #[test]
    fn impossible_constraint_is_a_fatal_error() {
        let df = toy_dataset();
        let slots = TreatmentSlots {
            bqtls: vec!["rs1".to_string()],
            slots: Vec::new(),
        };
        let err = enumerate_parameters(EnumerationInputs {
            dataset: &df,
            slots,
            orders: vec![1],
            confounders: Vec::new(),
            covariates: Vec::new(),
            positivity_constraint: 0.9,
        })
        .unwrap_err();
        assert!(matches!(err, ParamsError::NoParametersLeft(c) if c == 0.9));
    }

    #[test]
    fn ordering_groups_identical_treatment_sets() {
        let make = |primary: &str, case: &str| ParameterTemplate {
            kind: ParameterKind::Ate,
            primary: TreatmentSetting::varying(primary, s("AA"), s(case)),
            others: Vec::new(),
            confounders: Vec::new(),
            covariates: Vec::new(),
        };
        let mut templates = vec![make("rs1", "AG"), make("rs2", "AG"), make("rs1", "GG")];
        optimize_ordering(&mut templates);
        let names: Vec<String> = templates.iter().map(|t| t.primary.name.clone()).collect();
        assert_eq!(names, vec!["rs1", "rs1", "rs2"]);
        // Stable: rs1/AG came before rs1/GG in the input.
        assert_eq!(templates[0].primary.case, s("AG"));
    }

    #[test]
    fn batching_math_is_ceil() {
        let names: Vec<String> = (0..5).map(|i| format!("p{i}")).collect();
        assert_eq!(phenotype_batches(&names, None).len(), 1);
        assert_eq!(phenotype_batches(&names, Some(2)).len(), 3);
        assert_eq!(phenotype_batches(&names, Some(5)).len(), 1);
        assert_eq!(phenotype_batches(&[], Some(2)).len(), 0);
    }

    #[test]
    fn template_files_parse_into_templates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("param_queries.yaml");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            "Treatments:\n  - rs1\n  - env\nParameters:\n  - name: IATE\n    rs1: {{case: AG, control: AA}}\n    env: {{case: 1, control: 0}}\n  - name: ATE\n    rs1: {{case: AG, control: AA}}\n    env: {{case: 0, control: 0}}\n"
        )
        .unwrap();

        let templates = read_parameter_templates(
            &dir.path().join("param_"),
            &["PC1".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].kind, ParameterKind::Iate);
        assert_eq!(templates[0].primary.name, "rs1");
        assert_eq!(templates[0].others[0].case, TreatmentValue::Int(1));
        assert_eq!(templates[1].kind, ParameterKind::Ate);
        assert!(!templates[1].others[0].varies());
        assert_eq!(templates[1].confounders, vec!["PC1".to_string()]);
    }

    #[test]
    fn malformed_template_kinds_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("param_bad.yaml");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            "Parameters:\n  - name: CATE\n    rs1: {{case: AG, control: AA}}\n"
        )
        .unwrap();
        let err = read_parameter_templates(&dir.path().join("param_"), &[], &[]).unwrap_err();
        assert!(matches!(err, ParamsError::MalformedTemplate { .. }));
    }
}
