// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used
// in one file.

use serde_yaml::Value;
use std::fmt;

/// Which of the two listed alleles is the minor allele for a variant.
///
/// The genotype source reports alleles in file order; the dosage probability
/// columns are oriented relative to that order, so decoding must know where
/// the minor allele sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllelePosition {
    First,
    Second,
}

/// How a decoded genotype call is written into the assembled dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeCoding {
    /// Allele-pair strings such as "AA", "AG", "GG" (major allele first).
    AllelePair,
    /// Integer count of minor-allele copies: 0, 1 or 2.
    MinorAlleleCount,
}

/// The two outcome streams. Binary and continuous phenotypes are assembled,
/// deduplicated and numbered independently end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeType {
    Binary,
    Continuous,
}

impl OutcomeType {
    /// The file-name fragment used by the output writer
    /// (`<prefix>.<fragment>.parameter_<n>.yaml`).
    pub fn suffix(&self) -> &'static str {
        match self {
            OutcomeType::Binary => "binary",
            OutcomeType::Continuous => "continuous",
        }
    }
}

impl fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A single observed treatment value.
///
/// Treatment columns are discrete: genotype calls (strings or small integers),
/// environmental indicators (booleans) or integer-coded factors. The derived
/// `Ord` gives every pair of observed values a deterministic case/control
/// orientation and makes frequency-table keys reproducible across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TreatmentValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl TreatmentValue {
    /// Renders the value as it appears in a parameter file.
    pub fn to_yaml(&self) -> Value {
        match self {
            TreatmentValue::Bool(b) => Value::Bool(*b),
            TreatmentValue::Int(i) => Value::Number((*i).into()),
            TreatmentValue::Str(s) => Value::String(s.clone()),
        }
    }

    /// Reads a value out of a parameter template file. Floats are accepted
    /// only when they are exactly integral; treatments are discrete.
    pub fn from_yaml(value: &Value) -> Option<TreatmentValue> {
        match value {
            Value::Bool(b) => Some(TreatmentValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(TreatmentValue::Int(i))
                } else {
                    let f = n.as_f64()?;
                    (f.fract() == 0.0).then(|| TreatmentValue::Int(f as i64))
                }
            }
            Value::String(s) => Some(TreatmentValue::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for TreatmentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreatmentValue::Bool(b) => write!(f, "{b}"),
            TreatmentValue::Int(i) => write!(f, "{i}"),
            TreatmentValue::Str(s) => f.write_str(s),
        }
    }
}

/// The SAMPLE_ID column name shared by every input and output table.
pub const SAMPLE_ID: &str = "SAMPLE_ID";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn treatment_values_order_deterministically() {
        let low = TreatmentValue::Str("AA".to_string());
        let high = TreatmentValue::Str("AG".to_string());
        assert!(low < high);
        assert!(TreatmentValue::Int(0) < TreatmentValue::Int(2));
        assert!(TreatmentValue::Bool(false) < TreatmentValue::Bool(true));
    }

    #[test]
    fn yaml_round_trip_preserves_variants() {
        for value in [
            TreatmentValue::Bool(true),
            TreatmentValue::Int(2),
            TreatmentValue::Str("GG".to_string()),
        ] {
            assert_eq!(TreatmentValue::from_yaml(&value.to_yaml()), Some(value));
        }
    }

    #[test]
    fn integral_floats_become_ints() {
        let value = Value::Number(serde_yaml::Number::from(2.0));
        assert_eq!(TreatmentValue::from_yaml(&value), Some(TreatmentValue::Int(2)));
        let value = Value::Number(serde_yaml::Number::from(0.5));
        assert_eq!(TreatmentValue::from_yaml(&value), None);
    }
}
