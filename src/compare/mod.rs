//! Field-level similarity comparators.
//!
//! Every comparator is a pure function `(left, right, params) -> [0, 1]`,
//! deterministic and thread-safe, with a stable string identifier that is
//! persisted on match decisions. Null handling is the match engine's
//! concern, not the comparator's.

pub mod address;
pub mod cache;
pub mod phonetic;

use chrono::NaiveDate;

use crate::config::{ComparatorSpec, FuzzyMethod, PhoneticAlgorithm};
use crate::error::{MdmError, Result};
use crate::model::record::AttributeValue;
use crate::preprocess::{parse_date_heuristic, parse_date_with_format};

pub use cache::{CacheKey, ComparatorCache};

/// Stable identifier for a comparator configuration, used in persisted
/// decisions and as part of cache keys. Parameters that change the score
/// are part of the identifier, so two fields sharing a comparator kind but
/// not its parameters never share cache entries.
pub fn comparator_id(spec: &ComparatorSpec) -> String {
    match spec {
        ComparatorSpec::Exact { case_fold } => {
            if *case_fold {
                "exact".to_string()
            } else {
                "exact:case_sensitive".to_string()
            }
        }
        ComparatorSpec::Fuzzy {
            method,
            prefix_weight,
        } => match method {
            FuzzyMethod::Levenshtein => "fuzzy:levenshtein".to_string(),
            FuzzyMethod::Jaro => "fuzzy:jaro".to_string(),
            FuzzyMethod::JaroWinkler => format!("fuzzy:jaro_winkler:{prefix_weight}"),
        },
        ComparatorSpec::Phonetic { algorithm } => match algorithm {
            PhoneticAlgorithm::Soundex => "phonetic:soundex".to_string(),
            PhoneticAlgorithm::Metaphone => "phonetic:metaphone".to_string(),
            PhoneticAlgorithm::Nysiis => "phonetic:nysiis".to_string(),
        },
        ComparatorSpec::Numeric { tolerance } => format!("numeric:{tolerance}"),
        ComparatorSpec::Date {
            format,
            window_days,
        } => format!(
            "date:{window_days}:{}",
            format.as_deref().unwrap_or("heuristic")
        ),
        ComparatorSpec::Address => "address".to_string(),
        ComparatorSpec::Vector { fallback } => {
            format!("vector:cosine|{}", comparator_id(fallback))
        }
    }
}

/// Evaluate a scalar comparator over two non-null values.
///
/// The `Vector` variant is resolved by the match engine (it needs the
/// records' embeddings); reaching it here means the fallback should be
/// evaluated instead, so this function delegates to it.
pub fn evaluate(spec: &ComparatorSpec, left: &AttributeValue, right: &AttributeValue) -> Result<f64> {
    match spec {
        ComparatorSpec::Exact { case_fold } => Ok(exact_score(left, right, *case_fold)),
        ComparatorSpec::Fuzzy {
            method,
            prefix_weight,
        } => {
            let (Some(a), Some(b)) = (left.as_text(), right.as_text()) else {
                return Ok(0.0);
            };
            Ok(fuzzy_score(&a, &b, *method, *prefix_weight))
        }
        ComparatorSpec::Phonetic { algorithm } => {
            let (Some(a), Some(b)) = (left.as_text(), right.as_text()) else {
                return Ok(0.0);
            };
            Ok(phonetic_score(&a, &b, *algorithm))
        }
        ComparatorSpec::Numeric { tolerance } => {
            if *tolerance <= 0.0 {
                return Err(MdmError::Configuration(
                    "numeric tolerance must be > 0".to_string(),
                ));
            }
            let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                return Ok(0.0);
            };
            Ok((1.0 - (a - b).abs() / tolerance).max(0.0))
        }
        ComparatorSpec::Date {
            format,
            window_days,
        } => {
            let (Some(a), Some(b)) = (
                coerce_date(left, format.as_deref()),
                coerce_date(right, format.as_deref()),
            ) else {
                return Ok(0.0);
            };
            let days_diff = (a - b).num_days().abs() as f64;
            Ok((1.0 - days_diff / window_days).max(0.0))
        }
        ComparatorSpec::Address => {
            let (Some(a), Some(b)) = (left.as_text(), right.as_text()) else {
                return Ok(0.0);
            };
            Ok(address::compare_addresses(&a, &b))
        }
        ComparatorSpec::Vector { fallback } => evaluate(fallback, left, right),
    }
}

fn exact_score(left: &AttributeValue, right: &AttributeValue, case_fold: bool) -> f64 {
    let equal = match (left, right) {
        (AttributeValue::Text(a), AttributeValue::Text(b)) if case_fold => {
            a.to_lowercase() == b.to_lowercase()
        }
        _ => left.canonical_key() == right.canonical_key(),
    };
    if equal {
        1.0
    } else {
        0.0
    }
}

fn fuzzy_score(a: &str, b: &str, method: FuzzyMethod, prefix_weight: f64) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    match method {
        FuzzyMethod::Levenshtein => strsim::normalized_levenshtein(&a, &b),
        FuzzyMethod::Jaro => strsim::jaro(&a, &b),
        FuzzyMethod::JaroWinkler => {
            let jaro = strsim::jaro(&a, &b);
            // Winkler boost: prefix length capped at 4, weight capped at
            // 0.25, applied only above the standard 0.7 floor.
            if jaro <= 0.7 {
                return jaro;
            }
            let prefix_len = a
                .chars()
                .zip(b.chars())
                .take(4)
                .take_while(|(x, y)| x == y)
                .count() as f64;
            let weight = prefix_weight.min(0.25);
            jaro + prefix_len * weight * (1.0 - jaro)
        }
    }
}

fn phonetic_score(a: &str, b: &str, algorithm: PhoneticAlgorithm) -> f64 {
    let (code_a, code_b) = match algorithm {
        PhoneticAlgorithm::Soundex => (phonetic::soundex(a), phonetic::soundex(b)),
        PhoneticAlgorithm::Metaphone => (phonetic::metaphone(a), phonetic::metaphone(b)),
        PhoneticAlgorithm::Nysiis => (phonetic::nysiis(a), phonetic::nysiis(b)),
    };
    if !code_a.is_empty() && code_a == code_b {
        1.0
    } else {
        0.0
    }
}

fn coerce_date(value: &AttributeValue, format: Option<&str>) -> Option<NaiveDate> {
    match value {
        AttributeValue::Date(d) => Some(*d),
        AttributeValue::Timestamp(ts) => Some(ts.date_naive()),
        _ => {
            let text = value.as_text()?;
            match format {
                Some(f) => parse_date_with_format(&text, f),
                None => parse_date_heuristic(&text),
            }
        }
    }
}

/// Cosine similarity of two embedding vectors, clamped to [0, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> AttributeValue {
        AttributeValue::Text(s.to_string())
    }

    #[test]
    fn exact_case_folds_by_default() {
        let spec = ComparatorSpec::Exact { case_fold: true };
        assert_eq!(evaluate(&spec, &text("ACME"), &text("acme")).unwrap(), 1.0);
        let strict = ComparatorSpec::Exact { case_fold: false };
        assert_eq!(evaluate(&strict, &text("ACME"), &text("acme")).unwrap(), 0.0);
    }

    #[test]
    fn normalized_levenshtein_contract() {
        let spec = ComparatorSpec::Fuzzy {
            method: FuzzyMethod::Levenshtein,
            prefix_weight: 0.1,
        };
        // distance 1 over max length 4
        let score = evaluate(&spec, &text("acme"), &text("acmes")).unwrap();
        assert!((score - 0.8).abs() < 1e-9, "score = {score}");
    }

    #[test]
    fn jaro_winkler_prefix_weight_is_capped() {
        let a = "martha";
        let b = "marhta";
        let base = strsim::jaro(a, b);
        let boosted = fuzzy_score(a, b, FuzzyMethod::JaroWinkler, 9.0);
        let capped = base + 3.0 * 0.25 * (1.0 - base);
        assert!((boosted - capped).abs() < 1e-9);
    }

    #[test]
    fn numeric_tolerance_gradient() {
        let spec = ComparatorSpec::Numeric { tolerance: 10.0 };
        let score = evaluate(
            &spec,
            &AttributeValue::Number(100.0),
            &AttributeValue::Number(105.0),
        )
        .unwrap();
        assert!((score - 0.5).abs() < 1e-9);
        // Non-numeric coercion fails closed.
        assert_eq!(
            evaluate(&spec, &text("n/a"), &AttributeValue::Number(5.0)).unwrap(),
            0.0
        );
    }

    #[test]
    fn date_window_gradient() {
        let spec = ComparatorSpec::Date {
            format: None,
            window_days: 10.0,
        };
        let score = evaluate(&spec, &text("2024-02-25"), &text("2024-02-20")).unwrap();
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(evaluate(&spec, &text("garbage"), &text("2024-02-20")).unwrap(), 0.0);
    }

    #[test]
    fn phonetic_equal_codes_score_one() {
        let spec = ComparatorSpec::Phonetic {
            algorithm: PhoneticAlgorithm::Soundex,
        };
        assert_eq!(evaluate(&spec, &text("Robert"), &text("Rupert")).unwrap(), 1.0);
        assert_eq!(evaluate(&spec, &text("Robert"), &text("Gonzalez")).unwrap(), 0.0);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn comparator_ids_are_stable_and_parameterized() {
        assert_eq!(
            comparator_id(&ComparatorSpec::Fuzzy {
                method: FuzzyMethod::JaroWinkler,
                prefix_weight: 0.1
            }),
            "fuzzy:jaro_winkler:0.1"
        );
        assert_eq!(
            comparator_id(&ComparatorSpec::Vector {
                fallback: Box::new(ComparatorSpec::Exact { case_fold: true })
            }),
            "vector:cosine|exact"
        );
        // Different tolerances must never share cache entries.
        assert_ne!(
            comparator_id(&ComparatorSpec::Numeric { tolerance: 10.0 }),
            comparator_id(&ComparatorSpec::Numeric { tolerance: 100.0 })
        );
    }
}
