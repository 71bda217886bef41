//! Publication form of a prediction document.
//!
//! Only alive characters are kept, keyed by name, with the survival-age
//! summaries and the mean curve. Every floating-point number is reduced to a
//! fixed number of significant digits.

use crate::format::{CharacterPrediction, FormatError, PredictionDocument};
use serde_json::{Map, Number, Value, json};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_DIGITS: usize = 3;

/// `f64` carries at most 17 significant decimal digits.
const MAX_DIGITS: usize = 17;

#[derive(Error, Debug)]
pub enum CompactError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("I/O error writing compact document: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error writing compact document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("significant digits must lie in 1..={MAX_DIGITS}, got {0}")]
    InvalidDigits(usize),
}

/// Rounds `value` to `digits` significant decimal digits.
pub fn round_significant(value: f64, digits: usize) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return value;
    }
    format!("{:.*e}", digits - 1, value)
        .parse()
        .unwrap_or(value)
}

fn round_numbers(value: &mut Value, digits: usize) {
    match value {
        Value::Number(n) if n.is_f64() => {
            if let Some(rounded) = n
                .as_f64()
                .and_then(|v| Number::from_f64(round_significant(v, digits)))
            {
                *n = rounded;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| round_numbers(v, digits)),
        Value::Object(fields) => fields.values_mut().for_each(|v| round_numbers(v, digits)),
        _ => {}
    }
}

fn compact_character(character: &CharacterPrediction) -> Value {
    json!({
        "age": character.age,
        "predictedSurvivalAge": character.predicted_survival_age,
        "confIntervalLower": character.conf_interval_lower,
        "confIntervalHigher": character.conf_interval_higher,
        "posteriorSurvivalAge": character.posterior_survival_age,
        "survivalFunctionMean": character.survival_function_mean,
    })
}

/// Builds the compact form of `document`.
pub fn compact_document(document: &PredictionDocument, digits: usize) -> Result<Value, CompactError> {
    if digits == 0 || digits > MAX_DIGITS {
        return Err(CompactError::InvalidDigits(digits));
    }

    let mut characters = Map::new();
    for character in document.characters.iter().filter(|c| c.alive) {
        let previous = characters.insert(character.name.clone(), compact_character(character));
        if previous.is_some() {
            log::warn!(
                "Duplicate character name '{}': keeping the later record",
                character.name
            );
        }
    }

    let mut compact = json!({
        "attributes": document.attributes,
        "meanBetaExp": document.mean_beta_exp,
        "characters": Value::Object(characters),
    });
    round_numbers(&mut compact, digits);
    Ok(compact)
}

/// Reads a prediction document from `input` and writes its compact form to
/// `output`. Returns the number of characters kept.
pub fn compact_file(input: &Path, output: &Path, digits: usize) -> Result<usize, CompactError> {
    let document = PredictionDocument::read_json(input)?;
    let compact = compact_document(&document, digits)?;
    let kept = compact["characters"].as_object().map_or(0, Map::len);

    let mut writer = BufWriter::new(File::create(output)?);
    serde_json::to_writer_pretty(&mut writer, &compact)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    log::info!(
        "Compacted {} of {} characters into {}",
        kept,
        document.characters.len(),
        output.display()
    );
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaselineKind, SummaryConfig};
    use crate::diagnostics::FitQuality;
    use crate::evaluate::ThresholdCrossing;
    use crate::format::Thresholds;
    use tempfile::tempdir;

    fn crossing(age: f64) -> ThresholdCrossing {
        ThresholdCrossing {
            index: age as usize,
            age,
            horizon_limited: false,
        }
    }

    fn character(name: &str, alive: bool, age: f64) -> CharacterPrediction {
        CharacterPrediction {
            name: name.to_string(),
            alive,
            age,
            predicted_survival_age: crossing(61.0),
            conf_interval_lower: crossing(40.0),
            conf_interval_higher: crossing(83.0),
            posterior_survival_age: 62.3456789,
            posterior_horizon_limited: 0.0,
            survival_function_mean: vec![1.0, 0.987654321, 0.123456789],
            survival_function_samples: None,
        }
    }

    fn document() -> PredictionDocument {
        PredictionDocument {
            attributes: vec!["male".to_string(), "pageRank".to_string()],
            mean_beta_exp: vec![1.23456, 0.000987654],
            prior_hazard: vec![0.01; 3],
            baseline: BaselineKind::Piecewise,
            interval_length: 1.0,
            horizon_intervals: 2,
            thresholds: Thresholds::from(&SummaryConfig::default()),
            seed: 1,
            clamped_exposure_cells: 0,
            fit_quality: FitQuality {
                samples: 10,
                iterations: 20,
                divergences: 0,
                divergence_rate: 0.0,
                rhat: Some(1.0),
                ess: Some(200.0),
                warnings: Vec::new(),
                flagged: false,
            },
            characters: vec![
                character("Jon Snow", true, 16.0),
                character("Ned Stark", false, 35.0),
                character("Arya Stark", true, 11.0),
            ],
        }
    }

    #[test]
    fn rounds_to_significant_digits() {
        assert_eq!(round_significant(0.987654321, 3), 0.988);
        assert_eq!(round_significant(123456.0, 3), 123000.0);
        assert_eq!(round_significant(0.000987654, 2), 0.00099);
        assert_eq!(round_significant(-2.71828, 4), -2.718);
        assert_eq!(round_significant(0.0, 3), 0.0);
    }

    #[test]
    fn keeps_only_alive_characters_keyed_by_name() {
        let compact = compact_document(&document(), DEFAULT_DIGITS).unwrap();
        let characters = compact["characters"].as_object().unwrap();
        let names: Vec<&String> = characters.keys().collect();
        assert_eq!(names, vec!["Jon Snow", "Arya Stark"]);

        let jon = &characters["Jon Snow"];
        assert_eq!(jon["age"], 16.0);
        assert_eq!(jon["posteriorSurvivalAge"], 62.3);
        assert_eq!(jon["survivalFunctionMean"][1], 0.988);
        assert_eq!(jon["survivalFunctionMean"][2], 0.123);
        assert_eq!(jon["predictedSurvivalAge"]["index"], 61);
        assert!(jon.get("survivalFunctionSamples").is_none());

        assert_eq!(compact["meanBetaExp"][0], 1.23);
        assert_eq!(compact["attributes"][1], "pageRank");
        assert!(compact.get("fitQuality").is_none());
    }

    #[test]
    fn rejects_zero_digits() {
        assert!(matches!(
            compact_document(&document(), 0),
            Err(CompactError::InvalidDigits(0))
        ));
    }

    #[test]
    fn compacts_a_written_document() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("predictions.json");
        let output = dir.path().join("compact.json");
        document().write_json(&input).unwrap();

        let kept = compact_file(&input, &output, 2).unwrap();
        assert_eq!(kept, 2);
        let text = std::fs::read_to_string(&output).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["characters"]["Arya Stark"]["survivalFunctionMean"][1], 0.99);
    }
}
