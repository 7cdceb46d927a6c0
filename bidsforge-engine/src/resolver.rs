//! Entity Resolver
//!
//! Merges user overrides into the computed defaults and validates entity
//! labels. Validation results are recomputed from scratch on every pass:
//! fixing a label retracts the error it caused.

use crate::entities::{self, NUMERIC_ENTITIES, PART_LABELS};
use crate::model::{series_lookup, Acquisition, Series};
use tracing::debug;

/// Copy every non-empty user override (other than subject/session) into the
/// computed defaults of each non-excluded acquisition
pub fn align_entities(mut acquisitions: Vec<Acquisition>) -> Vec<Acquisition> {
    for acq in acquisitions.iter_mut().filter(|a| !a.is_excluded()) {
        for (key, value) in &acq.entities {
            if key == "subject" || key == "session" || value.is_empty() {
                continue;
            }
            acq.computed.insert(key.clone(), value.clone());
        }
    }
    acquisitions
}

/// Validate entity labels and B0 field labels of every non-excluded acquisition
pub fn validate_entities(mut acquisitions: Vec<Acquisition>, series: &[Series]) -> Vec<Acquisition> {
    let lookup = series_lookup(series);
    let mut flagged = 0;

    for acq in acquisitions.iter_mut().filter(|a| a.is_candidate()) {
        let series = acq.series_idx.and_then(|s| lookup.get(&s).copied());
        let ped = acq.ped(series);
        let image_type = acq.image_type(series);

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (key, value) in acq.resolved_entities() {
            check_label(&key, &value, ped.as_deref(), &image_type, &mut errors, &mut warnings);
        }
        for label in &acq.b0_field_identifier {
            check_b0_label("B0FieldIdentifier", label, &mut errors);
        }
        for label in &acq.b0_field_source {
            check_b0_label("B0FieldSource", label, &mut errors);
        }

        if !errors.is_empty() {
            flagged += 1;
        }
        acq.validation_errors = errors;
        acq.validation_warnings = warnings;
    }

    debug!(flagged, "Entity validation complete");
    acquisitions
}

/// Validate series-level B0 field labels
pub fn validate_series(mut series: Vec<Series>) -> Vec<Series> {
    for s in &mut series {
        let mut errors = Vec::new();
        for label in &s.b0_field_identifier {
            check_b0_label("B0FieldIdentifier", label, &mut errors);
        }
        for label in &s.b0_field_source {
            check_b0_label("B0FieldSource", label, &mut errors);
        }
        s.validation_errors = errors;
    }
    series
}

fn check_label(
    key: &str,
    value: &str,
    ped: Option<&str>,
    image_type: &[String],
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        errors.push(format!(
            "The {key} entity label \"{value}\" contains non-alphanumeric characters; only letters and digits are allowed"
        ));
    }

    match key {
        "direction" => {
            if value != value.to_uppercase() {
                errors.push(format!(
                    "The direction entity label \"{value}\" must be upper-case"
                ));
            }
            if let Some(expected) = ped.and_then(entities::direction_for_ped) {
                if !value.eq_ignore_ascii_case(expected) {
                    warnings.push(format!(
                        "The direction entity label \"{value}\" does not match the phase encoding direction {} (expected \"{expected}\")",
                        ped.unwrap_or_default()
                    ));
                }
            }
        }
        "part" => {
            if !PART_LABELS.contains(&value) {
                errors.push(format!(
                    "The part entity label \"{value}\" is not one of {}",
                    PART_LABELS.join(", ")
                ));
            } else if let Some(warning) = part_image_type_mismatch(value, image_type) {
                warnings.push(warning);
            }
        }
        "mtransfer" if value != "on" && value != "off" => {
            errors.push(format!(
                "The mtransfer entity label \"{value}\" must be either \"on\" or \"off\""
            ));
        }
        "hemisphere" if value != "L" && value != "R" => {
            errors.push(format!(
                "The hemisphere entity label \"{value}\" must be either \"L\" or \"R\""
            ));
        }
        _ if NUMERIC_ENTITIES.contains(&key) && !value.chars().all(|c| c.is_ascii_digit()) => {
            errors.push(format!(
                "The {key} entity label \"{value}\" must contain digits only"
            ));
        }
        _ => {}
    }
}

fn part_image_type_mismatch(part: &str, image_type: &[String]) -> Option<String> {
    if image_type.is_empty() {
        return None;
    }
    let has = |tag: &str| image_type.iter().any(|t| t == tag);
    let phase_like = has("P") || has("PHASE") || has("IMAGINARY");

    match part {
        "phase" | "imag" if !phase_like => Some(format!(
            "The part entity label \"{part}\" was set, but the ImageType ({}) does not indicate phase or imaginary data",
            image_type.join("\\")
        )),
        "mag" | "real" if phase_like => Some(format!(
            "The part entity label \"{part}\" was set, but the ImageType ({}) indicates phase or imaginary data",
            image_type.join("\\")
        )),
        _ => None,
    }
}

fn check_b0_label(field: &str, label: &str, errors: &mut Vec<String>) {
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        errors.push(format!(
            "{field} \"{label}\" may only contain letters, digits, \"-\" and \"_\""
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{acq, series, with_series};

    fn validated(a: Acquisition, series: &[Series]) -> Acquisition {
        validate_entities(vec![a], series).remove(0)
    }

    #[test]
    fn test_align_copies_overrides_except_subject_session() {
        let mut a = acq("func/bold", &[("subject", "01"), ("task", "rest")]);
        a.entities.insert("subject".to_string(), "99".to_string());
        a.entities.insert("task".to_string(), "nback".to_string());
        a.entities.insert("acquisition".to_string(), String::new());

        let a = align_entities(vec![a]).remove(0);
        assert_eq!(a.computed["task"], "nback");
        assert_eq!(a.computed["subject"], "01");
        assert!(!a.computed.contains_key("acquisition"));
    }

    #[test]
    fn test_align_skips_excluded() {
        let mut a = acq("func/bold", &[("task", "rest")]);
        a.entities.insert("task".to_string(), "nback".to_string());
        a.exclude = true;
        a.exclude_in_effect = true;

        let a = align_entities(vec![a]).remove(0);
        assert_eq!(a.computed["task"], "rest");
    }

    #[test]
    fn test_non_alphanumeric_label_is_error() {
        let a = validated(acq("func/bold", &[("task", "n-back")]), &[]);
        assert_eq!(a.validation_errors.len(), 1);
        assert!(a.validation_errors[0].contains("non-alphanumeric"));
    }

    #[test]
    fn test_direction_rules() {
        let mut s = series(0, "dwi");
        s.ped = Some("j-".to_string());

        let lower = validated(with_series(acq("dwi/dwi", &[("direction", "ap")]), 0), &[s.clone()]);
        assert!(lower.validation_errors.iter().any(|e| e.contains("upper-case")));

        let mismatch = validated(with_series(acq("dwi/dwi", &[("direction", "PA")]), 0), &[s.clone()]);
        assert!(mismatch.validation_errors.is_empty());
        assert_eq!(mismatch.validation_warnings.len(), 1);

        let ok = validated(with_series(acq("dwi/dwi", &[("direction", "AP")]), 0), &[s]);
        assert!(ok.validation_errors.is_empty());
        assert!(ok.validation_warnings.is_empty());
    }

    #[test]
    fn test_part_vocabulary_and_image_type_cross_check() {
        let bad = validated(acq("anat/MEGRE", &[("part", "Phase")]), &[]);
        assert!(!bad.validation_errors.is_empty());

        let mut s = series(0, "gre");
        s.image_type = vec!["ORIGINAL".into(), "PRIMARY".into(), "M".into()];
        let mismatch = validated(with_series(acq("anat/MEGRE", &[("part", "phase")]), 0), &[s.clone()]);
        assert!(mismatch.validation_errors.is_empty());
        assert_eq!(mismatch.validation_warnings.len(), 1);

        s.image_type = vec!["ORIGINAL".into(), "PRIMARY".into(), "P".into()];
        let matched = validated(with_series(acq("anat/MEGRE", &[("part", "phase")]), 0), &[s]);
        assert!(matched.validation_warnings.is_empty());
    }

    #[test]
    fn test_enumerated_and_numeric_entities() {
        let a = validated(
            acq(
                "anat/MTS",
                &[("mtransfer", "yes"), ("hemisphere", "l"), ("run", "01"), ("echo", "2b")],
            ),
            &[],
        );
        assert_eq!(a.validation_errors.len(), 3);
    }

    #[test]
    fn test_b0_labels() {
        let mut a = acq("fmap/epi", &[]);
        a.b0_field_identifier = vec!["pepolar_fmap-1".to_string()];
        a.b0_field_source = vec!["bad label".to_string()];
        let a = validated(a, &[]);
        assert_eq!(a.validation_errors.len(), 1);
        assert!(a.validation_errors[0].starts_with("B0FieldSource"));

        let mut s = series(0, "fmap");
        s.b0_field_identifier = vec!["a.b".to_string()];
        let s = validate_series(vec![s]).remove(0);
        assert_eq!(s.validation_errors.len(), 1);
    }

    #[test]
    fn test_fixed_label_retracts_error() {
        let a = validated(acq("func/bold", &[("task", "n_back")]), &[]);
        assert!(!a.validation_errors.is_empty());

        let mut fixed = a;
        fixed.entities.insert("task".to_string(), "nback".to_string());
        let fixed = validated(fixed, &[]);
        assert!(fixed.validation_errors.is_empty());
    }
}
