//! Functional acquisition checks: minimum run length and sbref/bold PED agreement

use super::warn;
use crate::model::{series_lookup, Acquisition, Entities, Series, FUNC_BOLD, FUNC_SBREF};
use tracing::{debug, info};

/// Force-exclude func/bold acquisitions too short to be useful
///
/// `threshold = floor(min_duration_sec / RepetitionTime)`; an acquisition with
/// `NumVolumes <= threshold` is excluded. Acquisitions lacking either value are
/// left alone.
pub fn func_volume_threshold(mut acquisitions: Vec<Acquisition>, min_duration_sec: f64) -> Vec<Acquisition> {
    for acq in acquisitions.iter_mut().filter(|a| a.kind == FUNC_BOLD) {
        let (Some(tr), Some(volumes)) = (acq.repetition_time(), acq.analysis.num_volumes) else {
            continue;
        };
        if tr <= 0.0 {
            continue;
        }

        let threshold = (min_duration_sec / tr).floor() as u32;
        if volumes <= threshold {
            info!(
                idx = acq.idx,
                volumes,
                threshold,
                "Excluding short functional acquisition"
            );
            acq.force_exclude(format!(
                "This func/bold acquisition has only {volumes} volumes, which is not more than the minimum of {threshold} volumes ({min_duration_sec} seconds at a RepetitionTime of {tr} seconds). It has been excluded."
            ));
        }
    }
    acquisitions
}

/// Warn sbrefs whose phase-encoding direction differs from their bold
pub fn func_sbref_ped(mut acquisitions: Vec<Acquisition>, series: &[Series]) -> Vec<Acquisition> {
    let lookup = series_lookup(series);
    let ped_of = |acq: &Acquisition| acq.ped(acq.series_idx.and_then(|s| lookup.get(&s).copied()));

    let bolds: Vec<(Entities, u32, usize, String)> = acquisitions
        .iter()
        .filter(|a| a.kind == FUNC_BOLD && a.is_candidate() && a.has_primary_part())
        .filter_map(|a| {
            ped_of(a).map(|ped| (pairing_key(a), a.analysis.section_id, a.display_index(), ped))
        })
        .collect();

    let mut mismatches = 0;
    for sbref in acquisitions
        .iter_mut()
        .filter(|a| a.kind == FUNC_SBREF && a.is_candidate())
    {
        let Some(sbref_ped) = ped_of(sbref) else {
            continue;
        };
        let key = pairing_key(sbref);

        for (bold_key, section_id, bold_index, bold_ped) in &bolds {
            if *bold_key == key && *section_id == sbref.analysis.section_id && *bold_ped != sbref_ped {
                warn(
                    sbref,
                    format!(
                        "The phase encoding direction of this func/sbref ({sbref_ped}) differs from that of the corresponding func/bold acquisition #{bold_index} ({bold_ped})."
                    ),
                );
                mismatches += 1;
            }
        }
    }

    debug!(mismatches, "sbref PED check complete");
    acquisitions
}

fn pairing_key(acq: &Acquisition) -> Entities {
    let mut entities = acq.resolved_entities();
    entities.remove("echo");
    entities.remove("part");
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{acq, indexed};
    use crate::model::Item;
    use serde_json::json;

    fn bold(tr: f64, volumes: u32) -> Acquisition {
        let mut a = acq("func/bold", &[("subject", "01"), ("task", "rest")]);
        a.items.push(Item {
            name: "json".to_string(),
            sidecar: Some(json!({ "RepetitionTime": tr })),
            ..Default::default()
        });
        a.analysis.num_volumes = Some(volumes);
        a
    }

    fn with_ped(mut a: Acquisition, ped: &str) -> Acquisition {
        a.items.push(Item {
            name: "json".to_string(),
            sidecar: Some(json!({ "PhaseEncodingDirection": ped })),
            ..Default::default()
        });
        a
    }

    #[test]
    fn test_volume_threshold_boundary() {
        let acqs = func_volume_threshold(vec![bold(2.0, 25), bold(2.0, 30), bold(2.0, 31)], 60.0);

        assert!(acqs[0].is_excluded());
        assert!(acqs[0].analysis.warnings[0].contains("25"));
        assert!(acqs[0].analysis.warnings[0].contains("30"));
        assert!(acqs[1].is_excluded());
        assert!(!acqs[2].is_excluded());
        assert!(acqs[2].analysis.warnings.is_empty());
    }

    #[test]
    fn test_volume_threshold_needs_tr_and_volumes() {
        let mut no_volumes = bold(2.0, 1);
        no_volumes.analysis.num_volumes = None;
        let acqs = func_volume_threshold(vec![no_volumes], 60.0);
        assert!(!acqs[0].is_excluded());
    }

    #[test]
    fn test_sbref_ped_mismatch_warns_sbref_only() {
        let acqs = indexed(vec![
            with_ped(acq("func/sbref", &[("subject", "01"), ("task", "rest")]), "j"),
            with_ped(acq("func/bold", &[("subject", "01"), ("task", "rest")]), "j-"),
            with_ped(acq("func/sbref", &[("subject", "01"), ("task", "rest"), ("echo", "1")]), "j-"),
        ]);
        let acqs = func_sbref_ped(acqs, &[]);

        assert_eq!(acqs[0].analysis.warnings.len(), 1);
        assert!(acqs[0].analysis.warnings[0].contains("#2"));
        assert!(acqs[1].analysis.warnings.is_empty());
        assert!(acqs[2].analysis.warnings.is_empty());
        assert!(!acqs[0].is_excluded());
    }
}
