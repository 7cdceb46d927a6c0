//! IntendedFor and B0Field propagation from series to acquisitions

use crate::model::{series_lookup, Acquisition, Series, FUNC_EVENTS};
use std::collections::BTreeMap;
use tracing::debug;

/// Resolve series-level field-map metadata onto acquisitions
///
/// A field map's series `IntendedFor` lists series indices; these become the
/// idx values of candidate, non-events acquisitions from those series in the
/// same section. Series `B0FieldIdentifier`/`B0FieldSource` are copied verbatim,
/// empty lists included, onto every candidate, non-events acquisition of the
/// series.
pub fn set_intended_for(mut acquisitions: Vec<Acquisition>, series: &[Series]) -> Vec<Acquisition> {
    let lookup = series_lookup(series);

    // (subject, session, section) -> series_idx -> idx values
    let mut targets: BTreeMap<(String, String, u32), BTreeMap<usize, Vec<usize>>> = BTreeMap::new();
    for acq in acquisitions.iter().filter(|a| eligible(a)) {
        if let Some(series_idx) = acq.series_idx {
            targets
                .entry(acq.section_key())
                .or_default()
                .entry(series_idx)
                .or_default()
                .push(acq.idx);
        }
    }

    let mut resolved = 0;
    for acq in acquisitions.iter_mut().filter(|a| eligible(a)) {
        let Some(series) = acq.series_idx.and_then(|s| lookup.get(&s).copied()) else {
            continue;
        };

        if acq.modality() == "fmap" {
            if let Some(wanted) = &series.intended_for {
                let in_section = targets.get(&acq.section_key());
                let mut idxs: Vec<usize> = wanted
                    .iter()
                    .filter_map(|s| in_section.and_then(|m| m.get(s)))
                    .flatten()
                    .copied()
                    .collect();
                idxs.sort_unstable();
                idxs.dedup();
                acq.intended_for = Some(idxs);
                resolved += 1;
            }
        }

        acq.b0_field_identifier = series.b0_field_identifier.clone();
        acq.b0_field_source = series.b0_field_source.clone();
    }

    debug!(resolved, "IntendedFor resolved");
    acquisitions
}

fn eligible(acq: &Acquisition) -> bool {
    acq.is_candidate() && acq.kind != FUNC_EVENTS
}
