//! DWI distortion-correction coverage

use super::warn;
use crate::entities::reverse_direction;
use crate::model::{series_lookup, Acquisition, Series, DWI_DWI};
use tracing::debug;

/// Warn DWI acquisitions that cannot be distortion-corrected
///
/// Coverage is either a `dwi/dwi` in the same session acquired with the
/// reversed phase-encoding direction, or a field map in the same section whose
/// `IntendedFor` lists this acquisition.
pub fn dwi_qa(mut acquisitions: Vec<Acquisition>, series: &[Series]) -> Vec<Acquisition> {
    let lookup = series_lookup(series);
    let direction = |acq: &Acquisition| {
        acq.direction_label(acq.series_idx.and_then(|s| lookup.get(&s).copied()))
    };

    let dwis: Vec<(usize, (String, String), String)> = acquisitions
        .iter()
        .enumerate()
        .filter(|(_, a)| a.kind == DWI_DWI && a.is_candidate())
        .map(|(pos, a)| (pos, a.session_key(), direction(a)))
        .collect();

    let mut uncovered = Vec::new();
    for (pos, session, label) in &dwis {
        let reversed = reverse_direction(label);
        let has_reverse = !label.is_empty()
            && dwis
                .iter()
                .any(|(other, s, l)| other != pos && s == session && *l == reversed);

        let acq = &acquisitions[*pos];
        let has_fmap = acquisitions.iter().any(|f| {
            f.modality() == "fmap"
                && f.is_candidate()
                && f.section_key() == acq.section_key()
                && f.intended_for.as_ref().is_some_and(|t| t.contains(&acq.idx))
        });

        if !has_reverse && !has_fmap {
            uncovered.push(*pos);
        }
    }

    for &pos in &uncovered {
        warn(
            &mut acquisitions[pos],
            "No field map or reverse phase-encoded dwi/dwi acquisition was found for this DWI acquisition, so it cannot be corrected for susceptibility distortion.".to_string(),
        );
    }

    debug!(uncovered = uncovered.len(), "DWI QA complete");
    acquisitions
}
