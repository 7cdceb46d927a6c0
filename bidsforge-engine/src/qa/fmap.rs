//! Field-map cardinality checks
//!
//! Field maps of a section are sorted into mutually exclusive cases by suffix.
//! Each case expects a fixed number of acquisitions; too few and every member
//! is flagged as incomplete, too many and the oldest surplus members are
//! flagged as probable duplicates (the most recent ones are assumed to be the
//! intended set).
//!
//! # Cases
//! - phase difference: `phasediff` + `magnitude1` [+ `magnitude2`], 2 to 3
//! - two phase images: `phase1` + `phase2` + `magnitude1` + `magnitude2`, 4
//! - direct field map: `magnitude` + `fieldmap`, 2
//! - PEpolar: `epi`, 2
//! - quantitative pairs (`TB1DAM`, `TB1EPI`, `TB1AFI`, `TB1TFL`, `TB1RFM`,
//!   `RB1COR`), 2 each
//! - quantitative singles (`TB1map`, `RB1map`), 1 each
//!
//! A case is only present when its identifying suffix is: a lone
//! `magnitude1` does not make a phase-difference set. Magnitude images are
//! claimed by the phase-difference case first, then the two-phase case.
//!
//! The PEpolar count is only checked when the section also holds direct
//! field-map images. This coupling is kept as-is.

use super::warn;
use crate::model::Acquisition;
use std::collections::BTreeMap;
use tracing::debug;

const QUANTITATIVE_PAIRS: &[&str] = &["TB1DAM", "TB1EPI", "TB1AFI", "TB1TFL", "TB1RFM", "RB1COR"];
const QUANTITATIVE_SINGLES: &[&str] = &["TB1map", "RB1map"];

/// One field-map case found in a section
struct Bucket {
    label: String,
    min: usize,
    max: usize,
    /// Positions in the acquisition list, in scan order
    members: Vec<usize>,
}

impl Bucket {
    fn new(label: impl Into<String>, min: usize, max: usize, members: Vec<usize>) -> Self {
        Self {
            label: label.into(),
            min,
            max,
            members,
        }
    }

    fn expected(&self) -> String {
        if self.min == self.max {
            self.min.to_string()
        } else {
            format!("{} to {}", self.min, self.max)
        }
    }
}

/// Check field-map cardinality per section
pub fn fmap_qa(mut acquisitions: Vec<Acquisition>) -> Vec<Acquisition> {
    let mut sections: BTreeMap<(String, String, u32), Vec<usize>> = BTreeMap::new();
    for (pos, acq) in acquisitions.iter().enumerate() {
        if acq.is_candidate() && acq.modality() == "fmap" {
            sections.entry(acq.section_key()).or_default().push(pos);
        }
    }

    let mut flagged = 0;
    for ((_, _, section_id), mut positions) in sections {
        positions.sort_by_key(|&pos| acquisitions[pos].idx);

        for bucket in classify(&acquisitions, &positions) {
            let count = bucket.members.len();

            if count < bucket.min {
                for &pos in &bucket.members {
                    warn(
                        &mut acquisitions[pos],
                        format!(
                            "The {} field map set in section {section_id} is incomplete: found {count} acquisition(s), expected {}.",
                            bucket.label,
                            bucket.expected()
                        ),
                    );
                    flagged += 1;
                }
            } else if count > bucket.max {
                for &pos in &bucket.members[..count - bucket.max] {
                    warn(
                        &mut acquisitions[pos],
                        format!(
                            "There are too many {} field map acquisitions in section {section_id} ({count}, expected {}). Assuming the most recent {} are the intended set, this one is likely a duplicate.",
                            bucket.label,
                            bucket.expected(),
                            bucket.max
                        ),
                    );
                    flagged += 1;
                }
            }
        }
    }

    debug!(flagged, "Field map QA complete");
    acquisitions
}

fn classify(acquisitions: &[Acquisition], positions: &[usize]) -> Vec<Bucket> {
    let with_suffix = |suffixes: &[&str]| -> Vec<usize> {
        positions
            .iter()
            .copied()
            .filter(|&pos| suffixes.contains(&acquisitions[pos].suffix()))
            .collect()
    };
    let has = |suffixes: &[&str]| !with_suffix(suffixes).is_empty();

    let mut buckets = Vec::new();

    let phasediff_present = has(&["phasediff"]);
    if phasediff_present {
        buckets.push(Bucket::new(
            "phase difference",
            2,
            3,
            with_suffix(&["phasediff", "magnitude1", "magnitude2"]),
        ));
    }

    if has(&["phase1", "phase2"]) {
        let suffixes: &[&str] = if phasediff_present {
            &["phase1", "phase2"]
        } else {
            &["phase1", "phase2", "magnitude1", "magnitude2"]
        };
        buckets.push(Bucket::new("two-phase", 4, 4, with_suffix(suffixes)));
    }

    let direct = with_suffix(&["magnitude", "fieldmap"]);
    if has(&["fieldmap"]) {
        buckets.push(Bucket::new("direct field map", 2, 2, direct.clone()));
    }

    if !direct.is_empty() && has(&["epi"]) {
        buckets.push(Bucket::new("PEpolar", 2, 2, with_suffix(&["epi"])));
    }

    for &suffix in QUANTITATIVE_PAIRS {
        if has(&[suffix]) {
            buckets.push(Bucket::new(suffix, 2, 2, with_suffix(&[suffix])));
        }
    }
    for &suffix in QUANTITATIVE_SINGLES {
        if has(&[suffix]) {
            buckets.push(Bucket::new(suffix, 1, 1, with_suffix(&[suffix])));
        }
    }

    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{acq, indexed};

    fn fmaps(suffixes: &[&str]) -> Vec<Acquisition> {
        indexed(
            suffixes
                .iter()
                .map(|s| acq(&format!("fmap/{s}"), &[("subject", "01")]))
                .collect(),
        )
    }

    fn warned(acqs: &[Acquisition]) -> Vec<bool> {
        acqs.iter().map(|a| !a.analysis.warnings.is_empty()).collect()
    }

    #[test]
    fn test_phasediff_pair_is_valid() {
        let acqs = fmap_qa(fmaps(&["magnitude1", "phasediff"]));
        assert_eq!(warned(&acqs), vec![false, false]);
    }

    #[test]
    fn test_phasediff_duplicate_magnitude_flags_oldest() {
        let acqs = fmap_qa(fmaps(&["magnitude1", "magnitude1", "magnitude2", "phasediff"]));
        assert_eq!(warned(&acqs), vec![true, false, false, false]);
        assert!(acqs[0].analysis.warnings[0].contains("too many"));
    }

    #[test]
    fn test_lone_magnitude_is_not_a_phasediff_set() {
        let acqs = fmap_qa(fmaps(&["magnitude1"]));
        assert_eq!(warned(&acqs), vec![false]);
    }

    #[test]
    fn test_incomplete_two_phase_warns_every_member() {
        let acqs = fmap_qa(fmaps(&["magnitude1", "magnitude2", "phase1"]));
        assert_eq!(warned(&acqs), vec![true, true, true]);
        assert!(acqs[0].analysis.warnings[0].contains("incomplete"));
    }

    #[test]
    fn test_direct_and_quantitative_cases() {
        let acqs = fmap_qa(fmaps(&["magnitude", "fieldmap", "TB1DAM", "TB1map", "TB1map"]));
        assert_eq!(warned(&acqs), vec![false, false, true, true, false]);
    }

    #[test]
    fn test_pepolar_only_checked_alongside_direct_field_map() {
        // Three epi images alone pass unchecked
        let acqs = fmap_qa(fmaps(&["epi", "epi", "epi"]));
        assert_eq!(warned(&acqs), vec![false, false, false]);

        let acqs = fmap_qa(fmaps(&["magnitude", "fieldmap", "epi", "epi", "epi"]));
        assert_eq!(warned(&acqs), vec![false, false, true, false, false]);
    }

    #[test]
    fn test_sections_are_checked_independently() {
        let mut acqs = fmaps(&["magnitude1", "phasediff", "magnitude1", "phasediff"]);
        acqs[2].analysis.section_id = 2;
        acqs[3].analysis.section_id = 2;
        let acqs = fmap_qa(acqs);
        assert_eq!(warned(&acqs), vec![false; 4]);
    }
}
