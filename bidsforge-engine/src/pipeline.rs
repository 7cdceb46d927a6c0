//! Pass driver
//!
//! One pass runs every rule in a fixed order:
//! organize -> sections -> exclusion sync -> entity resolution -> linkage -> QA.
//! Later rules read what earlier ones wrote (QA needs sections and merged
//! entities), so the order is not negotiable.
//!
//! A single pass is not always a fixpoint: QA may force an exclusion that
//! linkage only mirrors onto dependents in the next pass. [`analyze`] repeats
//! passes until the acquisition list stops changing, so analysing an already
//! analysed document changes nothing.

use crate::linkage::{file_logic_link, set_run};
use crate::model::{series_lookup, Acquisition, Document, Series, EXCLUDE_TYPE};
use crate::organizer::{assign_sections, organize, SubjectGroup};
use crate::qa;
use crate::resolver::{align_entities, validate_entities, validate_series};
use bidsforge_common::config::EngineSettings;
use tracing::{debug, info, warn};

/// Run passes over the document until it is stable
pub fn analyze(mut document: Document, settings: &EngineSettings) -> Document {
    document.series = validate_series(std::mem::take(&mut document.series));

    let mut acquisitions = std::mem::take(&mut document.objects);
    let mut organized = Vec::new();
    let mut passes = 0;
    let mut stable = false;

    while passes < settings.max_passes {
        passes += 1;
        let previous = acquisitions.clone();
        let (next, groups) = run_pass(acquisitions, &document.series, settings);
        acquisitions = next;
        organized = groups;

        if acquisitions == previous {
            stable = true;
            break;
        }
        debug!(pass = passes, "Acquisition list changed, running another pass");
    }

    if !stable {
        warn!(passes, "Analysis did not stabilise within the pass limit");
    }

    let excluded = acquisitions.iter().filter(|a| a.is_excluded()).count();
    let with_errors = acquisitions
        .iter()
        .filter(|a| !a.is_excluded() && !a.validation_errors.is_empty())
        .count();
    info!(
        passes,
        acquisitions = acquisitions.len(),
        excluded,
        with_errors,
        "Analysis complete"
    );

    document.objects = acquisitions;
    document.organized = organized;
    document.analyzed = true;
    document
}

/// One full pass of every rule, in order
pub fn run_pass(
    acquisitions: Vec<Acquisition>,
    series: &[Series],
    settings: &EngineSettings,
) -> (Vec<Acquisition>, Vec<SubjectGroup>) {
    let (acquisitions, groups) = organize(acquisitions);
    let acquisitions = assign_sections(acquisitions, &groups, series);
    let acquisitions = begin_pass(acquisitions, series);

    let acquisitions = align_entities(acquisitions);
    let acquisitions = validate_entities(acquisitions, series);

    let acquisitions = set_run(acquisitions);
    let acquisitions = file_logic_link(acquisitions);

    let acquisitions = qa::func_volume_threshold(acquisitions, settings.min_func_duration_sec);
    let acquisitions = qa::set_intended_for(acquisitions, series);
    let acquisitions = qa::func_sbref_ped(acquisitions, series);
    let acquisitions = qa::fmap_qa(acquisitions);
    let acquisitions = qa::dwi_qa(acquisitions, series);

    (acquisitions, groups)
}

/// Sync exclusion state and reset rule-generated diagnostics
///
/// `_exclude` follows `exclude` (or the `exclude` type). An acquisition coming
/// back into the dataset loses its stale analysis errors. Warnings restart from
/// the ones recorded at ingestion, so any rule that no longer fires retracts
/// its message. The real type is recorded for later linkage.
pub fn begin_pass(mut acquisitions: Vec<Acquisition>, series: &[Series]) -> Vec<Acquisition> {
    let lookup = series_lookup(series);
    for acq in &mut acquisitions {
        acq.remember_kind(acq.series_idx.and_then(|s| lookup.get(&s).copied()));
        let in_effect = acq.exclude || acq.kind == EXCLUDE_TYPE;
        if acq.exclude_in_effect && !in_effect {
            debug!(idx = acq.idx, "Acquisition re-included");
            acq.analysis.errors.clear();
        }
        acq.exclude_in_effect = in_effect;
        acq.analysis.warnings = acq.analysis.ingest_warnings.clone();
        acq.validation_errors.clear();
        acq.validation_warnings.clear();
    }
    acquisitions
}
