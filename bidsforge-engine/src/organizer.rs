//! Organizer
//!
//! Rebuilds the subject -> session -> acquisition hierarchy from the flat
//! acquisition list. Nothing is maintained incrementally: every call sorts the
//! list into scan order, reassigns `idx`, recomputes the linkage adjacency and
//! returns a fresh hierarchy, so calling it twice is the same as calling it once.
//!
//! Section assignment walks each session in scan order and starts a new section
//! whenever a localizer follows a non-localizer (re-entry to the scanner).

use crate::model::{
    series_lookup, Acquisition, Links, Series, EXCLUDE_TYPE, FUNC_BOLD, FUNC_EVENTS, FUNC_SBREF,
};
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;
use uuid::Uuid;

/// One subject with its sessions, in scan order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubjectGroup {
    pub subject: String,
    pub sessions: Vec<SessionGroup>,
}

/// One session with the idx values of its acquisitions, in scan order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionGroup {
    pub session: String,
    pub acquisitions: Vec<usize>,
}

/// Sort into scan order, reassign `idx`, compute adjacency and hierarchy
pub fn organize(mut acquisitions: Vec<Acquisition>) -> (Vec<Acquisition>, Vec<SubjectGroup>) {
    acquisitions.sort_by(scan_order);

    for (pos, acq) in acquisitions.iter_mut().enumerate() {
        acq.idx = pos;
        acq.links = Links::default();
    }

    let groups = group_sessions(&acquisitions);
    link_adjacent(&mut acquisitions, &groups);

    debug!(
        acquisitions = acquisitions.len(),
        subjects = groups.len(),
        "Organized acquisitions"
    );

    (acquisitions, groups)
}

/// Scan-order comparator
///
/// Tie-break order: subject, session, acquisition date, acquisition time,
/// first companion path, stable id. Input position never participates, so any
/// permutation of the same list sorts identically.
pub fn scan_order(a: &Acquisition, b: &Acquisition) -> Ordering {
    a.entity("subject")
        .cmp(b.entity("subject"))
        .then_with(|| a.entity("session").cmp(b.entity("session")))
        .then_with(|| compare_timestamps(a, b))
        .then_with(|| first_path(a).cmp(first_path(b)))
        .then_with(|| a.id.cmp(&b.id))
}

fn compare_timestamps(a: &Acquisition, b: &Acquisition) -> Ordering {
    let date = |acq: &Acquisition| NaiveDate::parse_from_str(acq.acquisition_date.trim(), "%Y-%m-%d").ok();
    let time = |acq: &Acquisition| NaiveTime::parse_from_str(acq.acquisition_time.trim(), "%H:%M:%S%.f").ok();

    date(a)
        .cmp(&date(b))
        .then_with(|| a.acquisition_date.cmp(&b.acquisition_date))
        .then_with(|| time(a).cmp(&time(b)))
        .then_with(|| a.acquisition_time.cmp(&b.acquisition_time))
}

fn first_path(acq: &Acquisition) -> &str {
    acq.items.first().map(|item| item.path.as_str()).unwrap_or("")
}

fn group_sessions(acquisitions: &[Acquisition]) -> Vec<SubjectGroup> {
    let mut groups: Vec<SubjectGroup> = Vec::new();

    for acq in acquisitions {
        let subject = acq.entity("subject");
        let session = acq.entity("session");

        if groups.last().map(|g| g.subject.as_str()) != Some(subject) {
            groups.push(SubjectGroup {
                subject: subject.to_string(),
                sessions: Vec::new(),
            });
        }
        let Some(group) = groups.last_mut() else {
            continue;
        };
        if group.sessions.last().map(|s| s.session.as_str()) != Some(session) {
            group.sessions.push(SessionGroup {
                session: session.to_string(),
                acquisitions: Vec::new(),
            });
        }
        if let Some(session_group) = group.sessions.last_mut() {
            session_group.acquisitions.push(acq.idx);
        }
    }

    groups
}

/// Record, by stable id, which acquisition each dependent one links to
fn link_adjacent(acquisitions: &mut [Acquisition], groups: &[SubjectGroup]) {
    for session in groups.iter().flat_map(|g| &g.sessions) {
        let order = &session.acquisitions;

        for (pos, &idx) in order.iter().enumerate() {
            let acq = &acquisitions[idx];
            if acq.kind == EXCLUDE_TYPE {
                continue;
            }

            let mut links = Links::default();
            if !acq.has_primary_part() {
                links.primary_sibling = primary_sibling(acquisitions, order, pos);
            }
            if acq.kind == FUNC_SBREF {
                links.following_bold = following_bold(acquisitions, order, pos);
            }
            acquisitions[idx].links = links;
        }
    }
}

/// Magnitude/real sibling of a secondary-part acquisition, looked up one and
/// two positions back in scan order. A sibling with the same echo is preferred,
/// then the nearer one.
fn primary_sibling(acquisitions: &[Acquisition], order: &[usize], pos: usize) -> Option<Uuid> {
    let acq = &acquisitions[order[pos]];
    let echo = acq.entity("echo");

    let mut candidates: Vec<(usize, &Acquisition)> = (1..=2)
        .filter_map(|back| pos.checked_sub(back).map(|p| (back, &acquisitions[order[p]])))
        .filter(|(_, other)| other.link_kind() == acq.kind && other.has_primary_part())
        .collect();

    candidates.sort_by_key(|(distance, other)| (other.entity("echo") != echo, *distance));
    candidates.first().map(|(_, other)| other.id)
}

/// The func/bold an sbref precedes: scanning forward over the contiguous block
/// of sbref/bold acquisitions, the first bold with the same `part`, else the
/// first bold. A second sbref after a bold ends the block.
///
/// Bolds retyped to `exclude` still count through their remembered type. An
/// `exclude` acquisition whose type was never recorded stands in for the bold
/// when it is the first scan after the sbref block.
fn following_bold(acquisitions: &[Acquisition], order: &[usize], pos: usize) -> Option<Uuid> {
    let part = acquisitions[order[pos]].entity("part");
    let mut first_bold = None;
    let mut seen_bold = false;

    for &idx in &order[pos + 1..] {
        let next = &acquisitions[idx];
        match next.link_kind() {
            FUNC_SBREF if seen_bold => break,
            FUNC_SBREF => continue,
            FUNC_BOLD => {
                seen_bold = true;
                if next.entity("part") == part {
                    return Some(next.id);
                }
                first_bold.get_or_insert(next.id);
            }
            EXCLUDE_TYPE if !seen_bold => return Some(next.id),
            _ => break,
        }
    }

    first_bold
}

/// Assign `analysisResults.section_id` per session
///
/// Events acquisitions take their section from their bold during linkage and
/// are skipped here.
pub fn assign_sections(
    mut acquisitions: Vec<Acquisition>,
    groups: &[SubjectGroup],
    series: &[Series],
) -> Vec<Acquisition> {
    let lookup = series_lookup(series);

    for session in groups.iter().flat_map(|g| &g.sessions) {
        let mut section_id = 1;
        let mut previous: Option<bool> = None;

        for &idx in &session.acquisitions {
            let acq = &mut acquisitions[idx];
            if acq.kind == FUNC_EVENTS {
                continue;
            }

            let is_localizer = acq
                .series_idx
                .and_then(|s| lookup.get(&s))
                .is_some_and(|s| s.is_localizer());

            // previous: None at session start, else whether it was a localizer
            if is_localizer && previous == Some(false) {
                section_id += 1;
            }
            acq.analysis.section_id = section_id;
            previous = Some(is_localizer);
        }
    }

    acquisitions
}
