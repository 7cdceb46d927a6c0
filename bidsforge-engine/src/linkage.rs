//! Linkage Engine
//!
//! Run numbering and one-directional propagation from primary acquisitions to
//! their dependents. Adjacency comes from the organizer (`Acquisition::links`),
//! keyed by stable id, so nothing here depends on `idx` arithmetic.

use crate::model::{
    positions_by_id, Acquisition, Entities, FUNC_BOLD, FUNC_EVENTS, FUNC_SBREF,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Entities ignored when deciding whether two acquisitions are runs of the
/// same thing
const RUN_GROUP_IGNORED: &[&str] = &["part", "run", "echo"];

/// Number repeated acquisitions
///
/// Members of a group (same type, same entities apart from part/run/echo) are
/// numbered 1..N in idx order when the group has more than one member, or a
/// single functional member. A primary-part member whose echo is empty or 1
/// starts a new run; later echoes share it. Secondary-part members (phase,
/// imag) take the run of their primary sibling and are excluded when there is
/// none.
pub fn set_run(mut acquisitions: Vec<Acquisition>) -> Vec<Acquisition> {
    let mut groups: BTreeMap<(String, Entities), Vec<usize>> = BTreeMap::new();
    for (pos, acq) in acquisitions.iter().enumerate() {
        if !acq.is_candidate() || acq.kind == FUNC_EVENTS {
            continue;
        }
        groups.entry(run_group_key(acq)).or_default().push(pos);
    }

    let mut secondaries = Vec::new();
    let mut numbered = 0;

    for ((kind, _), mut members) in groups {
        members.sort_by_key(|&pos| acquisitions[pos].idx);
        let qualifies = members.len() > 1 || kind.starts_with("func/");

        let mut run = 0;
        for pos in members {
            let acq = &mut acquisitions[pos];
            if !acq.has_primary_part() {
                if qualifies {
                    secondaries.push(pos);
                } else {
                    acq.set_default_entity("run", None);
                }
                continue;
            }
            if !qualifies {
                acq.set_default_entity("run", None);
                continue;
            }
            let echo = acq.entity("echo");
            if echo.is_empty() || echo == "1" || run == 0 {
                run += 1;
            }
            acq.set_default_entity("run", Some(&run.to_string()));
            numbered += 1;
        }
    }

    // Primaries are settled; secondary parts follow their sibling
    let positions = positions_by_id(&acquisitions);
    for pos in secondaries {
        let sibling = acquisitions[pos]
            .links
            .primary_sibling
            .and_then(|id| positions.get(&id).copied());

        match sibling {
            Some(sibling_pos) => {
                let run = acquisitions[sibling_pos].entity("run").to_string();
                acquisitions[pos].set_default_entity("run", Some(&run));
            }
            None => {
                let acq = &mut acquisitions[pos];
                let message = format!(
                    "Acquisition #{} has part-{} but no preceding magnitude/real acquisition of type {} was found, so its run number cannot be determined. It has been excluded.",
                    acq.display_index(),
                    acq.entity("part"),
                    acq.kind
                );
                acq.set_default_entity("run", None);
                acq.force_exclude(message);
            }
        }
    }

    debug!(numbered, "Run numbering complete");
    acquisitions
}

fn run_group_key(acq: &Acquisition) -> (String, Entities) {
    let mut entities = acq.resolved_entities();
    entities.retain(|key, _| !RUN_GROUP_IGNORED.contains(&key.as_str()));
    (acq.kind.clone(), entities)
}

/// Propagate entities and exclusion from primary acquisitions to dependents
///
/// - secondary part <- its magnitude/real sibling (everything but `part`)
/// - func/sbref <- the func/bold it precedes (everything but `echo`; also not
///   `part` when the bold is a phase image)
/// - func/events <- the primary-part func/bold with the same
///   subject/session/task/run (everything but `part`/`echo`, plus section)
pub fn file_logic_link(mut acquisitions: Vec<Acquisition>) -> Vec<Acquisition> {
    let positions = positions_by_id(&acquisitions);
    let mut linked = 0;

    for pos in 0..acquisitions.len() {
        let links = acquisitions[pos].links.clone();

        if let Some(primary) = links.primary_sibling.and_then(|id| positions.get(&id).copied()) {
            let source = Primary::capture(&acquisitions[primary]);
            source.apply(&mut acquisitions[pos], &["part"], "magnitude/real");
            linked += 1;
        }

        if acquisitions[pos].kind == FUNC_SBREF {
            if let Some(bold) = links.following_bold.and_then(|id| positions.get(&id).copied()) {
                let source = Primary::capture(&acquisitions[bold]);
                let skip: &[&str] = if acquisitions[bold].entity("part") == "phase" {
                    &["echo", "part"]
                } else {
                    &["echo"]
                };
                source.apply(&mut acquisitions[pos], skip, "func/bold");
                linked += 1;
            }
        }

        if acquisitions[pos].kind == FUNC_EVENTS {
            if let Some(bold) = matching_bold(&acquisitions, pos) {
                let source = Primary::capture(&acquisitions[bold]);
                let section_id = acquisitions[bold].analysis.section_id;
                let events = &mut acquisitions[pos];
                source.apply(events, &["part", "echo"], "func/bold");
                events.analysis.section_id = section_id;
                linked += 1;
            }
        }
    }

    debug!(linked, "Dependent acquisitions linked");
    acquisitions
}

/// The primary-part func/bold an events acquisition belongs to
fn matching_bold(acquisitions: &[Acquisition], events_pos: usize) -> Option<usize> {
    let events = &acquisitions[events_pos];
    let key = identity_key(events);

    acquisitions
        .iter()
        .position(|acq| acq.link_kind() == FUNC_BOLD && acq.has_primary_part() && identity_key(acq) == key)
}

fn identity_key(acq: &Acquisition) -> [&str; 4] {
    [
        acq.entity("subject"),
        acq.entity("session"),
        acq.entity("task"),
        acq.entity("run"),
    ]
}

/// Snapshot of what a dependent inherits from its primary
struct Primary {
    entities: Entities,
    excluded: bool,
    display_index: usize,
}

impl Primary {
    fn capture(acq: &Acquisition) -> Self {
        Self {
            entities: acq.resolved_entities(),
            excluded: acq.is_excluded(),
            display_index: acq.display_index(),
        }
    }

    fn apply(&self, dependent: &mut Acquisition, skip: &[&str], relation: &str) {
        let stale: Vec<String> = dependent
            .computed
            .keys()
            .filter(|key| !skip.contains(&key.as_str()) && !self.entities.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            dependent.set_default_entity(&key, None);
        }
        for (key, value) in &self.entities {
            if !skip.contains(&key.as_str()) {
                dependent.set_default_entity(key, Some(value));
            }
        }

        // A dependent the user excluded on its own stays excluded either way
        let user_excluded = dependent.exclude && !dependent.exclusion_inherited;
        if self.excluded && !user_excluded {
            dependent.exclude = true;
            dependent.exclude_in_effect = true;
            dependent.exclusion_inherited = true;
            dependent.analysis.warnings = vec![format!(
                "This acquisition has been excluded because its corresponding {relation} acquisition (#{}) is excluded.",
                self.display_index
            )];
        } else if !self.excluded && dependent.exclusion_inherited {
            if dependent.exclude_in_effect {
                dependent.analysis.errors.clear();
            }
            dependent.exclude = false;
            dependent.exclude_in_effect = false;
            dependent.exclusion_inherited = false;
        }
    }
}
