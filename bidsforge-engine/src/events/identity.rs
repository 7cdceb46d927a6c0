//! Identity heuristics for timing files
//!
//! Subject, session, task and run are looked up, in order, in a column whose
//! name matches an alias, then in the file path. Values that only match a
//! known label once leading zeros are removed are normalised to that label.
//! Whatever stays unresolved becomes a placeholder chosen by the caller.

use super::ParsedEvents;
use crate::model::Acquisition;
use std::collections::{BTreeSet, HashMap};

pub const SUBJECT_ALIASES: &[&str] = &[
    "sub", "subid", "subname", "subj", "subjid", "subjname", "subject", "subjectid",
    "subjectname", "participant", "participantid", "participantname",
];
pub const SESSION_ALIASES: &[&str] = &[
    "ses", "sesid", "sesname", "sess", "sessid", "sessname", "session", "sessionid",
    "sessionname",
];
pub const TASK_ALIASES: &[&str] = &[
    "task", "taskid", "taskname", "exp", "expid", "expname", "experiment", "experimentid",
    "experimentname",
];
pub const RUN_ALIASES: &[&str] = &["run", "runid", "runname", "runnum", "runnumber"];

/// Task label given to files whose task cannot be found
pub const UNKNOWN_TASK: &str = "unknown";

const PATH_SEPARATORS: &[char] = &['.', '-', '_', '/'];

/// Labels already present in the dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownValues {
    pub subjects: BTreeSet<String>,
    pub sessions: BTreeSet<String>,
    pub tasks: BTreeSet<String>,
    pub runs: BTreeSet<String>,
}

impl KnownValues {
    pub fn collect(acquisitions: &[Acquisition]) -> Self {
        let mut known = Self::default();
        for acq in acquisitions.iter().filter(|a| !a.is_excluded()) {
            insert_non_empty(&mut known.subjects, acq.entity("subject"));
            insert_non_empty(&mut known.sessions, acq.entity("session"));

            let task = acq.entity("task");
            if acq.has_primary_part() && task != "rest" {
                insert_non_empty(&mut known.tasks, task);
            }
            if !task.is_empty() {
                insert_non_empty(&mut known.runs, acq.entity("run"));
            }
        }
        known
    }
}

fn insert_non_empty(set: &mut BTreeSet<String>, value: &str) {
    if !value.is_empty() {
        set.insert(value.to_string());
    }
}

/// Issues `XX1`, `XX2`, ... for one decoding batch
#[derive(Debug, Default)]
pub struct Placeholders {
    issued: u32,
}

impl Placeholders {
    pub fn next(&mut self) -> String {
        self.issued += 1;
        format!("XX{}", self.issued)
    }
}

pub fn resolve_subject(events: &ParsedEvents, path: &str, known: &KnownValues) -> Option<String> {
    lookup(events, path, SUBJECT_ALIASES).map(|v| strip_known_zeros(v, &known.subjects))
}

pub fn resolve_session(events: &ParsedEvents, path: &str, known: &KnownValues) -> Option<String> {
    lookup(events, path, SESSION_ALIASES).map(|v| strip_known_zeros(v, &known.sessions))
}

pub fn resolve_run(events: &ParsedEvents, path: &str, known: &KnownValues) -> Option<String> {
    lookup(events, path, RUN_ALIASES).map(|v| strip_known_zeros(v, &known.runs))
}

/// Task from a column or the path, else any cell naming a known task.
/// Case is normalised to the known label.
pub fn resolve_task(events: &ParsedEvents, path: &str, known: &KnownValues) -> Option<String> {
    let matching_known = |value: &str| {
        known
            .tasks
            .iter()
            .find(|task| task.eq_ignore_ascii_case(value))
            .cloned()
    };

    match lookup(events, path, TASK_ALIASES) {
        Some(found) => Some(matching_known(&found).unwrap_or(found)),
        None => events.cells().find_map(|cell| matching_known(cell.trim())),
    }
}

fn lookup(events: &ParsedEvents, path: &str, aliases: &[&str]) -> Option<String> {
    column_value(events, aliases).or_else(|| path_value(path, aliases))
}

/// Header name reduced to lower-case alphanumerics
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Most frequent non-empty value of the first column whose name is an alias
pub fn column_value(events: &ParsedEvents, aliases: &[&str]) -> Option<String> {
    let header = events
        .headers
        .iter()
        .find(|h| aliases.contains(&normalize_header(h).as_str()))?;

    most_frequent(
        events
            .rows
            .iter()
            .filter_map(|row| row.get(header))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty()),
    )
}

/// Most frequent value; ties go to the value seen first
pub fn most_frequent<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, value) in values.enumerate() {
        counts.entry(value).or_insert((0, position)).0 += 1;
    }

    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(value, _)| value.to_string())
}

/// Token following an alias in the path, up to the next separator
///
/// Longer aliases are tried first so `subject01` is not read through `sub`.
pub fn path_value(path: &str, aliases: &[&str]) -> Option<String> {
    let lower = path.to_ascii_lowercase();
    let mut ordered: Vec<&str> = aliases.to_vec();
    ordered.sort_by_key(|alias| std::cmp::Reverse(alias.len()));

    for alias in ordered {
        for (start, _) in lower.match_indices(alias) {
            let rest = path[start + alias.len()..].trim_start_matches(PATH_SEPARATORS);
            let token = rest.split(PATH_SEPARATORS).next().unwrap_or_default();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// `"007"` becomes `"7"` when only the stripped form is a known label
pub fn strip_known_zeros(value: String, known: &BTreeSet<String>) -> String {
    if known.contains(&value) {
        return value;
    }
    let stripped = value.trim_start_matches('0');
    if !stripped.is_empty() && known.contains(stripped) {
        stripped.to_string()
    } else {
        value
    }
}

/// Highest numeric run already used for this subject/session/task
pub fn highest_run(acquisitions: &[Acquisition], subject: &str, session: &str, task: &str) -> u32 {
    acquisitions
        .iter()
        .filter(|a| {
            a.entity("subject") == subject && a.entity("session") == session && a.entity("task") == task
        })
        .filter_map(|a| a.entity("run").parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::acq;
    use std::collections::BTreeMap;

    fn table(headers: &[&str], rows: &[&[&str]]) -> ParsedEvents {
        ParsedEvents {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| {
                    headers
                        .iter()
                        .zip(r.iter())
                        .map(|(h, v)| (h.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>()
                })
                .collect(),
        }
    }

    fn known(subjects: &[&str], tasks: &[&str]) -> KnownValues {
        KnownValues {
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            tasks: tasks.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_most_frequent_tie_goes_to_first_seen() {
        assert_eq!(most_frequent(["b", "a", "a", "b"].into_iter()), Some("b".to_string()));
        assert_eq!(most_frequent(["b", "a", "a"].into_iter()), Some("a".to_string()));
        assert_eq!(most_frequent(std::iter::empty()), None);
    }

    #[test]
    fn test_column_alias_after_normalisation() {
        let events = table(&["Subject_ID", "onset"], &[&["12", "1"], &["12", "2"], &["13", "3"]]);
        assert_eq!(column_value(&events, SUBJECT_ALIASES), Some("12".to_string()));
    }

    #[test]
    fn test_path_token_prefers_longest_alias() {
        assert_eq!(path_value("data/subject-07_block.csv", SUBJECT_ALIASES), Some("07".to_string()));
        assert_eq!(path_value("data/Sub_03/run2.csv", SUBJECT_ALIASES), Some("03".to_string()));
        assert_eq!(path_value("data/run2.csv", RUN_ALIASES), Some("2".to_string()));
        assert_eq!(path_value("data/timing.csv", SESSION_ALIASES), None);
    }

    #[test]
    fn test_leading_zeros_stripped_only_when_known() {
        let events = table(&["onset"], &[&["1"]]);
        let k = known(&["7"], &[]);
        assert_eq!(resolve_subject(&events, "sub-007.csv", &k), Some("7".to_string()));
        assert_eq!(resolve_subject(&events, "sub-008.csv", &k), Some("008".to_string()));
    }

    #[test]
    fn test_task_found_in_cells_and_case_normalised() {
        let k = known(&[], &["nBack"]);
        let events = table(&["condition", "onset"], &[&["NBACK", "1"]]);
        assert_eq!(resolve_task(&events, "timing.csv", &k), Some("nBack".to_string()));

        let events = table(&["onset"], &[&["1"]]);
        assert_eq!(resolve_task(&events, "task-NBACK.csv", &k), Some("nBack".to_string()));
        assert_eq!(resolve_task(&events, "timing.csv", &k), None);
    }

    #[test]
    fn test_known_values_from_acquisitions() {
        let acqs = vec![
            acq("func/bold", &[("subject", "01"), ("session", "a"), ("task", "rest"), ("run", "1")]),
            acq("func/bold", &[("subject", "02"), ("task", "nback"), ("run", "2")]),
            acq("anat/T1w", &[("subject", "03"), ("run", "9")]),
        ];
        let k = KnownValues::collect(&acqs);
        assert_eq!(k.subjects.len(), 3);
        assert_eq!(k.sessions.len(), 1);
        assert_eq!(k.tasks.iter().collect::<Vec<_>>(), vec!["nback"]);
        assert_eq!(k.runs.iter().collect::<Vec<_>>(), vec!["1", "2"]);
    }
}
