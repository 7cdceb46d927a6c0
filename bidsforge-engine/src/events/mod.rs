//! Events Decoder
//!
//! Turns behavioral timing files (delimited text, legacy line-oriented logs,
//! spreadsheet cell maps) into `func/events` acquisitions, then converts their
//! rows to BIDS events tables through a user-editable column mapping.
//!
//! # Flow
//! 1. [`format::Separator::for_path`] picks the field separator from the file
//!    extension (unknown extensions are a hard failure)
//! 2. [`format::parse`] detects the layout and produces [`ParsedEvents`]
//! 3. [`identity`] resolves subject/session/task/run from the table and path,
//!    falling back to placeholders rather than guessing
//! 4. [`columns::map_event_columns`] validates or creates the mapping
//! 5. [`columns::create_events_tsv`] produces the [`EventsTable`]

pub mod columns;
pub mod format;
pub mod identity;

pub use columns::{create_events_tsv, map_event_columns, ColumnMapping, Logic, NumericColumn, Unit};
pub use format::Separator;

use crate::error::{EngineError, EngineResult};
use crate::model::{Acquisition, Item, FUNC_BOLD, FUNC_EVENTS};
use identity::{KnownValues, Placeholders};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Component, Path};
use tracing::{debug, info};
use uuid::Uuid;

/// Rows of a decoded timing file, keyed by header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvents {
    pub headers: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl ParsedEvents {
    /// Every value in row order, for free-text searches
    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().flat_map(|row| row.values().map(String::as_str))
    }
}

/// A BIDS `_events.tsv` table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl EventsTable {
    pub fn to_tsv(&self) -> String {
        let mut out = self.columns.join("\t");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }
}

/// Raw content of an uploaded timing file
#[derive(Debug, Clone, PartialEq)]
pub enum EventsContent {
    Text(String),
    /// Sparse spreadsheet cells, `"B3" -> value`
    Cells(BTreeMap<String, Value>),
}

/// One uploaded timing file
#[derive(Debug, Clone, PartialEq)]
pub struct EventsSource {
    /// Upload path, relative to the session folder
    pub path: String,
    pub content: EventsContent,
}

/// Spreadsheets arrive as a sparse cell map written next to the upload
pub const CELLS_SUFFIX: &str = "cells.json";

/// Read one uploaded timing file from the upload folder
///
/// `file` is taken relative to `upload_root` unless absolute. The source keeps
/// only the path below the root, so folder names above it never feed the
/// subject/session/task/run search. An `.xlsx` upload is read from its
/// `<file>.cells.json` cell map.
pub fn read_source(upload_root: &Path, file: &Path) -> EngineResult<EventsSource> {
    let full = upload_root.join(file);
    let relative = full
        .strip_prefix(upload_root)
        .ok()
        .filter(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
        .ok_or_else(|| EngineError::OutsideUpload(full.display().to_string()))?;
    let path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let is_spreadsheet = full
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx"));
    let content = if is_spreadsheet {
        let mut cells_path = full.into_os_string();
        cells_path.push(format!(".{CELLS_SUFFIX}"));
        let cells = serde_json::from_reader(File::open(cells_path)?)?;
        EventsContent::Cells(cells)
    } else {
        EventsContent::Text(fs::read_to_string(&full)?)
    };

    debug!(path = %path, "Read timing file");
    Ok(EventsSource { path, content })
}

/// Decode a batch of timing files into new `func/events` acquisitions
///
/// `existing` is the current acquisition list; it supplies the known
/// subject/session/task/run values and the bold each file is attached to.
pub fn decode_events(sources: &[EventsSource], existing: &[Acquisition]) -> EngineResult<Vec<Acquisition>> {
    let known = KnownValues::collect(existing);
    let mut placeholders = Placeholders::default();
    let mut batch_runs: HashMap<(String, String, String), u32> = HashMap::new();
    let mut decoded = Vec::with_capacity(sources.len());

    for source in sources {
        let separator = Separator::for_path(&source.path)?;
        let events = format::parse(&source.content, separator);
        debug!(
            path = %source.path,
            rows = events.rows.len(),
            columns = events.headers.len(),
            "Parsed timing file"
        );

        let subject = identity::resolve_subject(&events, &source.path, &known)
            .unwrap_or_else(|| placeholders.next());
        let session = identity::resolve_session(&events, &source.path, &known).unwrap_or_else(|| {
            if known.sessions.is_empty() {
                String::new()
            } else {
                placeholders.next()
            }
        });
        let task = identity::resolve_task(&events, &source.path, &known)
            .unwrap_or_else(|| identity::UNKNOWN_TASK.to_string());

        let key = (subject.clone(), session.clone(), task.clone());
        let run = match identity::resolve_run(&events, &source.path, &known) {
            Some(run) => run,
            None => {
                let next = batch_runs
                    .entry(key.clone())
                    .or_insert_with(|| identity::highest_run(existing, &subject, &session, &task));
                *next += 1;
                next.to_string()
            }
        };
        if let Ok(n) = run.parse::<u32>() {
            let highest = batch_runs.entry(key).or_insert(0);
            *highest = (*highest).max(n);
        }

        let mut acq = Acquisition {
            id: Uuid::new_v4(),
            kind: FUNC_EVENTS.to_string(),
            items: vec![Item {
                name: "events".to_string(),
                path: source.path.clone(),
                events: Some(events),
                ..Default::default()
            }],
            ..Default::default()
        };
        acq.set_default_entity("subject", Some(&subject));
        acq.set_default_entity("session", Some(&session));
        acq.set_default_entity("task", Some(&task));
        acq.set_default_entity("run", Some(&run));

        attach_to_bold(&mut acq, existing);

        info!(
            path = %source.path,
            subject = %subject,
            session = %session,
            task = %task,
            run = %run,
            "Decoded events file"
        );
        decoded.push(acq);
    }

    Ok(decoded)
}

/// Copy section, series and timing from the acquisition the events belong to,
/// preferring a primary-part func/bold with the same identity
fn attach_to_bold(events: &mut Acquisition, existing: &[Acquisition]) {
    let same_session = |a: &&Acquisition| {
        a.entity("subject") == events.entity("subject") && a.entity("session") == events.entity("session")
    };

    let bold = existing
        .iter()
        .filter(same_session)
        .find(|a| {
            a.kind == FUNC_BOLD
                && a.has_primary_part()
                && a.entity("task") == events.entity("task")
                && a.entity("run") == events.entity("run")
        })
        .or_else(|| existing.iter().filter(same_session).find(|a| a.kind == FUNC_BOLD));

    if let Some(bold) = bold {
        events.analysis.section_id = bold.analysis.section_id;
        events.series_idx = bold.series_idx;
        events.subject_idx = bold.subject_idx;
        events.session_idx = bold.session_idx;
        events.acquisition_date = bold.acquisition_date.clone();
        events.acquisition_time = bold.acquisition_time.clone();
    }
}

/// Union of headers over every events item, in first-seen order
pub fn collect_headers(acquisitions: &[Acquisition]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for events in acquisitions
        .iter()
        .flat_map(|a| &a.items)
        .filter_map(|item| item.events.as_ref())
    {
        for header in &events.headers {
            if !headers.contains(header) {
                headers.push(header.clone());
            }
        }
    }
    headers
}
