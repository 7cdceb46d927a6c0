//! Column mapping from decoded timing tables to BIDS events columns

use super::{EventsTable, ParsedEvents};
use crate::model::{Acquisition, FUNC_EVENTS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Written for any value that cannot be computed
pub const NOT_AVAILABLE: &str = "n/a";

/// How two source columns combine into one value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    Eq,
    Add,
    Subtract,
}

/// Unit of the source column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    Sec,
    Ms,
    Us,
    Samples,
}

impl Unit {
    /// Convert a raw value to seconds (samples pass through)
    pub fn to_seconds(self, value: f64) -> f64 {
        match self {
            Unit::Ms => value / 1_000.0,
            Unit::Us => value / 1_000_000.0,
            Unit::Sec | Unit::Samples => value,
        }
    }
}

/// A numeric BIDS column computed from one or two source columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericColumn {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub column2: Option<String>,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub unit: Unit,
}

impl NumericColumn {
    fn with_unit(unit: Unit) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.column.is_some()
    }

    /// Value for one row, if every referenced cell is numeric
    pub fn compute(&self, row: &BTreeMap<String, String>) -> Option<f64> {
        let cell = |name: &Option<String>| -> Option<f64> {
            row.get(name.as_ref()?)?.trim().parse::<f64>().ok()
        };

        let first = cell(&self.column)?;
        let value = match (self.logic, &self.column2) {
            (Logic::Add, Some(_)) => first + cell(&self.column2)?,
            (Logic::Subtract, Some(_)) => first - cell(&self.column2)?,
            _ => first,
        };
        Some(round_micro(self.unit.to_seconds(value)))
    }
}

/// Mapping from source headers to BIDS events columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    #[serde(default)]
    pub onset: NumericColumn,
    #[serde(default)]
    pub duration: NumericColumn,
    #[serde(default = "samples_column")]
    pub sample: NumericColumn,
    #[serde(default)]
    pub response_time: NumericColumn,
    #[serde(default)]
    pub trial_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "HED", default)]
    pub hed: Option<String>,
    #[serde(default)]
    pub stim_file: Option<String>,
}

fn samples_column() -> NumericColumn {
    NumericColumn::with_unit(Unit::Samples)
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            onset: NumericColumn::default(),
            duration: NumericColumn::default(),
            sample: samples_column(),
            response_time: NumericColumn::default(),
            trial_type: None,
            value: None,
            hed: None,
            stim_file: None,
        }
    }
}

/// Validate a prior mapping against the current headers, or start fresh
///
/// Mapped columns that no longer exist among `headers` are reset to `None`;
/// units and logic are kept.
pub fn map_event_columns(prior: Option<&ColumnMapping>, headers: &[String]) -> ColumnMapping {
    let Some(prior) = prior else {
        return ColumnMapping::default();
    };

    let mut mapping = prior.clone();
    let mut dropped = 0;
    let mut keep = |column: &mut Option<String>| {
        if column.as_ref().is_some_and(|name| !headers.contains(name)) {
            *column = None;
            dropped += 1;
        }
    };

    for numeric in [
        &mut mapping.onset,
        &mut mapping.duration,
        &mut mapping.sample,
        &mut mapping.response_time,
    ] {
        keep(&mut numeric.column);
        keep(&mut numeric.column2);
    }
    keep(&mut mapping.trial_type);
    keep(&mut mapping.value);
    keep(&mut mapping.hed);
    keep(&mut mapping.stim_file);

    if dropped > 0 {
        warn!(dropped, "Dropped event column mappings missing from current files");
    }
    mapping
}

/// Build the BIDS events table of every events item
pub fn create_events_tsv(mut acquisitions: Vec<Acquisition>, mapping: &ColumnMapping) -> Vec<Acquisition> {
    let mut converted = 0;
    for item in acquisitions
        .iter_mut()
        .filter(|a| a.kind == FUNC_EVENTS)
        .flat_map(|a| a.items.iter_mut())
    {
        if let Some(events) = &item.events {
            item.events_bids = Some(build_table(events, mapping));
            converted += 1;
        }
    }
    debug!(converted, "Events tables created");
    acquisitions
}

fn build_table(events: &ParsedEvents, mapping: &ColumnMapping) -> EventsTable {
    enum Source<'a> {
        Numeric(&'a NumericColumn),
        Text(&'a str),
    }

    let mut columns: Vec<(&str, Source)> = vec![
        ("onset", Source::Numeric(&mapping.onset)),
        ("duration", Source::Numeric(&mapping.duration)),
    ];
    if mapping.sample.is_mapped() {
        columns.push(("sample", Source::Numeric(&mapping.sample)));
    }
    if let Some(name) = &mapping.trial_type {
        columns.push(("trial_type", Source::Text(name)));
    }
    if mapping.response_time.is_mapped() {
        columns.push(("response_time", Source::Numeric(&mapping.response_time)));
    }
    for (label, configured) in [
        ("value", &mapping.value),
        ("HED", &mapping.hed),
        ("stim_file", &mapping.stim_file),
    ] {
        if let Some(name) = configured {
            columns.push((label, Source::Text(name)));
        }
    }

    let rows = events
        .rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|(_, source)| match source {
                    Source::Numeric(numeric) => numeric
                        .compute(row)
                        .map(format_number)
                        .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                    Source::Text(name) => row
                        .get(*name)
                        .map(|v| v.trim())
                        .filter(|v| !v.is_empty())
                        .unwrap_or(NOT_AVAILABLE)
                        .to_string(),
                })
                .collect()
        })
        .collect();

    EventsTable {
        columns: columns.iter().map(|(label, _)| label.to_string()).collect(),
        rows,
    }
}

fn round_micro(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn format_number(value: f64) -> String {
    format!("{value}")
}
