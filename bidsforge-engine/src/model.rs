//! Dataset document model
//!
//! Mirrors the structured document exchanged with the upload/UI side: a flat
//! list of acquisitions ("objects"), the raw scanner series they derive from,
//! and dataset-level metadata. Unknown fields are carried in `extra` maps so a
//! document round-trips without losing anything the engine does not own.

use crate::entities::{self, is_primary_part};
use crate::events::{ColumnMapping, EventsTable, ParsedEvents};
use crate::organizer::SubjectGroup;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Entity label map; an empty string means "unset"
pub type Entities = BTreeMap<String, String>;

/// Sentinel acquisition type for scans the user dropped entirely
pub const EXCLUDE_TYPE: &str = "exclude";

pub const FUNC_BOLD: &str = "func/bold";
pub const FUNC_SBREF: &str = "func/sbref";
pub const FUNC_EVENTS: &str = "func/events";
pub const DWI_DWI: &str = "dwi/dwi";

/// The whole dataset description document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub subjects: Vec<Subject>,

    #[serde(default)]
    pub series: Vec<Series>,

    #[serde(default)]
    pub objects: Vec<Acquisition>,

    /// Subject -> session -> acquisition idx hierarchy, rebuilt on every pass
    #[serde(rename = "_organized", default, skip_deserializing)]
    pub organized: Vec<SubjectGroup>,

    /// Set once the rule engine has run over this document
    #[serde(rename = "_analyzed", default)]
    pub analyzed: bool,

    #[serde(rename = "datasetDescription", default)]
    pub dataset_description: Value,

    #[serde(default)]
    pub readme: String,

    /// Phenotype column name -> column description
    #[serde(rename = "participantsColumn", default)]
    pub participants_column: BTreeMap<String, Value>,

    /// Subject label -> phenotype column -> value
    #[serde(rename = "participantsInfo", default)]
    pub participants_info: BTreeMap<String, BTreeMap<String, Value>>,

    #[serde(rename = "eventsMapping", default, skip_serializing_if = "Option::is_none")]
    pub events_mapping: Option<ColumnMapping>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Subject table entry (label mapping from the upload side)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub sessions: Vec<SessionInfo>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub session: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One raw scanner series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub series_idx: usize,

    #[serde(rename = "SeriesDescription", default)]
    pub series_description: String,

    /// Type the converter guessed for the series
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Phase-encoding direction (`i`, `j-`, ...)
    #[serde(rename = "PED", default, skip_serializing_if = "Option::is_none")]
    pub ped: Option<String>,

    #[serde(rename = "ImageType", default)]
    pub image_type: Vec<String>,

    /// Series indices this (field map) series corrects
    #[serde(rename = "IntendedFor", default, skip_serializing_if = "Option::is_none")]
    pub intended_for: Option<Vec<usize>>,

    #[serde(rename = "B0FieldIdentifier", default)]
    pub b0_field_identifier: Vec<String>,

    #[serde(rename = "B0FieldSource", default)]
    pub b0_field_source: Vec<String>,

    #[serde(rename = "validationErrors", default)]
    pub validation_errors: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Series {
    pub fn is_localizer(&self) -> bool {
        self.series_description.to_lowercase().contains("localizer")
    }
}

/// Lookup from `series_idx` to series
pub fn series_lookup(series: &[Series]) -> HashMap<usize, &Series> {
    series.iter().map(|s| (s.series_idx, s)).collect()
}

/// Diagnostics attached by ingestion and by every analysis pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResults {
    #[serde(default)]
    pub errors: Vec<String>,

    #[serde(default)]
    pub warnings: Vec<String>,

    /// Warnings produced at conversion time; every pass starts from these
    #[serde(rename = "ingestWarnings", default, skip_serializing_if = "Vec::is_empty")]
    pub ingest_warnings: Vec<String>,

    #[serde(default = "first_section")]
    pub section_id: u32,

    #[serde(rename = "NumVolumes", default, skip_serializing_if = "Option::is_none")]
    pub num_volumes: Option<u32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn first_section() -> u32 {
    1
}

impl Default for AnalysisResults {
    fn default() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            ingest_warnings: Vec::new(),
            section_id: first_section(),
            num_volumes: None,
            extra: Map::new(),
        }
    }
}

/// One companion file of an acquisition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Companion kind: `json`, `nii.gz`, `bval`, `bvec`, `events`
    pub name: String,

    /// Source path relative to the session upload folder
    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<ParsedEvents>,

    #[serde(rename = "eventsBIDS", default, skip_serializing_if = "Option::is_none")]
    pub events_bids: Option<EventsTable>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn is_image(&self) -> bool {
        self.name.starts_with("nii")
    }
}

/// Adjacency computed by the organizer, keyed by stable id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Links {
    /// For a secondary-part (phase/imag) acquisition: its magnitude/real sibling
    pub primary_sibling: Option<Uuid>,
    /// For a func/sbref: the func/bold it references
    pub following_bold: Option<Uuid>,
}

/// One scan-derived unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    /// Stable identifier assigned at ingestion
    #[serde(default)]
    pub id: Uuid,

    /// Position in scan order; display-only, reassigned on every pass
    #[serde(default)]
    pub idx: usize,

    /// `modality/suffix` or [`EXCLUDE_TYPE`]
    #[serde(rename = "type")]
    pub kind: String,

    /// Last real type, kept when the user retypes to [`EXCLUDE_TYPE`]
    #[serde(rename = "_type", default, skip_serializing_if = "Option::is_none")]
    pub converted_kind: Option<String>,

    /// User overrides
    #[serde(default)]
    pub entities: Entities,

    /// System-computed defaults
    #[serde(rename = "_entities", default)]
    pub computed: Entities,

    #[serde(default)]
    pub items: Vec<Item>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_idx: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_idx: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_idx: Option<usize>,

    #[serde(rename = "AcquisitionDate", default)]
    pub acquisition_date: String,

    #[serde(rename = "AcquisitionTime", default)]
    pub acquisition_time: String,

    /// Exclusion requested (by the user, or forced by a rule)
    #[serde(default)]
    pub exclude: bool,

    /// Exclusion in effect after the last pass
    #[serde(rename = "_exclude", default)]
    pub exclude_in_effect: bool,

    /// `exclude` was set by linkage from an excluded primary, not by the user
    #[serde(rename = "_excludeInherited", default, skip_serializing_if = "std::ops::Not::not")]
    pub exclusion_inherited: bool,

    #[serde(rename = "analysisResults", default)]
    pub analysis: AnalysisResults,

    #[serde(rename = "validationErrors", default)]
    pub validation_errors: Vec<String>,

    #[serde(rename = "validationWarnings", default)]
    pub validation_warnings: Vec<String>,

    /// Acquisition idx values this field map applies to
    #[serde(rename = "IntendedFor", default, skip_serializing_if = "Option::is_none")]
    pub intended_for: Option<Vec<usize>>,

    #[serde(rename = "B0FieldIdentifier", default)]
    pub b0_field_identifier: Vec<String>,

    #[serde(rename = "B0FieldSource", default)]
    pub b0_field_source: Vec<String>,

    #[serde(skip)]
    pub links: Links,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Acquisition {
    /// Modality part of the type (`func` for `func/bold`)
    pub fn modality(&self) -> &str {
        self.kind.split_once('/').map(|(m, _)| m).unwrap_or("")
    }

    /// Suffix part of the type (`bold` for `func/bold`)
    pub fn suffix(&self) -> &str {
        self.kind.split_once('/').map(|(_, s)| s).unwrap_or(&self.kind)
    }

    /// Effective entity value: a non-empty user override wins over the default
    pub fn entity(&self, key: &str) -> &str {
        match self.entities.get(key) {
            Some(value) if !value.is_empty() => value,
            _ => self.computed.get(key).map(String::as_str).unwrap_or(""),
        }
    }

    /// All non-empty effective entities
    pub fn resolved_entities(&self) -> Entities {
        self.entities
            .keys()
            .chain(self.computed.keys())
            .filter_map(|key| {
                let value = self.entity(key);
                (!value.is_empty()).then(|| (key.clone(), value.to_string()))
            })
            .collect()
    }

    /// Set a system default unless the user has overridden the key
    pub fn set_default_entity(&mut self, key: &str, value: Option<&str>) {
        if self.entities.get(key).is_some_and(|v| !v.is_empty()) {
            return;
        }
        match value {
            Some(v) if !v.is_empty() => {
                self.computed.insert(key.to_string(), v.to_string());
            }
            _ => {
                self.computed.remove(key);
            }
        }
    }

    /// Type used for adjacency: the remembered type of an `exclude`-typed
    /// acquisition, else its own type
    pub fn link_kind(&self) -> &str {
        match (&self.converted_kind, self.kind.as_str()) {
            (Some(converted), EXCLUDE_TYPE) => converted.as_str(),
            (_, kind) => kind,
        }
    }

    /// Record the real type so retyping to `exclude` keeps it; a document
    /// that arrives already retyped falls back to the series type
    pub fn remember_kind(&mut self, series: Option<&Series>) {
        if self.kind != EXCLUDE_TYPE {
            self.converted_kind = Some(self.kind.clone());
        } else if self.converted_kind.is_none() {
            self.converted_kind = series
                .and_then(|s| s.kind.clone())
                .filter(|kind| kind != EXCLUDE_TYPE && !kind.is_empty());
        }
    }

    pub fn has_primary_part(&self) -> bool {
        is_primary_part(self.entity("part"))
    }

    /// Dropped from the dataset: requested and in effect, or typed `exclude`
    pub fn is_excluded(&self) -> bool {
        (self.exclude && self.exclude_in_effect) || self.kind == EXCLUDE_TYPE
    }

    /// Eligible for rule matching
    pub fn is_candidate(&self) -> bool {
        !self.is_excluded() && self.kind != EXCLUDE_TYPE
    }

    /// 1-based index as shown to users
    pub fn display_index(&self) -> usize {
        self.idx + 1
    }

    /// Force exclusion, explaining why
    pub fn force_exclude(&mut self, message: String) {
        self.exclude = true;
        self.exclude_in_effect = true;
        if !self.analysis.warnings.contains(&message) {
            self.analysis.warnings.push(message);
        }
    }

    /// (subject, session) grouping key
    pub fn session_key(&self) -> (String, String) {
        (
            self.entity("subject").to_string(),
            self.entity("session").to_string(),
        )
    }

    /// (subject, session, section) grouping key
    pub fn section_key(&self) -> (String, String, u32) {
        let (subject, session) = self.session_key();
        (subject, session, self.analysis.section_id)
    }

    /// Sidecar of the JSON companion, if any
    pub fn sidecar(&self) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item.name == "json")
            .and_then(|item| item.sidecar.as_ref())
    }

    pub fn repetition_time(&self) -> Option<f64> {
        self.sidecar()?.get("RepetitionTime")?.as_f64()
    }

    /// Phase-encoding direction: series value, else sidecar
    pub fn ped(&self, series: Option<&Series>) -> Option<String> {
        series
            .and_then(|s| s.ped.clone())
            .or_else(|| {
                self.sidecar()?
                    .get("PhaseEncodingDirection")?
                    .as_str()
                    .map(str::to_string)
            })
            .filter(|p| !p.is_empty())
    }

    /// Direction label (`AP`, `PA`, ...) derived from the PED, else the entity
    pub fn direction_label(&self, series: Option<&Series>) -> String {
        self.ped(series)
            .and_then(|ped| entities::direction_for_ped(&ped))
            .map(str::to_string)
            .unwrap_or_else(|| self.entity("direction").to_string())
    }

    /// Upper-cased image type tags: series value, else sidecar
    pub fn image_type(&self, series: Option<&Series>) -> Vec<String> {
        let tags: Vec<String> = match series {
            Some(s) if !s.image_type.is_empty() => s.image_type.clone(),
            _ => self
                .sidecar()
                .and_then(|sc| sc.get("ImageType"))
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
        tags.into_iter().map(|t| t.to_uppercase()).collect()
    }
}

/// Position of each acquisition in the list, by stable id
pub fn positions_by_id(acquisitions: &[Acquisition]) -> HashMap<Uuid, usize> {
    acquisitions
        .iter()
        .enumerate()
        .map(|(pos, acq)| (acq.id, pos))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::acq;
    use super::*;

    #[test]
    fn test_user_override_wins_over_default() {
        let mut a = acq("func/bold", &[("task", "rest")]);
        assert_eq!(a.entity("task"), "rest");

        a.entities.insert("task".to_string(), "nback".to_string());
        assert_eq!(a.entity("task"), "nback");

        a.entities.insert("task".to_string(), String::new());
        assert_eq!(a.entity("task"), "rest");
    }

    #[test]
    fn test_set_default_entity_respects_override() {
        let mut a = acq("func/bold", &[]);
        a.entities.insert("run".to_string(), "7".to_string());
        a.set_default_entity("run", Some("1"));
        assert!(!a.computed.contains_key("run"));

        a.entities.clear();
        a.set_default_entity("run", Some("1"));
        assert_eq!(a.entity("run"), "1");
        a.set_default_entity("run", None);
        assert_eq!(a.entity("run"), "");
    }

    #[test]
    fn test_exclusion_requires_both_flags() {
        let mut a = acq("anat/T1w", &[]);
        a.exclude = true;
        assert!(!a.is_excluded());
        a.exclude_in_effect = true;
        assert!(a.is_excluded());

        let b = acq(EXCLUDE_TYPE, &[]);
        assert!(b.is_excluded());
        assert!(!b.is_candidate());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let text = r#"{"type":"anat/T1w","entities":{},"_entities":{"subject":"01"},
            "items":[{"name":"json","path":"a.json","sidecar":{"EchoTime":0.003},"pngPath":"a.png"}],
            "message":"ui note"}"#;
        let a: Acquisition = serde_json::from_str(text).unwrap();
        assert_eq!(a.extra.get("message").unwrap(), "ui note");
        assert_eq!(a.items[0].extra.get("pngPath").unwrap(), "a.png");
        assert_eq!(a.analysis.section_id, 1);

        let back = serde_json::to_value(&a).unwrap();
        assert_eq!(back["message"], "ui note");
        assert_eq!(back["items"][0]["pngPath"], "a.png");
    }
}
