//! Layout Emitter
//!
//! Maps the resolved document onto a BIDS directory tree. Planning is pure:
//! [`plan`] computes every target path and its content, [`emit`] writes the
//! plan to disk. Non-JSON companions are hard-linked from the upload folder,
//! never copied or symlinked.
//!
//! # Layout
//! - `[derivatives/<Manufacturer>/]sub-<id>/[ses-<id>/]<modality>/<entities>_<suffix>.<ext>`
//! - excluded acquisitions under `excluded/acq-<token>/`
//! - dataset files: `dataset_description.json`, `README`, `participants.tsv`,
//!   `participants.json`, `.bidsignore`

use crate::entities::ENTITY_ORDER;
use crate::error::{EngineError, EngineResult};
use crate::model::{series_lookup, Acquisition, Document, Item, Series, DWI_DWI};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const EXCLUDED_DIR: &str = "excluded";
pub const DERIVATIVES_DIR: &str = "derivatives";
pub const BIDS_VERSION: &str = "1.8.0";

/// Largest volume count zero gradient tables are written for
pub const MAX_SYNTHESIZED_VOLUMES: u32 = 10_000;

/// Scanner-computed maps that belong under derivatives
const DERIVED_IMAGE_TYPES: &[&str] = &["ADC", "FA", "TRACEW", "COLFA"];

/// What a planned file holds
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Json(Value),
    Text(String),
    /// Hard link to this source file
    HardLink(PathBuf),
}

/// One file of the output tree, relative to the dataset root
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFile {
    pub target: PathBuf,
    pub content: FileContent,
}

/// Counts from one emission
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitSummary {
    pub written: usize,
    pub linked: usize,
}

/// Refuse emission while an included acquisition carries errors
pub fn check_emittable(document: &Document) -> EngineResult<()> {
    let blocked: Vec<String> = document
        .objects
        .iter()
        .filter(|a| !a.is_excluded())
        .filter(|a| !a.validation_errors.is_empty() || !a.analysis.errors.is_empty())
        .map(|a| format!("#{}", a.display_index()))
        .collect();

    if blocked.is_empty() {
        Ok(())
    } else {
        Err(EngineError::EmissionBlocked(format!(
            "acquisitions {} have unresolved errors",
            blocked.join(", ")
        )))
    }
}

/// Compute the full output tree without touching the filesystem
///
/// `source_root` is the upload folder item paths are relative to.
pub fn plan(document: &Document, source_root: &Path) -> EngineResult<Vec<PlannedFile>> {
    check_emittable(document)?;

    let lookup = series_lookup(&document.series);
    let by_idx: HashMap<usize, &Acquisition> = document.objects.iter().map(|a| (a.idx, a)).collect();
    let mut files = Vec::new();

    for acq in &document.objects {
        let series = acq.series_idx.and_then(|s| lookup.get(&s).copied());
        if acq.is_excluded() {
            files.extend(plan_excluded(acq, source_root));
        } else {
            files.extend(plan_included(acq, series, &by_idx, &lookup, source_root)?);
        }
    }

    files.extend(plan_dataset_files(document));
    debug!(files = files.len(), "Emission planned");
    Ok(files)
}

/// Write a plan under `dataset_root`
pub fn emit(document: &Document, source_root: &Path, dataset_root: &Path) -> EngineResult<EmitSummary> {
    let files = plan(document, source_root)?;
    let mut summary = EmitSummary::default();

    for file in files {
        let target = dataset_root.join(&file.target);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match file.content {
            FileContent::Json(value) => {
                fs::write(&target, serde_json::to_string_pretty(&value)?)?;
                summary.written += 1;
            }
            FileContent::Text(text) => {
                fs::write(&target, text)?;
                summary.written += 1;
            }
            FileContent::HardLink(source) => {
                if target.exists() {
                    fs::remove_file(&target)?;
                }
                fs::hard_link(&source, &target)?;
                summary.linked += 1;
            }
        }
    }

    info!(
        dataset = %dataset_root.display(),
        written = summary.written,
        linked = summary.linked,
        "Dataset emitted"
    );
    Ok(summary)
}

/// Directory of an acquisition relative to its subject directory, and its
/// file stem (`sub-01_ses-1_task-rest_run-1_bold`)
fn relative_location(acq: &Acquisition) -> (PathBuf, String) {
    let entities = acq.resolved_entities();
    let mut tokens: Vec<String> = ENTITY_ORDER
        .iter()
        .filter_map(|(key, code)| {
            entities
                .get(*key)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{code}-{v}"))
        })
        .collect();
    tokens.push(acq.suffix().to_string());

    let mut dir = PathBuf::new();
    let session = acq.entity("session");
    if !session.is_empty() {
        dir.push(format!("ses-{session}"));
    }
    dir.push(acq.modality());

    (dir, tokens.join("_"))
}

/// Full stem relative to the dataset root, routed to derivatives when needed
fn dataset_location(acq: &Acquisition, series: Option<&Series>) -> (PathBuf, String) {
    let (relative, stem) = relative_location(acq);
    let mut dir = PathBuf::new();

    let image_type = acq.image_type(series);
    if image_type.iter().any(|t| DERIVED_IMAGE_TYPES.contains(&t.as_str())) {
        let manufacturer = acq
            .sidecar()
            .and_then(|s| s.get("Manufacturer"))
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("unknown");
        dir.push(DERIVATIVES_DIR);
        dir.push(manufacturer);
    }

    dir.push(format!("sub-{}", acq.entity("subject")));
    dir.push(relative);
    (dir, stem)
}

fn plan_included(
    acq: &Acquisition,
    series: Option<&Series>,
    by_idx: &HashMap<usize, &Acquisition>,
    lookup: &HashMap<usize, &Series>,
    source_root: &Path,
) -> EngineResult<Vec<PlannedFile>> {
    let (dir, stem) = dataset_location(acq, series);
    let target = |ext: &str| dir.join(format!("{stem}.{ext}"));
    let synthesize_gradients = acq.kind == DWI_DWI && !acq.items.iter().any(|i| i.name == "bvec");
    let mut files = Vec::new();

    for item in &acq.items {
        match item.name.as_str() {
            "json" => {
                let sidecar = compose_sidecar(acq, item, by_idx, lookup);
                files.push(PlannedFile {
                    target: target("json"),
                    content: FileContent::Json(sidecar),
                });
            }
            "events" => match &item.events_bids {
                Some(table) => files.push(PlannedFile {
                    target: target("tsv"),
                    content: FileContent::Text(table.to_tsv()),
                }),
                None => warn!(idx = acq.idx, path = %item.path, "Events item has no converted table, skipping"),
            },
            "bval" if synthesize_gradients => {}
            ext if !item.path.is_empty() => files.push(PlannedFile {
                target: target(ext),
                content: FileContent::HardLink(source_root.join(&item.path)),
            }),
            _ => {}
        }
    }

    if synthesize_gradients {
        let volumes = acq.analysis.num_volumes.unwrap_or_else(|| {
            warn!(idx = acq.idx, "DWI volume count unknown, synthesizing a single b0 volume");
            1
        });
        if volumes > MAX_SYNTHESIZED_VOLUMES {
            return Err(EngineError::MalformedDocument(format!(
                "acquisition #{} claims {volumes} DWI volumes (at most {MAX_SYNTHESIZED_VOLUMES})",
                acq.display_index()
            )));
        }
        let zeros = vec!["0"; volumes as usize].join(" ");
        files.push(PlannedFile {
            target: target("bvec"),
            content: FileContent::Text(format!("{zeros}\n{zeros}\n{zeros}\n")),
        });
        files.push(PlannedFile {
            target: target("bval"),
            content: FileContent::Text(format!("{zeros}\n")),
        });
    }

    Ok(files)
}

/// Per-item sidecar plus the fields the engine owns
fn compose_sidecar(
    acq: &Acquisition,
    item: &Item,
    by_idx: &HashMap<usize, &Acquisition>,
    lookup: &HashMap<usize, &Series>,
) -> Value {
    let mut sidecar = match &item.sidecar {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    if acq.modality() == "func" {
        let task = acq.entity("task");
        if !task.is_empty() {
            sidecar.insert("TaskName".to_string(), json!(task));
        }
    }

    if acq.modality() == "fmap" {
        if let Some(targets) = &acq.intended_for {
            let paths: Vec<Value> = targets
                .iter()
                .filter_map(|idx| intended_for_path(*idx, by_idx, lookup))
                .map(Value::String)
                .collect();
            sidecar.insert("IntendedFor".to_string(), Value::Array(paths));
        }
    }

    for (field, labels) in [
        ("B0FieldIdentifier", &acq.b0_field_identifier),
        ("B0FieldSource", &acq.b0_field_source),
    ] {
        match labels.as_slice() {
            [] => {}
            [single] => {
                sidecar.insert(field.to_string(), json!(single));
            }
            many => {
                sidecar.insert(field.to_string(), json!(many));
            }
        }
    }

    Value::Object(sidecar)
}

/// Image path of a field-map target, relative to its subject directory
fn intended_for_path(
    idx: usize,
    by_idx: &HashMap<usize, &Acquisition>,
    lookup: &HashMap<usize, &Series>,
) -> Option<String> {
    let Some(target) = by_idx.get(&idx) else {
        warn!(idx, "IntendedFor target no longer exists, skipping");
        return None;
    };
    if target.is_excluded() {
        warn!(idx, "IntendedFor target is excluded, skipping");
        return None;
    }

    let series = target.series_idx.and_then(|s| lookup.get(&s).copied());
    if target.image_type(series).iter().any(|t| DERIVED_IMAGE_TYPES.contains(&t.as_str())) {
        return None;
    }

    let ext = target
        .items
        .iter()
        .find(|i| i.is_image())
        .map(|i| i.name.as_str())
        .unwrap_or("nii.gz");
    let (dir, stem) = relative_location(target);
    Some(format!("{}/{stem}.{ext}", dir.to_string_lossy().replace('\\', "/")))
}

/// Excluded acquisitions keep their source file names under a per-acquisition
/// token directory
fn plan_excluded(acq: &Acquisition, source_root: &Path) -> Vec<PlannedFile> {
    let token = excluded_token(acq);
    acq.items
        .iter()
        .filter(|item| !item.path.is_empty())
        .map(|item| {
            let name = Path::new(&item.path)
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&item.name));
            let target = Path::new(EXCLUDED_DIR).join(&token).join(name);
            let content = match &item.sidecar {
                Some(sidecar) if item.name == "json" => FileContent::Json(sidecar.clone()),
                _ => FileContent::HardLink(source_root.join(&item.path)),
            };
            PlannedFile { target, content }
        })
        .collect()
}

pub fn excluded_token(acq: &Acquisition) -> String {
    let id = acq.id.simple().to_string();
    format!("acq-{}", &id[..8])
}

fn plan_dataset_files(document: &Document) -> Vec<PlannedFile> {
    let mut description = match &document.dataset_description {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    description
        .entry("Name")
        .or_insert_with(|| json!("Untitled"));
    description
        .entry("BIDSVersion")
        .or_insert_with(|| json!(BIDS_VERSION));

    vec![
        PlannedFile {
            target: PathBuf::from("dataset_description.json"),
            content: FileContent::Json(Value::Object(description)),
        },
        PlannedFile {
            target: PathBuf::from("README"),
            content: FileContent::Text(document.readme.clone()),
        },
        PlannedFile {
            target: PathBuf::from("participants.tsv"),
            content: FileContent::Text(participants_tsv(document)),
        },
        PlannedFile {
            target: PathBuf::from("participants.json"),
            content: FileContent::Json(json!(document.participants_column)),
        },
        PlannedFile {
            target: PathBuf::from(".bidsignore"),
            content: FileContent::Text(format!("{EXCLUDED_DIR}/\n")),
        },
    ]
}

/// `participant_id` plus every configured phenotype column, one row per
/// included subject
pub fn participants_tsv(document: &Document) -> String {
    let columns: Vec<&String> = document.participants_column.keys().collect();
    let subjects: BTreeSet<&str> = document
        .objects
        .iter()
        .filter(|a| !a.is_excluded())
        .map(|a| a.entity("subject"))
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = std::iter::once("participant_id")
        .chain(columns.iter().map(|c| c.as_str()))
        .collect::<Vec<_>>()
        .join("\t");
    out.push('\n');

    for subject in subjects {
        let info = document.participants_info.get(subject);
        let mut row = vec![format!("sub-{subject}")];
        for column in &columns {
            let value = info.and_then(|i| i.get(*column));
            row.push(match value {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Null) | None => "n/a".to_string(),
                Some(Value::String(_)) => "n/a".to_string(),
                Some(other) => other.to_string(),
            });
        }
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}
