//! Document ingestion and persistence
//!
//! Parsing validates the references the rules rely on, assigns each
//! acquisition its stable id and fills subject/session labels from the
//! document's subject table.

use crate::error::{EngineError, EngineResult};
use crate::model::{series_lookup, Acquisition, Document, Subject};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parse and prepare a document from JSON text
pub fn parse_document(text: &str) -> EngineResult<Document> {
    let mut document: Document =
        serde_json::from_str(text).map_err(|e| EngineError::MalformedDocument(e.to_string()))?;
    prepare(&mut document)?;
    Ok(document)
}

/// Load and prepare a document from a file
pub fn load_document(path: &Path) -> EngineResult<Document> {
    debug!(path = %path.display(), "Loading document");
    let text = fs::read_to_string(path)?;
    let document = parse_document(&text)?;
    info!(
        path = %path.display(),
        acquisitions = document.objects.len(),
        series = document.series.len(),
        "Document loaded"
    );
    Ok(document)
}

/// Write a document, replacing the target only once fully written
pub fn save_document(document: &Document, path: &Path) -> EngineResult<()> {
    let text = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "Document saved");
    Ok(())
}

fn prepare(document: &mut Document) -> EngineResult<()> {
    // Rebuilt on every pass; a stale copy must not survive via `extra`
    document.extra.remove("_organized");

    let lookup = series_lookup(&document.series);
    let mut seen_ids = HashSet::new();

    for (position, acq) in document.objects.iter_mut().enumerate() {
        if let Some(series_idx) = acq.series_idx {
            if !lookup.contains_key(&series_idx) {
                return Err(EngineError::MalformedDocument(format!(
                    "acquisition {position} references unknown series {series_idx}"
                )));
            }
        }

        if acq.id.is_nil() || !seen_ids.insert(acq.id) {
            if !acq.id.is_nil() {
                warn!(id = %acq.id, position, "Duplicate acquisition id, assigning a new one");
            }
            acq.id = Uuid::new_v4();
            seen_ids.insert(acq.id);
        }

        fill_identity(acq, &document.subjects, position)?;
        acq.remember_kind(acq.series_idx.and_then(|s| lookup.get(&s).copied()));

        if !document.analyzed && acq.analysis.ingest_warnings.is_empty() {
            acq.analysis.ingest_warnings = acq.analysis.warnings.clone();
        }
    }

    Ok(())
}

fn fill_identity(acq: &mut Acquisition, subjects: &[Subject], position: usize) -> EngineResult<()> {
    let Some(subject_idx) = acq.subject_idx else {
        return Ok(());
    };
    let subject = subjects.get(subject_idx).ok_or_else(|| {
        EngineError::MalformedDocument(format!(
            "acquisition {position} references unknown subject {subject_idx}"
        ))
    })?;

    if acq.computed.get("subject").map_or(true, String::is_empty) && !subject.subject.is_empty() {
        acq.computed.insert("subject".to_string(), subject.subject.clone());
    }

    if let Some(session_idx) = acq.session_idx {
        let session = subject.sessions.get(session_idx).ok_or_else(|| {
            EngineError::MalformedDocument(format!(
                "acquisition {position} references unknown session {session_idx} of subject {}",
                subject.subject
            ))
        })?;
        if acq.computed.get("session").map_or(true, String::is_empty) && !session.session.is_empty() {
            acq.computed.insert("session".to_string(), session.session.clone());
        }
    }
    Ok(())
}
