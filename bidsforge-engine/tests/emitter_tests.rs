//! Emission of an analysed document to a real directory tree

use bidsforge_common::config::EngineSettings;
use bidsforge_engine::emitter::{emit, EXCLUDED_DIR};
use bidsforge_engine::ingest::parse_document;
use bidsforge_engine::{analyze, Document, EngineError};
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn document(t1_entities: Value) -> Document {
    let text = json!({
        "subjects": [{"subject": "01", "sessions": []}],
        "series": [
            {"series_idx": 0, "SeriesDescription": "localizer"},
            {"series_idx": 1, "SeriesDescription": "T1 MPRAGE"}
        ],
        "objects": [
            {
                "type": "exclude",
                "series_idx": 0,
                "subject_idx": 0,
                "AcquisitionTime": "08:00:00",
                "items": [
                    {"name": "json", "path": "raw/loc.json", "sidecar": {"SeriesNumber": 1}},
                    {"name": "nii.gz", "path": "raw/loc.nii.gz"}
                ]
            },
            {
                "type": "anat/T1w",
                "entities": t1_entities,
                "series_idx": 1,
                "subject_idx": 0,
                "AcquisitionTime": "08:05:00",
                "items": [
                    {"name": "json", "path": "raw/t1.json", "sidecar": {"SeriesNumber": 2}},
                    {"name": "nii.gz", "path": "raw/t1.nii.gz"}
                ]
            }
        ],
        "datasetDescription": {"Name": "demo"},
        "participantsColumn": {"age": {"Description": "age in years"}},
        "participantsInfo": {"01": {"age": 34}}
    })
    .to_string();
    analyze(parse_document(&text).unwrap(), &EngineSettings::default())
}

fn upload_folder() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("raw")).unwrap();
    fs::write(dir.path().join("raw/t1.nii.gz"), b"t1 image").unwrap();
    fs::write(dir.path().join("raw/loc.nii.gz"), b"localizer image").unwrap();
    dir
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn test_emit_writes_bids_tree() {
    let source = upload_folder();
    let dataset = TempDir::new().unwrap();
    let root = dataset.path();

    let summary = emit(&document(json!({})), source.path(), root).unwrap();
    assert_eq!(summary.linked, 2);

    let sidecar: Value = serde_json::from_str(&read(&root.join("sub-01/anat/sub-01_T1w.json"))).unwrap();
    assert_eq!(sidecar["SeriesNumber"], 2);
    assert_eq!(read(&root.join("sub-01/anat/sub-01_T1w.nii.gz")), "t1 image");

    let description: Value = serde_json::from_str(&read(&root.join("dataset_description.json"))).unwrap();
    assert_eq!(description["Name"], "demo");
    assert!(description["BIDSVersion"].is_string());

    assert_eq!(read(&root.join("participants.tsv")), "participant_id\tage\nsub-01\t34\n");
    assert_eq!(read(&root.join(".bidsignore")), "excluded/\n");

    // The localizer keeps its source names under a token directory
    let excluded: Vec<_> = fs::read_dir(root.join(EXCLUDED_DIR)).unwrap().collect();
    assert_eq!(excluded.len(), 1);
    let token_dir = excluded[0].as_ref().unwrap().path();
    assert_eq!(read(&token_dir.join("loc.nii.gz")), "localizer image");
    assert!(token_dir.join("loc.json").exists());
}

#[cfg(unix)]
#[test]
fn test_images_are_hard_linked() {
    use std::os::unix::fs::MetadataExt;

    let source = upload_folder();
    let dataset = TempDir::new().unwrap();
    emit(&document(json!({})), source.path(), dataset.path()).unwrap();

    let original = fs::metadata(source.path().join("raw/t1.nii.gz")).unwrap();
    let linked = fs::metadata(dataset.path().join("sub-01/anat/sub-01_T1w.nii.gz")).unwrap();
    assert_eq!(original.ino(), linked.ino());
    assert_eq!(original.nlink(), 2);
}

#[test]
fn test_emit_twice_replaces_links() {
    let source = upload_folder();
    let dataset = TempDir::new().unwrap();
    let doc = document(json!({}));

    emit(&doc, source.path(), dataset.path()).unwrap();
    let summary = emit(&doc, source.path(), dataset.path()).unwrap();
    assert_eq!(summary.linked, 2);
}

#[test]
fn test_validation_errors_block_emission() {
    let source = upload_folder();
    let dataset = TempDir::new().unwrap();
    let doc = document(json!({"acquisition": "mp-rage"}));

    let result = emit(&doc, source.path(), dataset.path());
    assert!(matches!(result, Err(EngineError::EmissionBlocked(_))));
    assert!(!dataset.path().join("dataset_description.json").exists());
}
