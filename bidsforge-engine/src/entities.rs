//! Entity schema: canonical ordering, filename short codes, label vocabularies

/// Entities in canonical filename order, with their filename short codes
pub const ENTITY_ORDER: &[(&str, &str)] = &[
    ("subject", "sub"),
    ("session", "ses"),
    ("sample", "sample"),
    ("task", "task"),
    ("tracksys", "tracksys"),
    ("acquisition", "acq"),
    ("nucleus", "nuc"),
    ("volume", "voi"),
    ("ceagent", "ce"),
    ("tracer", "trc"),
    ("stain", "stain"),
    ("reconstruction", "rec"),
    ("direction", "dir"),
    ("run", "run"),
    ("modality", "mod"),
    ("echo", "echo"),
    ("flip", "flip"),
    ("inversion", "inv"),
    ("mtransfer", "mt"),
    ("part", "part"),
    ("processing", "proc"),
    ("hemisphere", "hemi"),
    ("space", "space"),
    ("split", "split"),
    ("recording", "recording"),
    ("chunk", "chunk"),
    ("segmentation", "seg"),
    ("resolution", "res"),
    ("density", "den"),
    ("label", "label"),
    ("description", "desc"),
];

/// `part` labels treated as the primary image of a pair
pub const PRIMARY_PARTS: &[&str] = &["", "mag", "real"];

pub const PART_LABELS: &[&str] = &["mag", "phase", "real", "imag"];

/// Entities whose labels must be plain digits
pub const NUMERIC_ENTITIES: &[&str] = &["run", "echo", "flip", "inversion", "split", "chunk"];

pub fn short_code(key: &str) -> Option<&'static str> {
    ENTITY_ORDER
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, code)| *code)
}

pub fn is_primary_part(part: &str) -> bool {
    PRIMARY_PARTS.contains(&part)
}

/// Direction label implied by a phase-encoding direction
pub fn direction_for_ped(ped: &str) -> Option<&'static str> {
    match ped.trim() {
        "j-" => Some("AP"),
        "j" => Some("PA"),
        "i" => Some("LR"),
        "i-" => Some("RL"),
        "k" => Some("IS"),
        "k-" => Some("SI"),
        _ => None,
    }
}

/// Opposite direction label (`AP` <-> `PA`)
pub fn reverse_direction(label: &str) -> String {
    label.chars().rev().collect()
}
