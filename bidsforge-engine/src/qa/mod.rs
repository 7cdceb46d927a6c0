//! QA / validation rules
//!
//! Every rule is scoped to a section (or a session where stated) and only
//! considers candidate acquisitions: not excluded, not typed `exclude`.
//! Warnings produced here are advisory; the only rule that changes the
//! dataset is the functional volume threshold, which forces an exclusion.

pub mod dwi;
pub mod fmap;
pub mod func;
pub mod intended_for;

pub use dwi::dwi_qa;
pub use fmap::fmap_qa;
pub use func::{func_sbref_ped, func_volume_threshold};
pub use intended_for::set_intended_for;

use crate::model::Acquisition;

/// Attach a warning once
pub(crate) fn warn(acq: &mut Acquisition, message: String) {
    if !acq.analysis.warnings.contains(&message) {
        acq.analysis.warnings.push(message);
    }
}
