//! Filler space: acquiring idle files from attestation workers and the
//! admission check they must pass.

pub mod acquisition;
pub mod verifier;

pub use acquisition::{AcquiredFile, AcquisitionSettings, IdleAcquisition};
pub use verifier::verify_tag_file;
