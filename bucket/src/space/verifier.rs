//! Admission check for freshly received filler files.

use crate::error::VerifyError;
use common::{TAG_EXTENSION, Tag, file_basename};
use std::path::Path;

/// Check that a tag file describes the data file next to it.
///
/// Passes when the tag's basename (without `.tag`), the tag's declared name
/// and the data file's basename are all the same content hash. Reads the tag
/// file and nothing else; calling it twice on unchanged files gives the same
/// answer.
pub fn verify_tag_file(tag_path: &Path, data_path: &Path) -> Result<(), VerifyError> {
    let tag_base = file_basename(tag_path)
        .ok_or_else(|| VerifyError::Malformed(format!("bad tag path {}", tag_path.display())))?;
    let data_base = file_basename(data_path)
        .ok_or_else(|| VerifyError::Malformed(format!("bad data path {}", data_path.display())))?;

    let tag_stem = tag_base
        .strip_suffix(TAG_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(tag_base);

    let bytes = std::fs::read(tag_path)?;
    let tag = Tag::from_json(&bytes).map_err(|e| VerifyError::Malformed(e.to_string()))?;

    if tag.name != tag_stem {
        return Err(VerifyError::TagMismatch(format!(
            "tag declares {} but is stored as {}",
            tag.name, tag_base
        )));
    }
    if tag_stem != data_base {
        return Err(VerifyError::TagMismatch(format!(
            "tag {} does not belong to data file {}",
            tag_base, data_base
        )));
    }
    Ok(())
}
