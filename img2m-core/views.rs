use crate::error::{CoreError, CoreResult};
use log::error;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// Input image entry as handed over by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageRecord {
    pub path: PathBuf,
    pub valid: bool,
}

impl ImageRecord {
    pub fn new(path: impl Into<PathBuf>, valid: bool) -> Self {
        Self { path: path.into(), valid }
    }
}

/// Image with its assigned dense view id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub view_id: u32,
    pub path: PathBuf,
}

/// Leading decimal integer of the file stem, e.g. `0012_left.jpg` -> 12
pub fn leading_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Assign dense view ids to valid images, ordered by their stem number.
///
/// Images whose stem does not start with a number are skipped.
pub fn assign_view_ids(records: &[ImageRecord]) -> Vec<ViewEntry> {
    let mut keyed: Vec<(String, &Path)> = records
        .iter()
        .filter(|r| r.valid)
        .filter_map(|r| match leading_number(&r.path) {
            Some(n) => Some((format!("{:08}", n), r.path.as_path())),
            None => {
                error!("Cannot extract a view number from image name: {}", r.path.display());
                None
            }
        })
        .collect();

    keyed.sort();

    keyed
        .into_iter()
        .enumerate()
        .map(|(view_id, (_, path))| ViewEntry {
            view_id: view_id as u32,
            path: path.to_path_buf(),
        })
        .collect()
}

/// List the image files of a directory as valid records
pub fn collect_image_records<P: AsRef<Path>>(dir: P) -> CoreResult<Vec<ImageRecord>> {
    let dir = dir.as_ref();
    let to_error = |e: std::io::Error| CoreError::ImageDirectory {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };

    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(to_error)? {
        let path = entry.map_err(to_error)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if is_image {
            let valid = path.is_file();
            records.push(ImageRecord::new(path, valid));
        }
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number(Path::new("/data/0012_left.jpg")), Some(12));
        assert_eq!(leading_number(Path::new("7.png")), Some(7));
        assert_eq!(leading_number(Path::new("img_3.png")), None);
        assert_eq!(leading_number(Path::new("")), None);
    }

    #[test]
    fn test_view_ids_follow_numeric_order() {
        let records = vec![
            ImageRecord::new("set/10.jpg", true),
            ImageRecord::new("set/2.jpg", true),
            ImageRecord::new("set/1.jpg", true),
        ];
        let views = assign_view_ids(&records);
        let order: Vec<(u32, &str)> = views
            .iter()
            .map(|v| (v.view_id, v.path.to_str().unwrap()))
            .collect();
        assert_eq!(order, vec![(0, "set/1.jpg"), (1, "set/2.jpg"), (2, "set/10.jpg")]);
    }

    #[test]
    fn test_invalid_and_unnumbered_entries_are_skipped() {
        let records = vec![
            ImageRecord::new("b/3.jpg", true),
            ImageRecord::new("b/1.jpg", false),
            ImageRecord::new("b/cover.jpg", true),
            ImageRecord::new("b/2.jpg", true),
        ];
        let views = assign_view_ids(&records);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].path, PathBuf::from("b/2.jpg"));
        assert_eq!(views[1].view_id, 1);
    }

    #[test]
    fn test_assignment_is_independent_of_input_order() {
        let forward = vec![ImageRecord::new("4.jpg", true), ImageRecord::new("9.jpg", true)];
        let backward: Vec<ImageRecord> = forward.iter().rev().cloned().collect();
        assert_eq!(assign_view_ids(&forward), assign_view_ids(&backward));
    }
}
