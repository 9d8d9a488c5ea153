//! JSON export and reload of feature and match collections.

use crate::error::{PipelineError, PipelineResult};
use img2m_core::{Features, Match, Matches, ViewPair};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const FEATURES_FILE: &str = "features_all.json";
pub const MATCHES_FILE: &str = "matches_all.json";

/// Serialized form of one matches entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMatches {
    pub view_i: u32,
    pub view_j: u32,
    pub matches: Vec<Match>,
}

/// Write `features_all.json` into `dir`
pub fn export_features(features: &Features, dir: &Path) -> PipelineResult<PathBuf> {
    let path = dir.join(FEATURES_FILE);
    write_json(&path, features)?;
    info!(
        "Exported features of {} views ({} keypoints) to {}",
        features.filled_count(),
        features.total_keypoints(),
        path.display()
    );
    Ok(path)
}

/// Write `matches_all.json` into `dir`
pub fn export_matches(matches: &Matches, dir: &Path) -> PipelineResult<PathBuf> {
    let path = dir.join(MATCHES_FILE);
    let entries: Vec<PairMatches> = matches
        .iter()
        .map(|(pair, found)| PairMatches {
            view_i: pair.i(),
            view_j: pair.j(),
            matches: found.clone(),
        })
        .collect();
    write_json(&path, &entries)?;
    info!(
        "Exported {} matches of {} pairs to {}",
        matches.total_matches(),
        matches.len(),
        path.display()
    );
    Ok(path)
}

/// Load features from a file or from `features_all.json` in a directory
pub fn load_features(path: &Path) -> PipelineResult<Features> {
    read_json(&resolve(path, FEATURES_FILE))
}

/// Load matches from a file or from `matches_all.json` in a directory.
/// Pair keys must satisfy `i < j`.
pub fn load_matches(path: &Path) -> PipelineResult<Matches> {
    let entries: Vec<PairMatches> = read_json(&resolve(path, MATCHES_FILE))?;
    let mut matches = Matches::new();
    for entry in entries {
        matches.insert(ViewPair::new(entry.view_i, entry.view_j)?, entry.matches);
    }
    Ok(matches)
}

fn resolve(path: &Path, file_name: &str) -> PathBuf {
    if path.is_dir() {
        path.join(file_name)
    } else {
        path.to_path_buf()
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> PipelineResult<()> {
    let fail = |reason: String| PipelineError::Export {
        path: path.to_path_buf(),
        reason,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
    }
    let file = File::create(path).map_err(|e| fail(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|e| fail(e.to_string()))?;
    writer.flush().map_err(|e| fail(e.to_string()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<T> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PipelineError::InputData(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use img2m_core::{FeatureRecord, Keypoint};

    fn create_test_features() -> Features {
        let mut features = Features::with_len(3);
        let kps = vec![
            Keypoint::new(10.125, 20.5, 3.3, 271.7, 0.013),
            Keypoint::new(0.1, 0.2, 1.6, 0.0, 1e-7),
        ];
        features
            .fill(0, FeatureRecord::new("imgs/0001.png", kps.clone(), Some(vec![[255, 0, 3], [0, 0, 0]])))
            .unwrap();
        features.fill(2, FeatureRecord::new("imgs/0003.png", kps, None)).unwrap();
        features
    }

    fn create_test_matches() -> Matches {
        [
            (ViewPair::new(0, 2).unwrap(), vec![Match::new(0, 1, 0.123_456_79), Match::new(1, 0, 2.5)]),
            (ViewPair::new(1, 2).unwrap(), vec![Match::new(4, 4, 1e-3)]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_features_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let features = create_test_features();
        let path = export_features(&features, &dir.path().join("nested/features")).unwrap();
        assert!(path.ends_with(FEATURES_FILE));
        assert_eq!(load_features(&path).unwrap(), features);
        assert_eq!(load_features(path.parent().unwrap()).unwrap(), features);
    }

    #[test]
    fn test_matches_round_trip_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let matches = create_test_matches();
        let path = export_matches(&matches, dir.path()).unwrap();
        assert_eq!(load_matches(&path).unwrap(), matches);
        assert_eq!(load_matches(dir.path()).unwrap(), matches);
    }

    #[test]
    fn test_non_canonical_pair_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MATCHES_FILE);
        fs::write(&path, r#"[{"view_i": 2, "view_j": 1, "matches": []}]"#).unwrap();
        assert!(matches!(load_matches(&path), Err(PipelineError::Core(_))));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(load_matches(&path), Err(PipelineError::InputData(_))));
        assert!(matches!(load_features(&dir.path().join("missing.json")), Err(PipelineError::Io(_))));
    }
}
