//! LightGlue matching through an external inference script.

use crate::config::LightGlueParams;
use crate::error::{MatchError, MatchResult};
use image::GrayImage;
use img2m_core::{DescriptorMatrix, Keypoint, Match};
use log::{debug, warn};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Everything LightGlue needs from one view
#[derive(Debug, Clone, Copy)]
pub struct ViewData<'a> {
    pub image: &'a GrayImage,
    pub keypoints: &'a [Keypoint],
    pub descriptors: &'a DescriptorMatrix,
}

pub struct LightGlueMatcher {
    params: LightGlueParams,
}

impl LightGlueMatcher {
    pub fn new(params: LightGlueParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LightGlueParams {
        &self.params
    }

    /// Match `query` against `train`.
    ///
    /// Inputs and output are exchanged through a private temporary directory
    /// that is removed on return.
    pub fn match_pair(&self, query: &ViewData<'_>, train: &ViewData<'_>) -> MatchResult<Vec<Match>> {
        if query.keypoints.is_empty() || train.keypoints.is_empty() {
            return Err(MatchError::MissingPairData);
        }
        let p = &self.params;
        let script = p
            .script_path
            .as_deref()
            .ok_or_else(|| MatchError::ExternalProcess("no LightGlue script configured".to_string()))?;
        if !script.is_file() {
            return Err(MatchError::ExternalProcess(format!("script not found: {}", script.display())));
        }

        let workdir = tempfile::Builder::new().prefix("img2m_lightglue").tempdir()?;
        let dir = workdir.path();
        let (img1, img2) = (dir.join("image1.png"), dir.join("image2.png"));
        let (fea1, fea2) = (dir.join("features1.txt"), dir.join("features2.txt"));
        let output_path = dir.join("matches.txt");
        query.image.save(&img1)?;
        train.image.save(&img2)?;
        write_feature_file(&fea1, query.keypoints, query.descriptors)?;
        write_feature_file(&fea2, train.keypoints, train.descriptors)?;

        let mut command = Command::new(&p.python_executable);
        command
            .arg(script)
            .arg("--img1")
            .arg(&img1)
            .arg("--img2")
            .arg(&img2)
            .arg("--features1")
            .arg(&fea1)
            .arg("--features2")
            .arg(&fea2)
            .arg("--output")
            .arg(&output_path)
            .arg("--feature_type")
            .arg(p.feature_type.script_name())
            .arg("--max_keypoints")
            .arg(p.max_num_keypoints.to_string())
            .arg("--depth_confidence")
            .arg(p.depth_confidence.to_string())
            .arg("--width_confidence")
            .arg(p.width_confidence.to_string())
            .arg("--filter_threshold")
            .arg(p.filter_threshold.to_string());
        if p.flash_attention {
            command.arg("--flash_attention");
        }
        if p.mixed_precision {
            command.arg("--mixed_precision");
        }
        if p.compile_model {
            command.arg("--compile_model");
        }

        let output = command.output()?;
        if !output.status.success() {
            return Err(MatchError::ExternalProcess(format!(
                "LightGlue exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("LightGlue stdout: {}", String::from_utf8_lossy(&output.stdout).trim());

        let text = fs::read_to_string(&output_path)?;
        parse_match_text(&text, query.keypoints.len(), train.keypoints.len())
    }
}

/// Count line, then `x y size angle response d0 d1 ..` per keypoint
pub fn format_feature_text(keypoints: &[Keypoint], descriptors: &DescriptorMatrix) -> String {
    let values = descriptors.to_f32();
    let mut text = format!("{}\n", keypoints.len());
    for (i, kp) in keypoints.iter().enumerate() {
        let _ = write!(text, "{} {} {} {} {}", kp.x, kp.y, kp.size, kp.angle, kp.response);
        if i < values.rows() {
            for v in values.row(i) {
                let _ = write!(text, " {}", v);
            }
        }
        text.push('\n');
    }
    text
}

pub fn write_feature_file(path: &Path, keypoints: &[Keypoint], descriptors: &DescriptorMatrix) -> MatchResult<()> {
    fs::write(path, format_feature_text(keypoints, descriptors))?;
    Ok(())
}

/// Parse `query_idx train_idx distance` lines, dropping out-of-range indices
pub fn parse_match_text(text: &str, query_len: usize, train_len: usize) -> MatchResult<Vec<Match>> {
    let mut matches = Vec::new();
    let mut dropped = 0usize;
    for (n, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let [q, t, d] = fields.as_slice() else {
            return Err(MatchError::MalformedOutput(format!("line {}: expected 3 fields, got {}", n + 1, fields.len())));
        };
        let bad = |e: &dyn std::fmt::Display| MatchError::MalformedOutput(format!("line {}: {}", n + 1, e));
        let q: i64 = q.parse().map_err(|e| bad(&e))?;
        let t: i64 = t.parse().map_err(|e| bad(&e))?;
        let d: f32 = d.parse().map_err(|e| bad(&e))?;
        if q < 0 || t < 0 || q as usize >= query_len || t as usize >= train_len {
            dropped += 1;
            continue;
        }
        matches.push(Match::new(q as usize, t as usize, d));
    }
    if dropped > 0 {
        warn!("LightGlue: dropped {} matches with out-of-range indices", dropped);
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use img2m_core::Descriptors;

    fn create_view_keypoints(n: usize) -> Vec<Keypoint> {
        (0..n).map(|i| Keypoint::new(i as f32, 2.0 * i as f32, 4.0, 90.0, 0.5)).collect()
    }

    #[test]
    fn test_feature_text_layout() {
        let kps = create_view_keypoints(2);
        let desc: DescriptorMatrix = Descriptors::from_rows(2, &[[1u8, 2], [3, 4]]).unwrap().into();
        let text = format_feature_text(&kps, &desc);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["2", "0 0 4 90 0.5 1 2", "1 2 4 90 0.5 3 4"]);
    }

    #[test]
    fn test_parse_matches() {
        let text = "0 1 0.5\n\n2 0 0.25\n5 0 0.1\n-1 0 0.3\n";
        let matches = parse_match_text(text, 3, 2).unwrap();
        assert_eq!(matches, vec![Match::new(0, 1, 0.5), Match::new(2, 0, 0.25)]);
        assert!(matches!(parse_match_text("0 1\n", 3, 2), Err(MatchError::MalformedOutput(_))));
        assert!(matches!(parse_match_text("a 1 0.2\n", 3, 2), Err(MatchError::MalformedOutput(_))));
    }

    #[test]
    fn test_missing_script_is_an_error() {
        let img: GrayImage = ImageBuffer::from_pixel(16, 16, Luma([0u8]));
        let kps = create_view_keypoints(1);
        let desc: DescriptorMatrix = Descriptors::from_rows(2, &[[0.0f32, 1.0]]).unwrap().into();
        let view = ViewData { image: &img, keypoints: &kps, descriptors: &desc };
        let matcher = LightGlueMatcher::new(LightGlueParams::default());
        assert!(matches!(matcher.match_pair(&view, &view), Err(MatchError::ExternalProcess(_))));

        let none: Vec<Keypoint> = Vec::new();
        let empty = ViewData { keypoints: &none, ..view };
        assert!(matches!(matcher.match_pair(&empty, &view), Err(MatchError::MissingPairData)));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_script_and_reads_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_lightglue.sh");
        fs::write(
            &script,
            "while [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--output\" ]; then out=\"$2\"; fi\n  shift\ndone\nprintf '0 1 0.5\\n1 0 0.25\\n9 0 0.1\\n' > \"$out\"\n",
        )
        .unwrap();
        let params = LightGlueParams {
            python_executable: "sh".to_string(),
            script_path: Some(script),
            ..LightGlueParams::default()
        };

        let img: GrayImage = ImageBuffer::from_pixel(16, 16, Luma([0u8]));
        let kps = create_view_keypoints(2);
        let desc: DescriptorMatrix = Descriptors::from_rows(2, &[[0.0f32, 1.0], [1.0, 0.0]]).unwrap().into();
        let view = ViewData { image: &img, keypoints: &kps, descriptors: &desc };
        let matches = LightGlueMatcher::new(params).match_pair(&view, &view).unwrap();
        assert_eq!(matches, vec![Match::new(0, 1, 0.5), Match::new(1, 0, 0.25)]);
    }
}
