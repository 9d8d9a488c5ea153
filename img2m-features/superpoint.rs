//! SuperPoint keypoints and descriptors produced by an external inference
//! script.

use crate::config::SuperPointParams;
use crate::error::{FeatureError, FeatureResult};
use image::GrayImage;
use img2m_core::{Descriptors, Keypoint};
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::process::Command;

pub const DESCRIPTOR_SIZE: usize = 256;

pub struct SuperPointExtractor {
    params: SuperPointParams,
}

impl SuperPointExtractor {
    pub fn new(params: SuperPointParams) -> FeatureResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Run the inference script on `img`.
    ///
    /// The image and the script output live in a private temporary directory
    /// that is removed when this returns, whether it succeeds or not.
    pub fn detect_and_compute(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
        let script = self
            .params
            .script_path
            .as_deref()
            .ok_or_else(|| FeatureError::ExternalProcess("no SuperPoint script configured".to_string()))?;
        if !script.is_file() {
            return Err(FeatureError::ExternalProcess(format!("script not found: {}", script.display())));
        }

        let workdir = tempfile::Builder::new().prefix("img2m_superpoint").tempdir()?;
        let image_path = workdir.path().join("image.png");
        let output_path = workdir.path().join("features.txt");
        img.save(&image_path)?;

        let p = &self.params;
        let output = Command::new(&p.python_executable)
            .arg(script)
            .arg("--image")
            .arg(&image_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--max_keypoints")
            .arg(p.max_keypoints.to_string())
            .arg("--detection_threshold")
            .arg(p.detection_threshold.to_string())
            .arg("--nms_radius")
            .arg(p.nms_radius.to_string())
            .arg("--remove_borders")
            .arg(p.remove_borders.to_string())
            .output()?;
        if !output.status.success() {
            return Err(FeatureError::ExternalProcess(format!(
                "SuperPoint exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("SuperPoint stdout: {}", String::from_utf8_lossy(&output.stdout).trim());

        let result = read_feature_file(&output_path, DESCRIPTOR_SIZE)?;
        info!("SuperPoint: {} keypoints", result.0.len());
        Ok(result)
    }
}

/// Read a feature text file: a count line, then `x y size angle response d0 ..`
/// per keypoint. Missing descriptor values read as 0.
pub fn read_feature_file(path: &Path, descriptor_size: usize) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
    parse_feature_text(&fs::read_to_string(path)?, descriptor_size)
}

pub fn parse_feature_text(text: &str, descriptor_size: usize) -> FeatureResult<(Vec<Keypoint>, Descriptors<f32>)> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let count: usize = lines
        .next()
        .ok_or_else(|| FeatureError::MalformedFeatureFile("empty file".to_string()))?
        .trim()
        .parse()
        .map_err(|e| FeatureError::MalformedFeatureFile(format!("bad keypoint count: {}", e)))?;

    let mut keypoints = Vec::with_capacity(count);
    let mut descriptors = Descriptors::new(descriptor_size);
    let mut row = vec![0.0f32; descriptor_size];
    for (n, line) in lines.take(count).enumerate() {
        let values: Vec<f32> = line
            .split_whitespace()
            .map(|v| v.parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|e| FeatureError::MalformedFeatureFile(format!("line {}: {}", n + 2, e)))?;
        if values.len() < 2 {
            return Err(FeatureError::MalformedFeatureFile(format!("line {}: missing coordinates", n + 2)));
        }
        let field = |i: usize| values.get(i).copied().unwrap_or(0.0);
        keypoints.push(Keypoint::new(field(0), field(1), field(2), field(3), field(4)));
        for (k, slot) in row.iter_mut().enumerate() {
            *slot = field(5 + k);
        }
        descriptors.push_row(&row)?;
    }
    if keypoints.len() != count {
        return Err(FeatureError::MalformedFeatureFile(format!(
            "expected {} keypoints, found {}",
            count,
            keypoints.len()
        )));
    }
    Ok((keypoints, descriptors))
}
