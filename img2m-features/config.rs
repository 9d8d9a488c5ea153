use crate::error::{FeatureError, FeatureResult};
use img2m_core::DetectorType;
use log::warn;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// SIFT parameter presets, applied before fine parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum SiftPreset {
    /// contrast 0.04, first octave 0
    Normal,
    /// contrast 0.03, first octave 0
    High,
    /// contrast 0.01, first octave -1
    Ultra,
    #[default]
    Custom,
}

impl SiftPreset {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => SiftPreset::Normal,
            "HIGH" => SiftPreset::High,
            "ULTRA" => SiftPreset::Ultra,
            "CUSTOM" => SiftPreset::Custom,
            other => {
                warn!("Unknown SIFT preset '{}', using CUSTOM", other);
                SiftPreset::Custom
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SiftPreset::Normal => "NORMAL",
            SiftPreset::High => "HIGH",
            SiftPreset::Ultra => "ULTRA",
            SiftPreset::Custom => "CUSTOM",
        }
    }

    /// `(contrast_threshold, first_octave)` overrides, `None` for CUSTOM
    pub fn overrides(&self) -> Option<(f32, i32)> {
        match self {
            SiftPreset::Normal => Some((0.04, 0)),
            SiftPreset::High => Some((0.03, 0)),
            SiftPreset::Ultra => Some((0.01, -1)),
            SiftPreset::Custom => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SiftParams {
    /// Strongest features kept, 0 keeps all
    pub nfeatures: usize,
    pub n_octave_layers: usize,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    pub sigma: f32,
    /// Bicubic instead of bilinear seed upscale
    pub enable_precise_upscale: bool,
    /// -1 upsamples 2x before detection, 1 halves the image
    pub first_octave: i32,
    pub num_octaves: usize,
    pub root_sift: bool,
    pub preset: SiftPreset,
}

impl Default for SiftParams {
    fn default() -> Self {
        Self {
            nfeatures: 0,
            n_octave_layers: 3,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            sigma: 1.6,
            enable_precise_upscale: false,
            first_octave: 0,
            num_octaves: 6,
            root_sift: true,
            preset: SiftPreset::Custom,
        }
    }
}

impl SiftParams {
    /// Default parameters with `preset` applied
    pub fn with_preset(preset: SiftPreset) -> Self {
        let mut params = Self { preset, ..Self::default() };
        params.apply_preset();
        params
    }

    /// Overwrite contrast threshold and first octave from the preset
    pub fn apply_preset(&mut self) {
        if let Some((contrast, first_octave)) = self.preset.overrides() {
            self.contrast_threshold = contrast;
            self.first_octave = first_octave;
        }
    }

    pub fn validate(&self) -> FeatureResult<()> {
        if !(-1..=1).contains(&self.first_octave) {
            return Err(FeatureError::InvalidFirstOctave(self.first_octave));
        }
        positive("SIFT", "contrast_threshold", self.contrast_threshold)?;
        positive("SIFT", "edge_threshold", self.edge_threshold)?;
        positive("SIFT", "sigma", self.sigma)?;
        at_least("SIFT", "n_octave_layers", self.n_octave_layers, 1)?;
        at_least("SIFT", "num_octaves", self.num_octaves, 1)
    }
}

/// Corner score used to rank ORB keypoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum OrbScoreType {
    #[default]
    Harris,
    Fast,
}

impl OrbScoreType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "HARRIS" | "HARRIS_SCORE" => OrbScoreType::Harris,
            "FAST" | "FAST_SCORE" => OrbScoreType::Fast,
            other => {
                warn!("Unknown ORB score type '{}', using HARRIS_SCORE", other);
                OrbScoreType::Harris
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrbScoreType::Harris => "HARRIS_SCORE",
            OrbScoreType::Fast => "FAST_SCORE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OrbParams {
    pub nfeatures: usize,
    pub scale_factor: f32,
    pub nlevels: usize,
    pub edge_threshold: usize,
    pub first_level: usize,
    pub wta_k: usize,
    pub score_type: OrbScoreType,
    pub patch_size: usize,
    pub fast_threshold: u8,
}

impl Default for OrbParams {
    fn default() -> Self {
        Self {
            nfeatures: 1000,
            scale_factor: 1.2,
            nlevels: 8,
            edge_threshold: 31,
            first_level: 0,
            wta_k: 2,
            score_type: OrbScoreType::Harris,
            patch_size: 31,
            fast_threshold: 20,
        }
    }
}

impl OrbParams {
    pub fn validate(&self) -> FeatureResult<()> {
        if self.scale_factor <= 1.0 {
            return Err(invalid("ORB", "scale_factor", format!("{} (must be > 1)", self.scale_factor)));
        }
        if self.wta_k != 2 {
            return Err(invalid("ORB", "wta_k", format!("{} (only 2 is supported)", self.wta_k)));
        }
        if self.patch_size < 7 || self.patch_size % 2 == 0 {
            return Err(invalid("ORB", "patch_size", format!("{} (must be odd and >= 7)", self.patch_size)));
        }
        if self.fast_threshold == 0 || self.fast_threshold > 127 {
            return Err(invalid("ORB", "fast_threshold", format!("{} (must be 1-127)", self.fast_threshold)));
        }
        at_least("ORB", "nlevels", self.nlevels, 1)?;
        at_least("ORB", "nfeatures", self.nfeatures, 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SurfParams {
    pub hessian_threshold: f32,
    pub n_octaves: usize,
    pub n_octave_layers: usize,
    /// 128-element descriptors instead of 64
    pub extended: bool,
    /// Skip orientation assignment
    pub upright: bool,
}

impl Default for SurfParams {
    fn default() -> Self {
        Self {
            hessian_threshold: 100.0,
            n_octaves: 4,
            n_octave_layers: 3,
            extended: false,
            upright: false,
        }
    }
}

impl SurfParams {
    pub fn descriptor_size(&self) -> usize {
        if self.extended { 128 } else { 64 }
    }

    pub fn validate(&self) -> FeatureResult<()> {
        if self.hessian_threshold < 0.0 {
            return Err(invalid("SURF", "hessian_threshold", format!("{} (must be >= 0)", self.hessian_threshold)));
        }
        at_least("SURF", "n_octaves", self.n_octaves, 1)?;
        at_least("SURF", "n_octave_layers", self.n_octave_layers, 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BriskParams {
    pub thresh: u8,
    pub octaves: usize,
    pub pattern_scale: f32,
}

impl Default for BriskParams {
    fn default() -> Self {
        Self {
            thresh: 30,
            octaves: 3,
            pattern_scale: 1.0,
        }
    }
}

impl BriskParams {
    pub fn validate(&self) -> FeatureResult<()> {
        if self.thresh == 0 {
            return Err(invalid("BRISK", "thresh", "0 (must be > 0)".to_string()));
        }
        positive("BRISK", "pattern_scale", self.pattern_scale)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AkazeParams {
    pub threshold: f32,
    pub n_octaves: usize,
    pub n_octave_layers: usize,
    /// MLDB channels: intensity only, plus gradient norm, or plus both gradients
    pub descriptor_channels: usize,
}

impl Default for AkazeParams {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            n_octaves: 4,
            n_octave_layers: 4,
            descriptor_channels: 3,
        }
    }
}

impl AkazeParams {
    pub fn validate(&self) -> FeatureResult<()> {
        positive("AKAZE", "threshold", self.threshold)?;
        at_least("AKAZE", "n_octaves", self.n_octaves, 1)?;
        at_least("AKAZE", "n_octave_layers", self.n_octave_layers, 1)?;
        if !(1..=3).contains(&self.descriptor_channels) {
            return Err(invalid("AKAZE", "descriptor_channels", format!("{} (must be 1-3)", self.descriptor_channels)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KazeParams {
    pub threshold: f32,
    pub n_octaves: usize,
    pub n_octave_layers: usize,
    pub extended: bool,
    pub upright: bool,
}

impl Default for KazeParams {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            n_octaves: 4,
            n_octave_layers: 4,
            extended: false,
            upright: false,
        }
    }
}

impl KazeParams {
    pub fn descriptor_size(&self) -> usize {
        if self.extended { 128 } else { 64 }
    }

    pub fn validate(&self) -> FeatureResult<()> {
        positive("KAZE", "threshold", self.threshold)?;
        at_least("KAZE", "n_octaves", self.n_octaves, 1)?;
        at_least("KAZE", "n_octave_layers", self.n_octave_layers, 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FastParams {
    pub threshold: u8,
    pub nonmax_suppression: bool,
}

impl Default for FastParams {
    fn default() -> Self {
        Self {
            threshold: 10,
            nonmax_suppression: true,
        }
    }
}

/// Segment-test masks supported by the AGAST detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AgastType {
    #[cfg_attr(feature = "serde", serde(rename = "AGAST_5_8"))]
    Agast5_8,
    #[cfg_attr(feature = "serde", serde(rename = "AGAST_7_12d"))]
    Agast7_12d,
    #[cfg_attr(feature = "serde", serde(rename = "AGAST_7_12s"))]
    Agast7_12s,
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "OAST_9_16"))]
    Oast9_16,
}

impl AgastType {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "AGAST_5_8" => AgastType::Agast5_8,
            "AGAST_7_12D" => AgastType::Agast7_12d,
            "AGAST_7_12S" => AgastType::Agast7_12s,
            "OAST_9_16" => AgastType::Oast9_16,
            other => {
                warn!("Unknown AGAST type '{}', using OAST_9_16", other);
                AgastType::Oast9_16
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgastType::Agast5_8 => "AGAST_5_8",
            AgastType::Agast7_12d => "AGAST_7_12d",
            AgastType::Agast7_12s => "AGAST_7_12s",
            AgastType::Oast9_16 => "OAST_9_16",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgastParams {
    pub threshold: u8,
    pub nonmax_suppression: bool,
    pub agast_type: AgastType,
}

impl Default for AgastParams {
    fn default() -> Self {
        Self {
            threshold: 10,
            nonmax_suppression: true,
            agast_type: AgastType::Oast9_16,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SuperPointParams {
    pub max_keypoints: usize,
    pub detection_threshold: f32,
    pub nms_radius: usize,
    pub remove_borders: usize,
    pub python_executable: String,
    /// Inference script; the kernel falls back to SIFT when unset
    pub script_path: Option<PathBuf>,
}

impl Default for SuperPointParams {
    fn default() -> Self {
        Self {
            max_keypoints: 2048,
            detection_threshold: 0.0005,
            nms_radius: 4,
            remove_borders: 4,
            python_executable: "python3".to_string(),
            script_path: None,
        }
    }
}

impl SuperPointParams {
    pub fn validate(&self) -> FeatureResult<()> {
        positive("SUPERPOINT", "detection_threshold", self.detection_threshold)?;
        at_least("SUPERPOINT", "max_keypoints", self.max_keypoints, 1)
    }
}

/// Detector selection with its parameters, one variant per kernel
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "detector", rename_all = "UPPERCASE"))]
pub enum DetectorConfig {
    Sift(SiftParams),
    Orb(OrbParams),
    Surf(SurfParams),
    Brisk(BriskParams),
    Akaze(AkazeParams),
    Kaze(KazeParams),
    Fast(FastParams),
    Agast(AgastParams),
    SuperPoint(SuperPointParams),
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig::Sift(SiftParams::default())
    }
}

impl DetectorConfig {
    /// Default parameters of a detector family
    pub fn default_for(detector: DetectorType) -> Self {
        match detector {
            DetectorType::Sift => DetectorConfig::Sift(SiftParams::default()),
            DetectorType::Orb => DetectorConfig::Orb(OrbParams::default()),
            DetectorType::Surf => DetectorConfig::Surf(SurfParams::default()),
            DetectorType::Brisk => DetectorConfig::Brisk(BriskParams::default()),
            DetectorType::Akaze => DetectorConfig::Akaze(AkazeParams::default()),
            DetectorType::Kaze => DetectorConfig::Kaze(KazeParams::default()),
            DetectorType::Fast => DetectorConfig::Fast(FastParams::default()),
            DetectorType::Agast => DetectorConfig::Agast(AgastParams::default()),
            DetectorType::SuperPoint => DetectorConfig::SuperPoint(SuperPointParams::default()),
        }
    }

    pub fn detector_type(&self) -> DetectorType {
        match self {
            DetectorConfig::Sift(_) => DetectorType::Sift,
            DetectorConfig::Orb(_) => DetectorType::Orb,
            DetectorConfig::Surf(_) => DetectorType::Surf,
            DetectorConfig::Brisk(_) => DetectorType::Brisk,
            DetectorConfig::Akaze(_) => DetectorType::Akaze,
            DetectorConfig::Kaze(_) => DetectorType::Kaze,
            DetectorConfig::Fast(_) => DetectorType::Fast,
            DetectorConfig::Agast(_) => DetectorType::Agast,
            DetectorConfig::SuperPoint(_) => DetectorType::SuperPoint,
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> FeatureResult<()> {
        match self {
            DetectorConfig::Sift(p) => p.validate(),
            DetectorConfig::Orb(p) => p.validate(),
            DetectorConfig::Surf(p) => p.validate(),
            DetectorConfig::Brisk(p) => p.validate(),
            DetectorConfig::Akaze(p) => p.validate(),
            DetectorConfig::Kaze(p) => p.validate(),
            DetectorConfig::Fast(p) => fast_threshold("FAST", p.threshold),
            DetectorConfig::Agast(p) => fast_threshold("AGAST", p.threshold),
            DetectorConfig::SuperPoint(p) => p.validate(),
        }
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        match self {
            DetectorConfig::Sift(p) => format!(
                "SIFT: nfeatures={}, layers={}, contrast={}, edge={}, sigma={}, first_octave={}, octaves={}, root_sift={}, preset={:?}",
                p.nfeatures, p.n_octave_layers, p.contrast_threshold, p.edge_threshold, p.sigma,
                p.first_octave, p.num_octaves, p.root_sift, p.preset
            ),
            DetectorConfig::Orb(p) => format!(
                "ORB: nfeatures={}, scale={}, levels={}, patch={}, fast_threshold={}",
                p.nfeatures, p.scale_factor, p.nlevels, p.patch_size, p.fast_threshold
            ),
            DetectorConfig::Surf(p) => format!(
                "SURF: hessian={}, octaves={}, layers={}, extended={}, upright={}",
                p.hessian_threshold, p.n_octaves, p.n_octave_layers, p.extended, p.upright
            ),
            DetectorConfig::Brisk(p) => format!(
                "BRISK: thresh={}, octaves={}, pattern_scale={}",
                p.thresh, p.octaves, p.pattern_scale
            ),
            DetectorConfig::Akaze(p) => format!(
                "AKAZE: threshold={}, octaves={}, layers={}",
                p.threshold, p.n_octaves, p.n_octave_layers
            ),
            DetectorConfig::Kaze(p) => format!(
                "KAZE: threshold={}, octaves={}, layers={}, extended={}",
                p.threshold, p.n_octaves, p.n_octave_layers, p.extended
            ),
            DetectorConfig::Fast(p) => format!("FAST: threshold={}, nms={}", p.threshold, p.nonmax_suppression),
            DetectorConfig::Agast(p) => format!(
                "AGAST: threshold={}, nms={}, type={}",
                p.threshold, p.nonmax_suppression, p.agast_type.name()
            ),
            DetectorConfig::SuperPoint(p) => format!(
                "SUPERPOINT: max_keypoints={}, threshold={}, nms_radius={}, python={}",
                p.max_keypoints, p.detection_threshold, p.nms_radius, p.python_executable
            ),
        }
    }

    /// Save configuration to JSON file
    #[cfg(feature = "serde")]
    pub fn save_json<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON file
    #[cfg(feature = "serde")]
    pub fn load_json<P: AsRef<std::path::Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML string
    #[cfg(feature = "serde")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialize from TOML string
    #[cfg(feature = "serde")]
    pub fn from_toml(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(detector: &'static str, name: &'static str, reason: String) -> FeatureError {
    FeatureError::InvalidParameter { detector, name, reason }
}

fn positive(detector: &'static str, name: &'static str, value: f32) -> FeatureResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(detector, name, format!("{} (must be > 0)", value)))
    }
}

fn at_least(detector: &'static str, name: &'static str, value: usize, min: usize) -> FeatureResult<()> {
    if value >= min {
        Ok(())
    } else {
        Err(invalid(detector, name, format!("{} (must be >= {})", value, min)))
    }
}

fn fast_threshold(detector: &'static str, threshold: u8) -> FeatureResult<()> {
    if threshold == 0 || threshold > 127 {
        return Err(invalid(detector, "threshold", format!("{} (must be 1-127)", threshold)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sift_defaults() {
        let p = SiftParams::default();
        assert_eq!(p.nfeatures, 0);
        assert_eq!(p.n_octave_layers, 3);
        assert_eq!(p.first_octave, 0);
        assert_eq!(p.num_octaves, 6);
        assert!(p.root_sift);
        assert!(!p.enable_precise_upscale);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_presets_override_fine_parameters() {
        let ultra = SiftParams::with_preset(SiftPreset::Ultra);
        assert_eq!(ultra.contrast_threshold, 0.01);
        assert_eq!(ultra.first_octave, -1);

        let high = SiftParams::with_preset(SiftPreset::High);
        assert_eq!(high.contrast_threshold, 0.03);
        assert_eq!(high.first_octave, 0);

        let mut custom = SiftParams { contrast_threshold: 0.02, first_octave: 1, ..SiftParams::default() };
        custom.apply_preset();
        assert_eq!(custom.contrast_threshold, 0.02);
        assert_eq!(custom.first_octave, 1);
    }

    #[test]
    fn test_invalid_first_octave() {
        let p = SiftParams { first_octave: 2, ..SiftParams::default() };
        assert!(matches!(p.validate(), Err(FeatureError::InvalidFirstOctave(2))));
    }

    #[test]
    fn test_orb_rejects_unsupported_wta_k() {
        let p = OrbParams { wta_k: 3, ..OrbParams::default() };
        assert!(matches!(p.validate(), Err(FeatureError::InvalidParameter { name: "wta_k", .. })));
    }

    #[test]
    fn test_default_for_every_detector_validates() {
        for detector in DetectorType::ALL {
            let config = DetectorConfig::default_for(detector);
            assert_eq!(config.detector_type(), detector);
            assert!(config.validate().is_ok(), "{}", config.summary());
        }
    }

    #[test]
    fn test_agast_type_names() {
        assert_eq!(AgastType::from_name("agast_7_12d"), AgastType::Agast7_12d);
        assert_eq!(AgastType::from_name("bogus"), AgastType::Oast9_16);
        assert_eq!(AgastType::Agast5_8.name(), "AGAST_5_8");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_toml_roundtrip() {
        let config = DetectorConfig::Sift(SiftParams::with_preset(SiftPreset::High));
        let text = config.to_toml().unwrap();
        assert_eq!(DetectorConfig::from_toml(&text).unwrap(), config);
    }
}
