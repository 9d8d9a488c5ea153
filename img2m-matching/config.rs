use crate::error::{MatchError, MatchResult};
use img2m_core::DetectorType;
use log::warn;
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Matcher backend selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MatcherType {
    #[default]
    CascadeHashingL2,
    Flann,
    BruteForceL2,
    BruteForceL1,
    BruteForceHamming,
    LightGlue,
}

impl MatcherType {
    pub const ALL: [MatcherType; 6] = [
        MatcherType::CascadeHashingL2,
        MatcherType::Flann,
        MatcherType::BruteForceL2,
        MatcherType::BruteForceL1,
        MatcherType::BruteForceHamming,
        MatcherType::LightGlue,
    ];

    /// Case-insensitive lookup of a configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        Self::ALL.iter().copied().find(|m| m.config_name() == upper)
    }

    /// Case-insensitive lookup falling back to cascade hashing
    pub fn parse_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            warn!("Unknown matcher type '{}', using FASTCASCADEHASHINGL2", name);
            MatcherType::CascadeHashingL2
        })
    }

    /// Name used in configuration files
    pub fn config_name(&self) -> &'static str {
        match self {
            MatcherType::CascadeHashingL2 => "FASTCASCADEHASHINGL2",
            MatcherType::Flann => "FLANN",
            MatcherType::BruteForceL2 => "BF",
            MatcherType::BruteForceL1 => "BF_NORM_L1",
            MatcherType::BruteForceHamming => "BF_HAMMING",
            MatcherType::LightGlue => "LIGHTGLUE",
        }
    }

    /// Backend name used in log messages
    pub fn backend_name(&self) -> &'static str {
        match self {
            MatcherType::CascadeHashingL2 => "CASCADE_HASHING_L2",
            MatcherType::Flann => "FLANN",
            MatcherType::BruteForceL2 => "BRUTE_FORCE_L2",
            MatcherType::BruteForceL1 => "BRUTE_FORCE_L1",
            MatcherType::BruteForceHamming => "BRUTE_FORCE_HAMMING",
            MatcherType::LightGlue => "LIGHTGLUE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum FlannAlgorithm {
    /// Chosen from the detector family
    #[default]
    Auto,
    KdTree,
    Lsh,
    KMeans,
    Composite,
    Linear,
}

impl FlannAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Some(FlannAlgorithm::Auto),
            "KDTREE" => Some(FlannAlgorithm::KdTree),
            "LSH" => Some(FlannAlgorithm::Lsh),
            "KMEANS" => Some(FlannAlgorithm::KMeans),
            "COMPOSITE" => Some(FlannAlgorithm::Composite),
            "LINEAR" => Some(FlannAlgorithm::Linear),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlannAlgorithm::Auto => "AUTO",
            FlannAlgorithm::KdTree => "KDTREE",
            FlannAlgorithm::Lsh => "LSH",
            FlannAlgorithm::KMeans => "KMEANS",
            FlannAlgorithm::Composite => "COMPOSITE",
            FlannAlgorithm::Linear => "LINEAR",
        }
    }

    /// Resolve `AUTO`: KD-trees for float families, LSH for binary ones,
    /// KD-trees otherwise
    pub fn resolve(self, detector: DetectorType) -> Self {
        match self {
            FlannAlgorithm::Auto => match detector {
                DetectorType::Orb | DetectorType::Brisk | DetectorType::Akaze => FlannAlgorithm::Lsh,
                _ => FlannAlgorithm::KdTree,
            },
            other => other,
        }
    }
}

/// Seeding strategy of the hierarchical k-means index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum FlannCentersInit {
    #[default]
    Random,
    Gonzales,
    KMeansPP,
}

impl FlannCentersInit {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "RANDOM" | "CENTERS_RANDOM" => Some(FlannCentersInit::Random),
            "GONZALES" | "CENTERS_GONZALES" => Some(FlannCentersInit::Gonzales),
            "KMEANSPP" | "CENTERS_KMEANSPP" => Some(FlannCentersInit::KMeansPP),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlannCentersInit::Random => "CENTERS_RANDOM",
            FlannCentersInit::Gonzales => "CENTERS_GONZALES",
            FlannCentersInit::KMeansPP => "CENTERS_KMEANSPP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum FlannPreset {
    /// 4 trees, 32 checks, 6 tables, key 12, probe 1
    Fast,
    /// 8 trees, 100 checks, 12 tables, key 20, probe 2
    #[default]
    Balanced,
    /// 12 trees, 300 checks, 20 tables, key 32, probe 2
    Accurate,
    Custom,
}

impl FlannPreset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "FAST" => Some(FlannPreset::Fast),
            "BALANCED" => Some(FlannPreset::Balanced),
            "ACCURATE" => Some(FlannPreset::Accurate),
            "CUSTOM" => Some(FlannPreset::Custom),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlannPreset::Fast => "FAST",
            FlannPreset::Balanced => "BALANCED",
            FlannPreset::Accurate => "ACCURATE",
            FlannPreset::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlannParams {
    /// When false the library defaults apply: KD-forest with 4 trees, 32 checks
    pub use_advanced_control: bool,
    pub algorithm: FlannAlgorithm,
    pub trees: usize,
    pub table_number: usize,
    pub key_size: usize,
    pub multi_probe_level: usize,
    pub branching: usize,
    pub iterations: usize,
    pub centers_init: FlannCentersInit,
    pub checks: usize,
    pub eps: f32,
    pub sorted: bool,
    /// Negative means unlimited
    pub max_neighbors: i32,
    pub preset: FlannPreset,
}

impl Default for FlannParams {
    fn default() -> Self {
        Self {
            use_advanced_control: true,
            algorithm: FlannAlgorithm::Auto,
            trees: 8,
            table_number: 12,
            key_size: 20,
            multi_probe_level: 2,
            branching: 32,
            iterations: 11,
            centers_init: FlannCentersInit::Random,
            checks: 100,
            eps: 0.0,
            sorted: true,
            max_neighbors: -1,
            preset: FlannPreset::Balanced,
        }
    }
}

impl FlannParams {
    pub fn with_preset(preset: FlannPreset) -> Self {
        let mut params = Self { preset, ..Self::default() };
        params.apply_preset();
        params
    }

    /// Overwrite trees, checks and LSH parameters from the preset
    pub fn apply_preset(&mut self) {
        let values = match self.preset {
            FlannPreset::Fast => Some((4, 32, 6, 12, 1)),
            FlannPreset::Balanced => Some((8, 100, 12, 20, 2)),
            FlannPreset::Accurate => Some((12, 300, 20, 32, 2)),
            FlannPreset::Custom => None,
        };
        if let Some((trees, checks, tables, key, probe)) = values {
            self.trees = trees;
            self.checks = checks;
            self.table_number = tables;
            self.key_size = key;
            self.multi_probe_level = probe;
        }
    }

    /// Parameters actually used by the index
    pub fn effective(&self) -> Self {
        if self.use_advanced_control {
            self.clone()
        } else {
            Self {
                algorithm: FlannAlgorithm::KdTree,
                trees: 4,
                checks: 32,
                ..self.clone()
            }
        }
    }

    pub fn validate(&self) -> MatchResult<()> {
        if !(1..=16).contains(&self.trees) {
            return Err(invalid("trees", format!("{} (must be 1-16)", self.trees)));
        }
        if self.table_number == 0 {
            return Err(invalid("table_number", "0 (must be > 0)".to_string()));
        }
        if !(1..=64).contains(&self.key_size) {
            return Err(invalid("key_size", format!("{} (must be 1-64)", self.key_size)));
        }
        if self.branching < 2 {
            return Err(invalid("branching", format!("{} (must be >= 2)", self.branching)));
        }
        if self.checks == 0 {
            return Err(invalid("checks", "0 (must be > 0)".to_string()));
        }
        if self.eps < 0.0 {
            return Err(invalid("eps", format!("{} (must be >= 0)", self.eps)));
        }
        Ok(())
    }
}

/// Local features understood by the LightGlue script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum LightGlueFeatureType {
    #[default]
    SuperPoint,
    Disk,
    Sift,
    Aliked,
    DogHardNet,
}

impl LightGlueFeatureType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SUPERPOINT" => Some(LightGlueFeatureType::SuperPoint),
            "DISK" => Some(LightGlueFeatureType::Disk),
            "SIFT" => Some(LightGlueFeatureType::Sift),
            "ALIKED" => Some(LightGlueFeatureType::Aliked),
            "DOGHARDNET" => Some(LightGlueFeatureType::DogHardNet),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LightGlueFeatureType::SuperPoint => "SUPERPOINT",
            LightGlueFeatureType::Disk => "DISK",
            LightGlueFeatureType::Sift => "SIFT",
            LightGlueFeatureType::Aliked => "ALIKED",
            LightGlueFeatureType::DogHardNet => "DOGHARDNET",
        }
    }

    /// Lowercase name passed on the script command line
    pub fn script_name(&self) -> &'static str {
        match self {
            LightGlueFeatureType::SuperPoint => "superpoint",
            LightGlueFeatureType::Disk => "disk",
            LightGlueFeatureType::Sift => "sift",
            LightGlueFeatureType::Aliked => "aliked",
            LightGlueFeatureType::DogHardNet => "doghardnet",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LightGlueParams {
    pub feature_type: LightGlueFeatureType,
    pub max_num_keypoints: usize,
    pub depth_confidence: f32,
    pub width_confidence: f32,
    pub filter_threshold: f32,
    pub flash_attention: bool,
    pub mixed_precision: bool,
    pub compile_model: bool,
    pub python_executable: String,
    /// Matching script; LightGlue downgrades to cascade hashing when unset
    pub script_path: Option<PathBuf>,
}

impl Default for LightGlueParams {
    fn default() -> Self {
        Self {
            feature_type: LightGlueFeatureType::SuperPoint,
            max_num_keypoints: 2048,
            depth_confidence: 0.95,
            width_confidence: 0.99,
            filter_threshold: 0.1,
            flash_attention: true,
            mixed_precision: false,
            compile_model: false,
            python_executable: "python3".to_string(),
            script_path: None,
        }
    }
}

impl LightGlueParams {
    pub fn validate(&self) -> MatchResult<()> {
        for (name, value) in [
            ("depth_confidence", self.depth_confidence),
            ("width_confidence", self.width_confidence),
            ("filter_threshold", self.filter_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(name, format!("{} (must be in [0, 1])", value)));
            }
        }
        if self.max_num_keypoints == 0 {
            return Err(invalid("max_num_keypoints", "0 (must be > 0)".to_string()));
        }
        Ok(())
    }
}

/// Matching configuration shared by every pair of a run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MatcherConfig {
    pub matcher_type: MatcherType,
    /// Symmetric single-best matching instead of the ratio test
    pub cross_check: bool,
    pub ratio_thresh: f32,
    /// 0 keeps every match
    pub max_matches: usize,
    pub flann: FlannParams,
    pub lightglue: LightGlueParams,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            matcher_type: MatcherType::CascadeHashingL2,
            cross_check: false,
            ratio_thresh: 0.8,
            max_matches: 0,
            flann: FlannParams::default(),
            lightglue: LightGlueParams::default(),
        }
    }
}

impl MatcherConfig {
    pub fn with_matcher(matcher_type: MatcherType) -> Self {
        Self { matcher_type, ..Self::default() }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> MatchResult<()> {
        if !(self.ratio_thresh > 0.0 && self.ratio_thresh < 1.0) {
            return Err(invalid("ratio_thresh", format!("{} (must be in (0, 1))", self.ratio_thresh)));
        }
        self.flann.validate()?;
        self.lightglue.validate()
    }

    /// Generate human-readable summary
    pub fn summary(&self) -> String {
        let mut s = format!(
            "matcher={}, cross_check={}, ratio={}, max_matches={}",
            self.matcher_type.config_name(),
            self.cross_check,
            self.ratio_thresh,
            self.max_matches
        );
        match self.matcher_type {
            MatcherType::Flann => {
                let f = &self.flann;
                s.push_str(&format!(
                    ", flann(algorithm={}, advanced={}, trees={}, checks={}, tables={}, key={}, probe={})",
                    f.algorithm.name(),
                    f.use_advanced_control,
                    f.trees,
                    f.checks,
                    f.table_number,
                    f.key_size,
                    f.multi_probe_level
                ));
            }
            MatcherType::LightGlue => {
                let l = &self.lightglue;
                s.push_str(&format!(
                    ", lightglue(features={}, max_keypoints={}, filter={})",
                    l.feature_type.script_name(),
                    l.max_num_keypoints,
                    l.filter_threshold
                ));
            }
            _ => {}
        }
        s
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

fn invalid(name: &'static str, reason: String) -> MatchError {
    MatchError::InvalidParameter { name, reason }
}
