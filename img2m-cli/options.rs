//! Configuration documents and their mapping into typed pipeline options.
//!
//! A document is a TOML file with a main `[img2matches]` section and
//! optional per-method sections (`[SIFT]`, `[ORB]`, ..., `[FLANN]`,
//! `[LIGHTGLUE]`). Every value is flattened to a string first, so a method
//! sees the main options overlaid with its own section.

use crate::error::{PipelineError, PipelineResult};
use img2m_core::{DetectorType, MAX_THREADS};
use img2m_features::{
    AgastParams, AgastType, AkazeParams, BriskParams, DetectorConfig, FastParams, KazeParams, OrbParams,
    OrbScoreType, SiftParams, SiftPreset, SuperPointParams, SurfParams,
};
use img2m_matching::{
    FlannAlgorithm, FlannCentersInit, FlannParams, FlannPreset, LightGlueFeatureType, LightGlueParams, MatcherConfig,
    MatcherType,
};
use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const MAIN_SECTION: &str = "img2matches";
pub const FLANN_SECTION: &str = "FLANN";
pub const LIGHTGLUE_SECTION: &str = "LIGHTGLUE";

pub type OptionMap = BTreeMap<String, String>;

/// Flattened configuration: main options plus named method sections
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    pub main: OptionMap,
    /// Keyed by upper-case section name
    pub sections: BTreeMap<String, OptionMap>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> PipelineResult<Self> {
        let table: toml::Table = text.parse()?;
        let mut doc = Self::default();
        for (key, value) in table {
            match value {
                toml::Value::Table(section) => {
                    let target = if key.eq_ignore_ascii_case(MAIN_SECTION) {
                        &mut doc.main
                    } else {
                        doc.sections.entry(key.to_ascii_uppercase()).or_default()
                    };
                    for (k, v) in section {
                        let text = scalar_text(&k, v)?;
                        target.insert(k, text);
                    }
                }
                other => {
                    let text = scalar_text(&key, other)?;
                    doc.main.insert(key, text);
                }
            }
        }
        Ok(doc)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Override a main option
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.main.insert(key.into(), value.into());
    }

    pub fn set_in(&mut self, section: &str, key: impl Into<String>, value: impl Into<String>) {
        self.sections
            .entry(section.to_ascii_uppercase())
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Main options overlaid with the keys of `section`
    pub fn method_options(&self, section: &str) -> OptionMap {
        let mut options = self.main.clone();
        if let Some(keys) = self.sections.get(&section.to_ascii_uppercase()) {
            options.extend(keys.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        options
    }

    pub fn to_toml_string(&self) -> PipelineResult<String> {
        let mut table = toml::Table::new();
        table.insert(MAIN_SECTION.to_string(), string_table(&self.main));
        for (name, keys) in &self.sections {
            table.insert(name.clone(), string_table(keys));
        }
        toml::to_string(&table).map_err(|e| PipelineError::config("document", e.to_string()))
    }
}

fn string_table(options: &OptionMap) -> toml::Value {
    toml::Value::Table(
        options
            .iter()
            .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
            .collect(),
    )
}

fn scalar_text(key: &str, value: toml::Value) -> PipelineResult<String> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => Err(PipelineError::config(key, "nested values are not supported")),
    }
}

/// `true/false`, `ON/OFF`, `1/0` and `yes/no`, case-insensitive
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Some(true),
        "false" | "off" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Typed lookups with defaults over one flattened option map
struct OptionReader<'a> {
    options: &'a OptionMap,
}

impl<'a> OptionReader<'a> {
    fn new(options: &'a OptionMap) -> Self {
        Self { options }
    }

    fn text(&self, key: &str, default: &str) -> String {
        self.options.get(key).map_or_else(|| default.to_string(), |v| v.trim().to_string())
    }

    fn get<T>(&self, key: &str, default: T) -> PipelineResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.options.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| PipelineError::config(key, format!("'{}': {}", raw, e))),
        }
    }

    fn flag(&self, key: &str, default: bool) -> PipelineResult<bool> {
        match self.options.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| PipelineError::config(key, format!("'{}' is not a boolean", raw))),
        }
    }

    fn named<T>(&self, key: &str, default: T, parse: impl Fn(&str) -> Option<T>) -> PipelineResult<T> {
        match self.options.get(key) {
            None => Ok(default),
            Some(raw) => parse(raw).ok_or_else(|| PipelineError::config(key, format!("unknown value '{}'", raw))),
        }
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Fast,
    Viewer,
}

impl RunMode {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fast" => RunMode::Fast,
            "viewer" => RunMode::Viewer,
            other => {
                warn!("Unknown run mode '{}', using fast", other);
                RunMode::Fast
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Fast => "fast",
            RunMode::Viewer => "viewer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub export_features: bool,
    pub export_fea_path: PathBuf,
    pub export_matches: bool,
    pub export_match_path: PathBuf,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            export_features: false,
            export_fea_path: PathBuf::from("storage/features"),
            export_matches: false,
            export_match_path: PathBuf::from("storage/matches"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerOptions {
    pub show_view_pair_i: u32,
    pub show_view_pair_j: u32,
    /// 0 draws opaque match lines, 1 hides them
    pub line_transparency: f32,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            show_view_pair_i: 0,
            show_view_pair_j: 1,
            line_transparency: 0.5,
        }
    }
}

/// Everything a run needs, in typed form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub run_mode: RunMode,
    pub num_threads: usize,
    /// 0 error, 1 warn, 2 info, 3 debug
    pub log_level: u8,
    pub detector: DetectorConfig,
    pub matcher: MatcherConfig,
    pub export: ExportOptions,
    pub viewer: ViewerOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Fast,
            num_threads: 4,
            log_level: 2,
            detector: DetectorConfig::default(),
            matcher: MatcherConfig::default(),
            export: ExportOptions::default(),
            viewer: ViewerOptions::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_document(doc: &ConfigDocument) -> PipelineResult<Self> {
        let main = OptionReader::new(&doc.main);
        let detector_type = DetectorType::parse_or_default(&main.text("detector_type", "SIFT"));
        let detector_options = doc.method_options(detector_type.name());
        let detector = detector_from_options(detector_type, &OptionReader::new(&detector_options))?;

        let defaults = MatcherConfig::default();
        let flann_options = doc.method_options(FLANN_SECTION);
        let lightglue_options = doc.method_options(LIGHTGLUE_SECTION);
        let matcher = MatcherConfig {
            matcher_type: MatcherType::parse_or_default(&main.text("matcher_type", "FASTCASCADEHASHINGL2")),
            cross_check: main.flag("cross_check", defaults.cross_check)?,
            ratio_thresh: main.get("ratio_thresh", defaults.ratio_thresh)?,
            max_matches: main.get("max_matches", defaults.max_matches)?,
            flann: flann_from_options(&OptionReader::new(&flann_options))?,
            lightglue: lightglue_from_options(&OptionReader::new(&lightglue_options))?,
        };

        let export_defaults = ExportOptions::default();
        let export = ExportOptions {
            export_features: main.flag("export_features", false)?,
            export_fea_path: main.path("export_fea_path").unwrap_or(export_defaults.export_fea_path),
            export_matches: main.flag("export_matches", false)?,
            export_match_path: main.path("export_match_path").unwrap_or(export_defaults.export_match_path),
        };

        let viewer_defaults = ViewerOptions::default();
        let viewer = ViewerOptions {
            show_view_pair_i: main.get("show_view_pair_i", viewer_defaults.show_view_pair_i)?,
            show_view_pair_j: main.get("show_view_pair_j", viewer_defaults.show_view_pair_j)?,
            line_transparency: main.get("line_transparency", viewer_defaults.line_transparency)?,
        };

        Ok(Self {
            run_mode: RunMode::from_name(&main.text("run_mode", "fast")),
            num_threads: main.get("num_threads", 4)?,
            log_level: main.get("log_level", 2)?,
            detector,
            matcher,
            export,
            viewer,
        })
    }

    pub fn from_toml_str(text: &str) -> PipelineResult<Self> {
        Self::from_document(&ConfigDocument::parse(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        Self::from_document(&ConfigDocument::load(path)?)
    }

    /// Write the options back with the document key names
    pub fn to_document(&self) -> ConfigDocument {
        let mut doc = ConfigDocument::default();
        let m = &self.matcher;
        let e = &self.export;
        for (key, value) in [
            ("run_mode", self.run_mode.name().to_string()),
            ("detector_type", self.detector.detector_type().name().to_string()),
            ("matcher_type", m.matcher_type.config_name().to_string()),
            ("num_threads", self.num_threads.to_string()),
            ("log_level", self.log_level.to_string()),
            ("cross_check", m.cross_check.to_string()),
            ("ratio_thresh", m.ratio_thresh.to_string()),
            ("max_matches", m.max_matches.to_string()),
            ("export_features", on_off(e.export_features).to_string()),
            ("export_fea_path", e.export_fea_path.display().to_string()),
            ("export_matches", on_off(e.export_matches).to_string()),
            ("export_match_path", e.export_match_path.display().to_string()),
            ("show_view_pair_i", self.viewer.show_view_pair_i.to_string()),
            ("show_view_pair_j", self.viewer.show_view_pair_j.to_string()),
            ("line_transparency", self.viewer.line_transparency.to_string()),
        ] {
            doc.set(key, value);
        }

        let section = self.detector.detector_type().name();
        for (key, value) in detector_to_options(&self.detector) {
            doc.set_in(section, key, value);
        }
        for (key, value) in flann_to_options(&m.flann) {
            doc.set_in(FLANN_SECTION, key, value);
        }
        for (key, value) in lightglue_to_options(&m.lightglue) {
            doc.set_in(LIGHTGLUE_SECTION, key, value);
        }
        doc
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserialize from TOML string
    pub fn from_toml(toml_str: &str) -> PipelineResult<Self> {
        let options: Self = toml::from_str(toml_str)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks shared by every run mode
    pub fn validate(&self) -> PipelineResult<()> {
        if !(1..=MAX_THREADS).contains(&self.num_threads) {
            return Err(PipelineError::config(
                "num_threads",
                format!("{} (must be 1-{})", self.num_threads, MAX_THREADS),
            ));
        }
        let ratio = self.matcher.ratio_thresh;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(PipelineError::config("ratio_thresh", format!("{} (must be in (0, 1))", ratio)));
        }
        if self.log_level > 3 {
            return Err(PipelineError::config("log_level", format!("{} (must be 0-3)", self.log_level)));
        }
        if !(0.0..=1.0).contains(&self.viewer.line_transparency) {
            return Err(PipelineError::config(
                "line_transparency",
                format!("{} (must be in [0, 1])", self.viewer.line_transparency),
            ));
        }
        self.detector.validate()?;
        self.matcher.validate()?;
        Ok(())
    }

    pub fn log_filter(&self) -> LevelFilter {
        log_level_filter(self.log_level)
    }
}

pub fn log_level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}

fn detector_from_options(detector: DetectorType, r: &OptionReader<'_>) -> PipelineResult<DetectorConfig> {
    let config = match detector {
        DetectorType::Sift => {
            let d = SiftParams::default();
            let mut p = SiftParams {
                nfeatures: r.get("nfeatures", d.nfeatures)?,
                n_octave_layers: r.get("nOctaveLayers", d.n_octave_layers)?,
                contrast_threshold: r.get("contrastThreshold", d.contrast_threshold)?,
                edge_threshold: r.get("edgeThreshold", d.edge_threshold)?,
                sigma: r.get("sigma", d.sigma)?,
                enable_precise_upscale: r.flag("enable_precise_upscale", d.enable_precise_upscale)?,
                first_octave: r.get("first_octave", d.first_octave)?,
                num_octaves: r.get("num_octaves", d.num_octaves)?,
                root_sift: r.flag("root_sift", d.root_sift)?,
                preset: SiftPreset::from_name(&r.text("preset", "CUSTOM")),
            };
            p.apply_preset();
            DetectorConfig::Sift(p)
        }
        DetectorType::Orb => {
            let d = OrbParams::default();
            DetectorConfig::Orb(OrbParams {
                nfeatures: r.get("nfeatures", d.nfeatures)?,
                scale_factor: r.get("scaleFactor", d.scale_factor)?,
                nlevels: r.get("nlevels", d.nlevels)?,
                edge_threshold: r.get("edgeThreshold", d.edge_threshold)?,
                first_level: r.get("firstLevel", d.first_level)?,
                wta_k: r.get("WTA_K", d.wta_k)?,
                score_type: OrbScoreType::from_name(&r.text("scoreType", d.score_type.name())),
                patch_size: r.get("patchSize", d.patch_size)?,
                fast_threshold: r.get("fastThreshold", d.fast_threshold)?,
            })
        }
        DetectorType::Surf => {
            let d = SurfParams::default();
            DetectorConfig::Surf(SurfParams {
                hessian_threshold: r.get("hessianThreshold", d.hessian_threshold)?,
                n_octaves: r.get("nOctaves", d.n_octaves)?,
                n_octave_layers: r.get("nOctaveLayers", d.n_octave_layers)?,
                extended: r.flag("extended", d.extended)?,
                upright: r.flag("upright", d.upright)?,
            })
        }
        DetectorType::Brisk => {
            let d = BriskParams::default();
            DetectorConfig::Brisk(BriskParams {
                thresh: r.get("thresh", d.thresh)?,
                octaves: r.get("octaves", d.octaves)?,
                pattern_scale: r.get("patternScale", d.pattern_scale)?,
            })
        }
        DetectorType::Akaze => {
            let d = AkazeParams::default();
            DetectorConfig::Akaze(AkazeParams {
                threshold: r.get("threshold", d.threshold)?,
                n_octaves: r.get("nOctaves", d.n_octaves)?,
                n_octave_layers: r.get("nOctaveLayers", d.n_octave_layers)?,
                descriptor_channels: r.get("descriptor_channels", d.descriptor_channels)?,
            })
        }
        DetectorType::Kaze => {
            let d = KazeParams::default();
            DetectorConfig::Kaze(KazeParams {
                threshold: r.get("threshold", d.threshold)?,
                n_octaves: r.get("nOctaves", d.n_octaves)?,
                n_octave_layers: r.get("nOctaveLayers", d.n_octave_layers)?,
                extended: r.flag("extended", d.extended)?,
                upright: r.flag("upright", d.upright)?,
            })
        }
        DetectorType::Fast => {
            let d = FastParams::default();
            DetectorConfig::Fast(FastParams {
                threshold: r.get("threshold", d.threshold)?,
                nonmax_suppression: r.flag("nonmaxSuppression", d.nonmax_suppression)?,
            })
        }
        DetectorType::Agast => {
            let d = AgastParams::default();
            DetectorConfig::Agast(AgastParams {
                threshold: r.get("threshold", d.threshold)?,
                nonmax_suppression: r.flag("nonmaxSuppression", d.nonmax_suppression)?,
                agast_type: AgastType::from_name(&r.text("type", d.agast_type.name())),
            })
        }
        DetectorType::SuperPoint => {
            let d = SuperPointParams::default();
            DetectorConfig::SuperPoint(SuperPointParams {
                max_keypoints: r.get("max_keypoints", d.max_keypoints)?,
                detection_threshold: r.get("detection_threshold", d.detection_threshold)?,
                nms_radius: r.get("nms_radius", d.nms_radius)?,
                remove_borders: r.get("remove_borders", d.remove_borders)?,
                python_executable: r.text("python_executable", &d.python_executable),
                script_path: r.path("script_path"),
            })
        }
    };
    Ok(config)
}

fn detector_to_options(config: &DetectorConfig) -> Vec<(&'static str, String)> {
    match config {
        DetectorConfig::Sift(p) => vec![
            ("preset", p.preset.name().to_string()),
            ("nfeatures", p.nfeatures.to_string()),
            ("nOctaveLayers", p.n_octave_layers.to_string()),
            ("contrastThreshold", p.contrast_threshold.to_string()),
            ("edgeThreshold", p.edge_threshold.to_string()),
            ("sigma", p.sigma.to_string()),
            ("enable_precise_upscale", p.enable_precise_upscale.to_string()),
            ("first_octave", p.first_octave.to_string()),
            ("num_octaves", p.num_octaves.to_string()),
            ("root_sift", p.root_sift.to_string()),
        ],
        DetectorConfig::Orb(p) => vec![
            ("nfeatures", p.nfeatures.to_string()),
            ("scaleFactor", p.scale_factor.to_string()),
            ("nlevels", p.nlevels.to_string()),
            ("edgeThreshold", p.edge_threshold.to_string()),
            ("firstLevel", p.first_level.to_string()),
            ("WTA_K", p.wta_k.to_string()),
            ("scoreType", p.score_type.name().to_string()),
            ("patchSize", p.patch_size.to_string()),
            ("fastThreshold", p.fast_threshold.to_string()),
        ],
        DetectorConfig::Surf(p) => vec![
            ("hessianThreshold", p.hessian_threshold.to_string()),
            ("nOctaves", p.n_octaves.to_string()),
            ("nOctaveLayers", p.n_octave_layers.to_string()),
            ("extended", p.extended.to_string()),
            ("upright", p.upright.to_string()),
        ],
        DetectorConfig::Brisk(p) => vec![
            ("thresh", p.thresh.to_string()),
            ("octaves", p.octaves.to_string()),
            ("patternScale", p.pattern_scale.to_string()),
        ],
        DetectorConfig::Akaze(p) => vec![
            ("threshold", p.threshold.to_string()),
            ("nOctaves", p.n_octaves.to_string()),
            ("nOctaveLayers", p.n_octave_layers.to_string()),
            ("descriptor_channels", p.descriptor_channels.to_string()),
        ],
        DetectorConfig::Kaze(p) => vec![
            ("threshold", p.threshold.to_string()),
            ("nOctaves", p.n_octaves.to_string()),
            ("nOctaveLayers", p.n_octave_layers.to_string()),
            ("extended", p.extended.to_string()),
            ("upright", p.upright.to_string()),
        ],
        DetectorConfig::Fast(p) => vec![
            ("threshold", p.threshold.to_string()),
            ("nonmaxSuppression", p.nonmax_suppression.to_string()),
        ],
        DetectorConfig::Agast(p) => vec![
            ("threshold", p.threshold.to_string()),
            ("nonmaxSuppression", p.nonmax_suppression.to_string()),
            ("type", p.agast_type.name().to_string()),
        ],
        DetectorConfig::SuperPoint(p) => {
            let mut options = vec![
                ("max_keypoints", p.max_keypoints.to_string()),
                ("detection_threshold", p.detection_threshold.to_string()),
                ("nms_radius", p.nms_radius.to_string()),
                ("remove_borders", p.remove_borders.to_string()),
                ("python_executable", p.python_executable.clone()),
            ];
            if let Some(script) = &p.script_path {
                options.push(("script_path", script.display().to_string()));
            }
            options
        }
    }
}

fn flann_from_options(r: &OptionReader<'_>) -> PipelineResult<FlannParams> {
    let d = FlannParams::default();
    let mut p = FlannParams {
        use_advanced_control: r.flag("use_advanced_control", d.use_advanced_control)?,
        algorithm: r.named("algorithm", d.algorithm, FlannAlgorithm::from_name)?,
        trees: r.get("trees", d.trees)?,
        table_number: r.get("table_number", d.table_number)?,
        key_size: r.get("key_size", d.key_size)?,
        multi_probe_level: r.get("multi_probe_level", d.multi_probe_level)?,
        branching: r.get("branching", d.branching)?,
        iterations: r.get("iterations", d.iterations)?,
        centers_init: r.named("centers_init", d.centers_init, FlannCentersInit::from_name)?,
        checks: r.get("checks", d.checks)?,
        eps: r.get("eps", d.eps)?,
        sorted: r.flag("sorted", d.sorted)?,
        max_neighbors: r.get("max_neighbors", d.max_neighbors)?,
        preset: r.named("preset", d.preset, FlannPreset::from_name)?,
    };
    p.apply_preset();
    Ok(p)
}

fn flann_to_options(p: &FlannParams) -> Vec<(&'static str, String)> {
    vec![
        ("use_advanced_control", p.use_advanced_control.to_string()),
        ("algorithm", p.algorithm.name().to_string()),
        ("trees", p.trees.to_string()),
        ("table_number", p.table_number.to_string()),
        ("key_size", p.key_size.to_string()),
        ("multi_probe_level", p.multi_probe_level.to_string()),
        ("branching", p.branching.to_string()),
        ("iterations", p.iterations.to_string()),
        ("centers_init", p.centers_init.name().to_string()),
        ("checks", p.checks.to_string()),
        ("eps", p.eps.to_string()),
        ("sorted", p.sorted.to_string()),
        ("max_neighbors", p.max_neighbors.to_string()),
        ("preset", p.preset.name().to_string()),
    ]
}

fn lightglue_from_options(r: &OptionReader<'_>) -> PipelineResult<LightGlueParams> {
    let d = LightGlueParams::default();
    Ok(LightGlueParams {
        feature_type: r.named("feature_type", d.feature_type, LightGlueFeatureType::from_name)?,
        max_num_keypoints: r.get("max_num_keypoints", d.max_num_keypoints)?,
        depth_confidence: r.get("depth_confidence", d.depth_confidence)?,
        width_confidence: r.get("width_confidence", d.width_confidence)?,
        filter_threshold: r.get("filter_threshold", d.filter_threshold)?,
        flash_attention: r.flag("flash_attention", d.flash_attention)?,
        mixed_precision: r.flag("mixed_precision", d.mixed_precision)?,
        compile_model: r.flag("compile_model", d.compile_model)?,
        python_executable: r.text("python_executable", &d.python_executable),
        script_path: r.path("script_path"),
    })
}

fn lightglue_to_options(p: &LightGlueParams) -> Vec<(&'static str, String)> {
    let mut options = vec![
        ("feature_type", p.feature_type.name().to_string()),
        ("max_num_keypoints", p.max_num_keypoints.to_string()),
        ("depth_confidence", p.depth_confidence.to_string()),
        ("width_confidence", p.width_confidence.to_string()),
        ("filter_threshold", p.filter_threshold.to_string()),
        ("flash_attention", p.flash_attention.to_string()),
        ("mixed_precision", p.mixed_precision.to_string()),
        ("compile_model", p.compile_model.to_string()),
        ("python_executable", p.python_executable.clone()),
    ];
    if let Some(script) = &p.script_path {
        options.push(("script_path", script.display().to_string()));
    }
    options
}
