use crate::akaze::AkazeExtractor;
use crate::brisk::BriskExtractor;
use crate::config::{DetectorConfig, SiftParams};
use crate::error::{FeatureError, FeatureResult};
use crate::fast::{AgastExtractor, FastExtractor};
use crate::kaze::KazeExtractor;
use crate::orb::OrbExtractor;
use crate::preprocessing;
use crate::rootsift;
use crate::sift::SiftExtractor;
use crate::superpoint::SuperPointExtractor;
use crate::surf::SurfExtractor;
use image::GrayImage;
use img2m_core::{DescriptorMatrix, DescriptorType, DetectorType, Keypoint};
use log::{debug, warn};

enum Kernel {
    Sift(SiftExtractor),
    Orb(OrbExtractor),
    Surf(SurfExtractor),
    Brisk(BriskExtractor),
    Akaze(AkazeExtractor),
    Kaze(KazeExtractor),
    Fast(FastExtractor),
    Agast(AgastExtractor),
    SuperPoint { bridge: SuperPointExtractor, fallback: SiftExtractor },
}

/// A validated detector configuration with its kernel built once and
/// reused for every image of a run.
pub struct FeatureExtractor {
    config: DetectorConfig,
    kernel: Kernel,
}

impl FeatureExtractor {
    pub fn new(config: DetectorConfig) -> FeatureResult<Self> {
        config.validate()?;
        let kernel = match &config {
            DetectorConfig::Sift(p) => Kernel::Sift(SiftExtractor::new(p.clone())?),
            DetectorConfig::Orb(p) => Kernel::Orb(OrbExtractor::new(p.clone())?),
            DetectorConfig::Surf(p) => Kernel::Surf(SurfExtractor::new(p.clone())?),
            DetectorConfig::Brisk(p) => Kernel::Brisk(BriskExtractor::new(p.clone())?),
            DetectorConfig::Akaze(p) => Kernel::Akaze(AkazeExtractor::new(p.clone())?),
            DetectorConfig::Kaze(p) => Kernel::Kaze(KazeExtractor::new(p.clone())?),
            DetectorConfig::Fast(p) => Kernel::Fast(FastExtractor::new(p.clone())?),
            DetectorConfig::Agast(p) => Kernel::Agast(AgastExtractor::new(p.clone())?),
            DetectorConfig::SuperPoint(p) => Kernel::SuperPoint {
                bridge: SuperPointExtractor::new(p.clone())?,
                fallback: SiftExtractor::new(SiftParams::default())?,
            },
        };
        Ok(Self { config, kernel })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn detector_type(&self) -> DetectorType {
        self.config.detector_type()
    }

    pub fn descriptor_type(&self) -> DescriptorType {
        self.detector_type().descriptor_type()
    }

    /// Whether descriptors can be recomputed on existing keypoints
    pub fn supports_compute(&self) -> bool {
        matches!(self.kernel, Kernel::Sift(_) | Kernel::Orb(_) | Kernel::Fast(_) | Kernel::Agast(_))
    }

    /// Detect and describe. Keypoints are in the frame of `img` and the
    /// descriptors are in the canonical element type of the detector.
    pub fn extract(&self, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, DescriptorMatrix)> {
        let (keypoints, descriptors) = match &self.kernel {
            Kernel::Sift(sift) => extract_sift(sift, img)?,
            Kernel::Orb(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Surf(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Brisk(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Akaze(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Kaze(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Fast(k) => wrap(k.detect_and_compute(img)?),
            Kernel::Agast(k) => wrap(k.detect_and_compute(img)?),
            Kernel::SuperPoint { bridge, fallback } => match bridge.detect_and_compute(img) {
                Ok(result) => wrap(result),
                Err(e) => {
                    warn!("SuperPoint extraction failed ({}), falling back to SIFT", e);
                    extract_sift(fallback, img)?
                }
            },
        };
        debug!("{}: {} keypoints", self.detector_type().name(), keypoints.len());
        Ok((keypoints, descriptors.coerce(self.descriptor_type())))
    }

    /// Recompute descriptors for keypoints given in the frame of `img`,
    /// without re-detecting.
    pub fn compute(&self, img: &GrayImage, keypoints: &[Keypoint]) -> FeatureResult<DescriptorMatrix> {
        let descriptors: DescriptorMatrix = match &self.kernel {
            Kernel::Sift(sift) => {
                let params = sift.params();
                let (scaled, scale) = preprocessing::apply_first_octave(img, params.first_octave)?;
                let frame = preprocessing::to_scaled_frame(keypoints, scale);
                let mut descriptors = sift.compute(&scaled, &frame)?;
                if params.root_sift {
                    rootsift::root_sift(&mut descriptors);
                }
                descriptors.into()
            }
            Kernel::Orb(k) => k.compute(img, keypoints)?.into(),
            Kernel::Fast(k) => k.compute(img, keypoints)?.into(),
            Kernel::Agast(k) => k.compute(img, keypoints)?.into(),
            _ => return Err(FeatureError::ComputeUnsupported(self.detector_type().name().to_string())),
        };
        Ok(descriptors.coerce(self.descriptor_type()))
    }
}

fn wrap<D: Into<DescriptorMatrix>>((keypoints, descriptors): (Vec<Keypoint>, D)) -> (Vec<Keypoint>, DescriptorMatrix) {
    (keypoints, descriptors.into())
}

/// Rescale for `first_octave`, detect, map keypoints back and apply RootSIFT
fn extract_sift(sift: &SiftExtractor, img: &GrayImage) -> FeatureResult<(Vec<Keypoint>, DescriptorMatrix)> {
    let params = sift.params();
    let (scaled, scale) = preprocessing::apply_first_octave(img, params.first_octave)?;
    let (mut keypoints, mut descriptors) = sift.detect_and_compute(&scaled)?;
    preprocessing::restore_keypoints(&mut keypoints, scale);
    if params.root_sift {
        rootsift::root_sift(&mut descriptors);
    }
    Ok((keypoints, descriptors.into()))
}
