use crate::descriptors::DescriptorType;
use log::warn;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Feature detector families known to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum DetectorType {
    #[default]
    Sift,
    Orb,
    Surf,
    Brisk,
    Akaze,
    Kaze,
    Fast,
    Agast,
    SuperPoint,
}

impl DetectorType {
    pub const ALL: [DetectorType; 9] = [
        DetectorType::Sift,
        DetectorType::Orb,
        DetectorType::Surf,
        DetectorType::Brisk,
        DetectorType::Akaze,
        DetectorType::Kaze,
        DetectorType::Fast,
        DetectorType::Agast,
        DetectorType::SuperPoint,
    ];

    /// Case-insensitive lookup
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        Self::ALL.iter().copied().find(|d| d.name() == upper)
    }

    /// Case-insensitive lookup falling back to SIFT
    pub fn parse_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            warn!("Unknown detector type '{}', using SIFT", name);
            DetectorType::Sift
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DetectorType::Sift => "SIFT",
            DetectorType::Orb => "ORB",
            DetectorType::Surf => "SURF",
            DetectorType::Brisk => "BRISK",
            DetectorType::Akaze => "AKAZE",
            DetectorType::Kaze => "KAZE",
            DetectorType::Fast => "FAST",
            DetectorType::Agast => "AGAST",
            DetectorType::SuperPoint => "SUPERPOINT",
        }
    }

    /// Canonical descriptor element type produced by the family
    pub fn descriptor_type(&self) -> DescriptorType {
        match self {
            DetectorType::Sift | DetectorType::Surf | DetectorType::Kaze | DetectorType::SuperPoint => {
                DescriptorType::F32
            }
            DetectorType::Orb
            | DetectorType::Brisk
            | DetectorType::Akaze
            | DetectorType::Fast
            | DetectorType::Agast => DescriptorType::U8,
        }
    }
}

impl fmt::Display for DetectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(DetectorType::from_name("orb"), Some(DetectorType::Orb));
        assert_eq!(DetectorType::from_name(" SuperPoint "), Some(DetectorType::SuperPoint));
        assert_eq!(DetectorType::from_name("harris"), None);
    }

    #[test]
    fn test_unknown_falls_back_to_sift() {
        assert_eq!(DetectorType::parse_or_default("MSER"), DetectorType::Sift);
    }

    #[test]
    fn test_descriptor_families() {
        assert_eq!(DetectorType::Sift.descriptor_type(), DescriptorType::F32);
        assert_eq!(DetectorType::Akaze.descriptor_type(), DescriptorType::U8);
        assert_eq!(DetectorType::Agast.descriptor_type(), DescriptorType::U8);
        assert_eq!(DetectorType::Kaze.descriptor_type(), DescriptorType::F32);
    }
}
