use crate::error::{CoreError, CoreResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Detected keypoint in original-image pixel coordinates.
///
/// `angle` is in degrees, `size` is the diameter of the meaningful neighbourhood.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub angle: f32,
    pub response: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, size: f32, angle: f32, response: f32) -> Self {
        Self { x, y, size, angle, response }
    }

    /// Multiply position and size by `factor`, keeping angle and response
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            size: self.size * factor,
            ..*self
        }
    }
}

/// Flattened per-keypoint attributes used by downstream SfM stages
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeaturePoints {
    pub coords: Vec<[f32; 2]>,
    pub sizes: Vec<f32>,
    pub angles: Vec<f32>,
    /// Empty when the colour image could not be read
    pub colors_rgb: Vec<[u8; 3]>,
}

impl FeaturePoints {
    pub fn from_keypoints(keypoints: &[Keypoint]) -> Self {
        Self {
            coords: keypoints.iter().map(|kp| [kp.x, kp.y]).collect(),
            sizes: keypoints.iter().map(|kp| kp.size).collect(),
            angles: keypoints.iter().map(|kp| kp.angle).collect(),
            colors_rgb: Vec::new(),
        }
    }

    pub fn with_colors(mut self, colors: Vec<[u8; 3]>) -> Self {
        self.colors_rgb = colors;
        self
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}

/// Features of a single view
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeatureRecord {
    pub image_path: String,
    pub keypoints: Vec<Keypoint>,
    pub points: FeaturePoints,
}

impl FeatureRecord {
    pub fn new(image_path: impl Into<String>, keypoints: Vec<Keypoint>, colors: Option<Vec<[u8; 3]>>) -> Self {
        let mut points = FeaturePoints::from_keypoints(&keypoints);
        if let Some(colors) = colors {
            points = points.with_colors(colors);
        }
        Self {
            image_path: image_path.into(),
            keypoints,
            points,
        }
    }

    /// A slot counts as filled once it carries an image path
    pub fn is_filled(&self) -> bool {
        !self.image_path.is_empty()
    }

    pub fn num_keypoints(&self) -> usize {
        self.keypoints.len()
    }
}

/// Pre-sized collection of feature records indexed by view id.
///
/// Slots are created up front and filled in place, so a reference to a slot
/// stays valid for the lifetime of the collection.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Features {
    slots: Vec<FeatureRecord>,
}

impl Features {
    pub fn with_len(num_views: usize) -> Self {
        Self {
            slots: vec![FeatureRecord::default(); num_views],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Move `record` into the slot of `view_id`
    pub fn fill(&mut self, view_id: usize, record: FeatureRecord) -> CoreResult<()> {
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(view_id)
            .ok_or(CoreError::ViewOutOfRange { view_id, len })?;
        *slot = record;
        Ok(())
    }

    pub fn get(&self, view_id: usize) -> Option<&FeatureRecord> {
        self.slots.get(view_id)
    }

    pub fn is_filled(&self, view_id: usize) -> bool {
        self.get(view_id).is_some_and(FeatureRecord::is_filled)
    }

    pub fn filled_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_filled()).count()
    }

    /// True when at least one slot carries keypoints
    pub fn has_keypoints(&self) -> bool {
        self.slots.iter().any(|s| !s.keypoints.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &FeatureRecord)> {
        self.slots.iter().enumerate()
    }

    /// Mutable slot access for lock-free parallel filling
    pub fn slots_mut(&mut self) -> &mut [FeatureRecord] {
        &mut self.slots
    }

    pub fn total_keypoints(&self) -> usize {
        self.slots.iter().map(FeatureRecord::num_keypoints).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_keypoints() -> Vec<Keypoint> {
        vec![
            Keypoint::new(10.0, 20.0, 3.0, 45.0, 0.5),
            Keypoint::new(30.5, 40.25, 6.0, 90.0, 0.25),
        ]
    }

    #[test]
    fn test_feature_points_mirror_keypoints() {
        let record = FeatureRecord::new("views/0001.jpg", create_test_keypoints(), None);
        assert_eq!(record.points.coords, vec![[10.0, 20.0], [30.5, 40.25]]);
        assert_eq!(record.points.sizes, vec![3.0, 6.0]);
        assert_eq!(record.points.angles, vec![45.0, 90.0]);
        assert!(record.points.colors_rgb.is_empty());
    }

    #[test]
    fn test_slot_fill_in_place() {
        let mut features = Features::with_len(3);
        assert_eq!(features.filled_count(), 0);

        let record = FeatureRecord::new("a/2.png", create_test_keypoints(), Some(vec![[1, 2, 3], [0, 0, 0]]));
        features.fill(2, record.clone()).unwrap();

        assert!(!features.is_filled(0));
        assert!(features.is_filled(2));
        assert_eq!(features.get(2), Some(&record));
        assert_eq!(features.len(), 3);
        assert_eq!(features.total_keypoints(), 2);
    }

    #[test]
    fn test_fill_out_of_range() {
        let mut features = Features::with_len(1);
        let result = features.fill(4, FeatureRecord::default());
        assert!(matches!(result, Err(CoreError::ViewOutOfRange { view_id: 4, len: 1 })));
    }

    #[test]
    fn test_keypoint_scaling() {
        let kp = Keypoint::new(8.0, 4.0, 2.0, 30.0, 1.0).scaled(0.5);
        assert_eq!(kp, Keypoint::new(4.0, 2.0, 1.0, 30.0, 1.0));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_features_json_is_slot_array() {
        let mut features = Features::with_len(2);
        features
            .fill(1, FeatureRecord::new("a/2.png", create_test_keypoints(), Some(vec![[9, 8, 7], [0, 0, 255]])))
            .unwrap();

        let json = serde_json::to_value(&features).unwrap();
        let slots = json.as_array().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1]["image_path"], "a/2.png");

        let restored: Features = serde_json::from_value(json).unwrap();
        assert_eq!(restored, features);
    }
}
