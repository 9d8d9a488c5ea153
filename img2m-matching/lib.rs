//! Descriptor matching for the image-to-matches stage.
//!
//! [`MatcherDispatcher`] picks the configured backend, downgrading it when
//! the descriptor element type is not supported:
//!
//! - cascade hashing (`f32` only), see [`cascade`]
//! - FLANN-style KD-forest, k-means, composite, linear and LSH indices, see [`flann`]
//! - brute force under L2, L1 or Hamming distance, see [`brute_force`]
//! - LightGlue through an external script, see [`lightglue`]

pub mod brute_force;
pub mod cascade;
pub mod config;
pub mod dispatcher;
pub mod distance;
pub mod error;
pub mod filter;
pub mod flann;
pub mod knn;
pub mod lightglue;

pub use brute_force::{BruteForceMatcher, Norm};
pub use cascade::{CascadeHasher, CascadeHashingMatcher};
pub use config::{
    FlannAlgorithm, FlannCentersInit, FlannParams, FlannPreset, LightGlueFeatureType, LightGlueParams, MatcherConfig,
    MatcherType,
};
pub use dispatcher::MatcherDispatcher;
pub use error::{MatchError, MatchResult};
pub use flann::FlannMatcher;
pub use knn::KnnMatcher;
pub use lightglue::{LightGlueMatcher, ViewData};
