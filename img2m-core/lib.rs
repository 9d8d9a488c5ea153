//! Shared data model for the image-to-matches stage: keypoints, descriptor
//! matrices, per-view feature records, pairwise matches and view ordering.

pub mod descriptors;
pub mod detector;
pub mod error;
pub mod features;
pub mod matches;
pub mod progress;
pub mod views;

pub use descriptors::{DescriptorMatrix, DescriptorType, Descriptors};
pub use detector::DetectorType;
pub use error::{CoreError, CoreResult};
pub use features::{FeaturePoints, FeatureRecord, Features, Keypoint};
pub use matches::{Match, Matches, ViewPair};
pub use progress::{ProgressTracker, render_bar};
pub use views::{ImageRecord, ViewEntry, assign_view_ids, collect_image_records, leading_number};

/// Largest worker count a run may request
pub const MAX_THREADS: usize = 64;

/// Default worker count, bounded by the available cores
pub fn default_thread_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

/// Build a dedicated Rayon pool with exactly `n_threads` workers
pub fn build_thread_pool(n_threads: usize) -> CoreResult<rayon::ThreadPool> {
    if n_threads == 0 || n_threads > MAX_THREADS {
        return Err(CoreError::InvalidThreadCount(n_threads));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("img2m-worker-{}", i))
        .build()
        .map_err(|e| CoreError::ThreadPool(e.to_string()))
}
