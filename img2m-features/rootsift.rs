use img2m_core::Descriptors;
use rayon::prelude::*;

/// Floor applied to both norms
const NORM_EPS: f32 = 1e-12;

/// RootSIFT on one descriptor: L1-normalize, element-wise sqrt, L2-normalize
pub fn root_sift_row(row: &mut [f32]) {
    let l1: f32 = row.iter().map(|v| v.abs()).sum::<f32>().max(NORM_EPS);
    for v in row.iter_mut() {
        *v = (*v / l1).max(0.0).sqrt();
    }
    let l2 = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
    for v in row.iter_mut() {
        *v /= l2;
    }
}

/// Apply RootSIFT to every row in place
pub fn root_sift(descriptors: &mut Descriptors<f32>) {
    let cols = descriptors.cols();
    if cols == 0 {
        return;
    }
    descriptors
        .as_mut_slice()
        .par_chunks_mut(cols)
        .for_each(root_sift_row);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_row_stays_finite() {
        let mut row = vec![0.0f32; 128];
        root_sift_row(&mut row);
        assert!(row.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_matrix_rows_normalized() {
        let data: Vec<f32> = (0..256).map(|i| (i % 17) as f32).collect();
        let mut d = Descriptors::from_vec(2, 128, data).unwrap();
        root_sift(&mut d);
        for row in d.iter_rows() {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    proptest! {
        #[test]
        fn prop_root_sift_unit_l2(values in prop::collection::vec(0u8..=255, 128)) {
            prop_assume!(values.iter().any(|&v| v > 0));
            let mut row: Vec<f32> = values.iter().map(|&v| f32::from(v)).collect();
            root_sift_row(&mut row);
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            prop_assert!((norm - 1.0).abs() < 1e-4);
            prop_assert!(row.iter().all(|v| *v >= 0.0));
        }
    }
}
