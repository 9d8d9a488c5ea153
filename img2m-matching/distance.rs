//! Distance kernels shared by the matchers.

/// Euclidean distance
#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    l2_squared(a, b).sqrt()
}

#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Manhattan distance
#[inline]
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// Number of differing bits between two byte strings
#[inline]
pub fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Number of differing bits between two packed bit vectors
#[inline]
pub fn hamming_words(a: &[u64], b: &[u64]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        assert_eq!(l2(&[0.0, 3.0], &[4.0, 0.0]), 5.0);
        assert_eq!(l1(&[1.0, -1.0], &[0.0, 1.0]), 3.0);
        assert_eq!(hamming(&[0b1010_1010, 0xFF], &[0b0101_0101, 0xFF]), 8);
        assert_eq!(hamming_words(&[u64::MAX, 0], &[0, 1]), 65);
    }
}
