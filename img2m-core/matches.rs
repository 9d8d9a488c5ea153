use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Correspondence between a query keypoint and a train keypoint
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

impl Match {
    pub fn new(query_idx: usize, train_idx: usize, distance: f32) -> Self {
        Self { query_idx, train_idx, distance }
    }

    /// Swap query and train roles
    pub fn reversed(&self) -> Self {
        Self {
            query_idx: self.train_idx,
            train_idx: self.query_idx,
            distance: self.distance,
        }
    }
}

/// Ordered view pair key, always `i < j`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ViewPair {
    i: u32,
    j: u32,
}

impl ViewPair {
    pub fn new(i: u32, j: u32) -> CoreResult<Self> {
        if i >= j {
            return Err(CoreError::InvalidViewPair { i, j });
        }
        Ok(Self { i, j })
    }

    /// Order two distinct view ids into a pair
    pub fn canonical(a: u32, b: u32) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { i: a, j: b }),
            std::cmp::Ordering::Greater => Some(Self { i: b, j: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn i(&self) -> u32 {
        self.i
    }

    pub fn j(&self) -> u32 {
        self.j
    }
}

/// Pairwise matches keyed by ordered view pair
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matches {
    pairs: BTreeMap<ViewPair, Vec<Match>>,
}

impl Matches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the matches of `pair`, returning the previous entry
    pub fn insert(&mut self, pair: ViewPair, matches: Vec<Match>) -> Option<Vec<Match>> {
        self.pairs.insert(pair, matches)
    }

    pub fn get(&self, pair: &ViewPair) -> Option<&Vec<Match>> {
        self.pairs.get(pair)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ViewPair, &Vec<Match>)> {
        self.pairs.iter()
    }

    pub fn total_matches(&self) -> usize {
        self.pairs.values().map(Vec::len).sum()
    }
}

impl FromIterator<(ViewPair, Vec<Match>)> for Matches {
    fn from_iter<I: IntoIterator<Item = (ViewPair, Vec<Match>)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pair_requires_ordering() {
        assert!(ViewPair::new(0, 1).is_ok());
        assert!(matches!(ViewPair::new(3, 3), Err(CoreError::InvalidViewPair { i: 3, j: 3 })));
        assert!(matches!(ViewPair::new(5, 2), Err(CoreError::InvalidViewPair { .. })));
    }

    #[test]
    fn test_container_iterates_in_key_order() {
        let mut matches = Matches::new();
        matches.insert(ViewPair::new(1, 2).unwrap(), vec![Match::new(0, 0, 1.0)]);
        matches.insert(ViewPair::new(0, 2).unwrap(), vec![Match::new(1, 3, 0.5), Match::new(2, 4, 0.7)]);
        matches.insert(ViewPair::new(0, 1).unwrap(), vec![]);

        let keys: Vec<(u32, u32)> = matches.iter().map(|(p, _)| (p.i(), p.j())).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (1, 2)]);
        assert_eq!(matches.total_matches(), 3);
    }

    proptest! {
        #[test]
        fn prop_canonical_pairs_are_ordered(a in 0u32..1000, b in 0u32..1000) {
            match ViewPair::canonical(a, b) {
                Some(pair) => {
                    prop_assert!(pair.i() < pair.j());
                    prop_assert_eq!(ViewPair::canonical(b, a), Some(pair));
                }
                None => prop_assert_eq!(a, b),
            }
        }
    }
}
