//! Bounded top-N selection over scored candidates.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::ItemId;

/// Number of recommendations returned when the caller does not choose one.
pub const DEFAULT_TOP_N: usize = 10;

/// An item together with its predicted score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    /// The raw item identifier.
    pub item_id: ItemId,
    /// Predicted rating.
    pub score: f32,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    position: usize,
    item: RankedItem,
}

impl Candidate {
    fn key(&self) -> f32 {
        // Adding zero folds -0.0 into 0.0 so the two compare as a tie.
        self.item.score + 0.0
    }
}

/// Greater is better: higher score first, then earlier position.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key()
            .total_cmp(&other.key())
            .then_with(|| other.position.cmp(&self.position))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Select the `k` highest-scoring items, in descending score order.
///
/// Items with equal scores keep their relative input order. Uses a
/// bounded min-heap, so the cost is `O(n log k)` for `n` candidates.
/// Returns everything, sorted, when there are at most `k` candidates, and
/// nothing when `k` is zero.
pub fn top_k<I>(scored: I, k: usize) -> Vec<RankedItem>
where
    I: IntoIterator<Item = RankedItem>,
{
    let scored = scored.into_iter();

    if k == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<Reverse<Candidate>> =
        BinaryHeap::with_capacity(k.min(scored.size_hint().0));

    for (position, item) in scored.enumerate() {
        let candidate = Candidate { position, item };

        if heap.len() < k {
            heap.push(Reverse(candidate));
        } else if let Some(mut worst) = heap.peek_mut() {
            if candidate > worst.0 {
                *worst = Reverse(candidate);
            }
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(candidate)| candidate.item)
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn items(scores: &[f32]) -> Vec<RankedItem> {
        scores
            .iter()
            .enumerate()
            .map(|(idx, &score)| RankedItem {
                item_id: idx as ItemId,
                score,
            })
            .collect()
    }

    fn ids(ranked: &[RankedItem]) -> Vec<ItemId> {
        ranked.iter().map(|item| item.item_id).collect()
    }

    #[test]
    fn descending_order() {
        let ranked = top_k(items(&[1.0, 3.0, 2.0, 5.0, 4.0]), 3);

        assert_eq!(ids(&ranked), vec![3, 4, 1]);
        assert_eq!(ranked[0].score, 5.0);
    }

    #[test]
    fn ties_keep_input_order() {
        let ranked = top_k(items(&[2.0, 3.0, 2.0, 3.0, 2.0]), 4);

        assert_eq!(ids(&ranked), vec![1, 3, 0, 2]);
    }

    #[test]
    fn signed_zeros_tie() {
        let ranked = top_k(items(&[-0.0, 0.0, -0.0]), 3);

        assert_eq!(ids(&ranked), vec![0, 1, 2]);
    }

    #[test]
    fn fewer_candidates_than_k() {
        let ranked = top_k(items(&[1.0, 2.0]), 10);

        assert_eq!(ids(&ranked), vec![1, 0]);
    }

    #[test]
    fn zero_k() {
        assert!(top_k(items(&[1.0, 2.0]), 0).is_empty());
        assert!(top_k(Vec::new(), 5).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn matches_stable_sort(
            scores in prop::collection::vec(0u8..6, 0..60),
            k in 1usize..80,
        ) {
            let candidates = items(
                &scores.iter().map(|&score| f32::from(score) * 0.5).collect::<Vec<_>>(),
            );

            let mut expected = candidates.clone();
            expected.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            expected.truncate(k);

            let ranked = top_k(candidates.clone(), k);

            prop_assert_eq!(&ranked, &expected);
            prop_assert_eq!(&ranked, &top_k(candidates, k));
        }
    }
}
