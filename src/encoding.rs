//! Mapping between sparse raw identifiers and dense matrix indices.
//!
//! Indices are assigned in first-seen order over the training ratings and
//! are contiguous from zero. An identifier that never appeared in training
//! has no index: lookups return `None` rather than a default index, and it
//! is up to the caller to decide how to treat the cold-start case.
use std::collections::HashMap;

use crate::data::{Rating, Ratings, TripletRatings};

/// The identifier spaces that are encoded independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdSpace {
    /// User identifiers.
    User,
    /// Item identifiers.
    Item,
}

/// Bidirectional mapping between raw identifiers and dense indices for a
/// single identifier space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodingTable {
    indices: HashMap<u64, usize>,
    raw_ids: Vec<u64>,
}

impl EncodingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        EncodingTable::default()
    }

    /// Return the index of `raw_id`, assigning the next unused index if
    /// it has not been seen before.
    pub fn encode(&mut self, raw_id: u64) -> usize {
        let raw_ids = &mut self.raw_ids;

        *self.indices.entry(raw_id).or_insert_with(|| {
            raw_ids.push(raw_id);
            raw_ids.len() - 1
        })
    }

    /// The index of `raw_id`, or `None` for an identifier never encoded.
    pub fn lookup(&self, raw_id: u64) -> Option<usize> {
        self.indices.get(&raw_id).cloned()
    }

    /// The raw identifier behind `index`.
    pub fn decode(&self, index: usize) -> Option<u64> {
        self.raw_ids.get(index).cloned()
    }

    /// Raw identifiers ordered by index.
    pub fn raw_ids(&self) -> &[u64] {
        &self.raw_ids
    }

    /// Number of encoded identifiers.
    pub fn len(&self) -> usize {
        self.raw_ids.len()
    }

    /// Whether nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.raw_ids.is_empty()
    }
}

/// User and item encoding tables built from one training set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Encoder {
    users: EncodingTable,
    items: EncodingTable,
}

impl Encoder {
    /// Build both tables from the ordered training ratings, returning the
    /// encoder together with the encoded training triples.
    pub fn fit(ratings: &Ratings) -> (Self, TripletRatings) {
        let mut encoder = Encoder::default();
        let mut triplets = TripletRatings::new(0, 0);

        for rating in ratings {
            let user = encoder.encode(IdSpace::User, rating.user_id());
            let item = encoder.encode(IdSpace::Item, rating.item_id());

            triplets.push(user, item, rating.rating());
        }

        (encoder, triplets)
    }

    /// Encode `raw_id` in `space`, assigning a new index if needed.
    pub fn encode(&mut self, space: IdSpace, raw_id: u64) -> usize {
        match space {
            IdSpace::User => self.users.encode(raw_id),
            IdSpace::Item => self.items.encode(raw_id),
        }
    }

    /// The index of `raw_id` in `space`, or `None` if it is cold-start.
    pub fn lookup(&self, space: IdSpace, raw_id: u64) -> Option<usize> {
        self.table(space).lookup(raw_id)
    }

    /// The raw identifier behind `index` in `space`.
    pub fn decode(&self, space: IdSpace, index: usize) -> Option<u64> {
        self.table(space).decode(index)
    }

    /// The table for `space`.
    pub fn table(&self, space: IdSpace) -> &EncodingTable {
        match space {
            IdSpace::User => &self.users,
            IdSpace::Item => &self.items,
        }
    }

    /// Number of encoded users.
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Number of encoded items.
    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Encode held-out ratings without assigning new indices.
    ///
    /// Returns the triples whose user and item are both known, with the
    /// encoder's dimensions, and the ratings that were left out because
    /// their user or item is cold-start.
    pub fn encode_known(&self, ratings: &Ratings) -> (TripletRatings, Vec<Rating>) {
        let mut triplets = TripletRatings::new(self.num_users(), self.num_items());
        let mut cold_start = Vec::new();

        for rating in ratings {
            match (
                self.users.lookup(rating.user_id()),
                self.items.lookup(rating.item_id()),
            ) {
                (Some(user), Some(item)) => triplets.push(user, item, rating.rating()),
                _ => cold_start.push(*rating),
            }
        }

        (triplets, cold_start)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_seen_order() {
        let ratings = Ratings::from(vec![
            Rating::new(1, 1, 5.0),
            Rating::new(1, 2, 1.0),
            Rating::new(2, 1, 4.0),
        ]);

        let (encoder, triplets) = Encoder::fit(&ratings);

        assert_eq!(encoder.lookup(IdSpace::User, 1), Some(0));
        assert_eq!(encoder.lookup(IdSpace::User, 2), Some(1));
        assert_eq!(encoder.lookup(IdSpace::Item, 1), Some(0));
        assert_eq!(encoder.lookup(IdSpace::Item, 2), Some(1));

        assert_eq!(triplets.user_ids(), &[0, 0, 1]);
        assert_eq!(triplets.item_ids(), &[0, 1, 0]);
        assert_eq!(triplets.shape(), (2, 2));
    }

    #[test]
    fn unseen_ids_have_no_index() {
        let ratings = Ratings::from(vec![Rating::new(10, 20, 3.0)]);
        let (encoder, _) = Encoder::fit(&ratings);

        assert_eq!(encoder.lookup(IdSpace::User, 11), None);
        assert_eq!(encoder.lookup(IdSpace::Item, 10), None);
        assert_eq!(encoder.decode(IdSpace::User, 1), None);
    }

    #[test]
    fn encode_known_separates_cold_start() {
        let train = Ratings::from(vec![Rating::new(1, 1, 5.0), Rating::new(2, 2, 3.0)]);
        let test = Ratings::from(vec![
            Rating::new(2, 1, 4.0),
            Rating::new(3, 1, 2.0),
            Rating::new(1, 3, 1.0),
        ]);

        let (encoder, _) = Encoder::fit(&train);
        let (known, cold_start) = encoder.encode_known(&test);

        assert_eq!(known.len(), 1);
        assert_eq!(known.get(0), (1, 0, 4.0));
        assert_eq!(known.shape(), (2, 2));
        assert_eq!(cold_start, vec![test.data()[1], test.data()[2]]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn encoding_is_deterministic_and_dense(
            ids in prop::collection::vec((0u64..50, 0u64..50), 1..200),
        ) {
            let ratings: Ratings = ids
                .iter()
                .map(|&(user, item)| Rating::new(user, item, 1.0))
                .collect();

            let (first, first_triplets) = Encoder::fit(&ratings);
            let (second, second_triplets) = Encoder::fit(&ratings);

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&first_triplets, &second_triplets);

            let mut table = first.table(IdSpace::User).clone();
            for (index, &raw_id) in first.table(IdSpace::User).raw_ids().iter().enumerate() {
                prop_assert_eq!(first.lookup(IdSpace::User, raw_id), Some(index));
                prop_assert_eq!(table.encode(raw_id), index);
            }
            prop_assert_eq!(table.len(), first.num_users());
        }
    }
}
