//! Rating containers: raw ratings as loaded, and their encoded forms.
use std::hash::Hasher;
use std::iter::FromIterator;

use rand::seq::SliceRandom;
use rand::Rng;

use siphasher::sip::SipHasher;

use crate::{ItemId, ItemIndex, Timestamp, UserId, UserIndex};

/// A single explicit rating of an item by a user.
///
/// Field names follow the MovieLens CSV headers (`userId,movieId,rating,timestamp`);
/// snake-case headers are accepted as well.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Rating {
    #[serde(rename = "userId", alias = "user_id")]
    user_id: UserId,
    #[serde(rename = "movieId", alias = "item_id", alias = "itemId")]
    item_id: ItemId,
    rating: f32,
    #[serde(default)]
    timestamp: Option<Timestamp>,
}

impl Rating {
    /// Create a rating without a timestamp.
    pub fn new(user_id: UserId, item_id: ItemId, rating: f32) -> Self {
        Rating {
            user_id,
            item_id,
            rating,
            timestamp: None,
        }
    }

    /// Attach a timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The rating user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The rated item.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// The rating value.
    pub fn rating(&self) -> f32 {
        self.rating
    }

    /// When the rating was made, if known.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

/// Randomly split `ratings` into train and test sets, placing
/// `test_fraction` of the ratings in the test set.
pub fn train_test_split<R: Rng>(
    ratings: &mut Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> (Ratings, Ratings) {
    ratings.shuffle(rng);

    let (test, train) = ratings.split_at((test_fraction * ratings.len() as f32) as usize);

    (train, test)
}

/// Split `ratings` so that all ratings of any given user end up on the
/// same side; roughly `test_fraction` of users go to the test set.
pub fn user_based_split<R: Rng>(
    ratings: &mut Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> (Ratings, Ratings) {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f32) as u64;

    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let is_train = |x: &Rating| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_u64(x.user_id());
        hasher.finish() % denominator >= train_cutoff
    };

    ratings.split_by(is_train)
}

/// An ordered sequence of raw ratings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ratings {
    ratings: Vec<Rating>,
}

impl Ratings {
    /// Create an empty collection.
    pub fn new() -> Self {
        Ratings {
            ratings: Vec::new(),
        }
    }

    /// Append a rating.
    pub fn push(&mut self, rating: Rating) {
        self.ratings.push(rating);
    }

    /// The ratings, in order.
    pub fn data(&self) -> &[Rating] {
        &self.ratings
    }

    /// Iterate over the ratings in order.
    pub fn iter(&self) -> std::slice::Iter<Rating> {
        self.ratings.iter()
    }

    /// Number of ratings.
    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    /// Whether there are no ratings.
    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Shuffle the ratings in place.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.ratings.shuffle(rng);
    }

    /// Split into the first `idx` ratings and the rest.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let idx = idx.min(self.len());

        let head = Ratings {
            ratings: self.ratings[..idx].to_owned(),
        };
        let tail = Ratings {
            ratings: self.ratings[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Split into the ratings satisfying `func` and the rest, preserving order.
    pub fn split_by<F: Fn(&Rating) -> bool>(&self, func: F) -> (Self, Self) {
        let (head, tail): (Vec<Rating>, Vec<Rating>) =
            self.ratings.iter().partition(|x| func(x));

        (Ratings { ratings: head }, Ratings { ratings: tail })
    }
}

impl From<Vec<Rating>> for Ratings {
    fn from(ratings: Vec<Rating>) -> Ratings {
        Ratings { ratings }
    }
}

impl FromIterator<Rating> for Ratings {
    fn from_iter<I: IntoIterator<Item = Rating>>(iter: I) -> Self {
        Ratings {
            ratings: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Ratings {
    type Item = &'a Rating;
    type IntoIter = std::slice::Iter<'a, Rating>;

    fn into_iter(self) -> Self::IntoIter {
        self.ratings.iter()
    }
}

/// Encoded ratings stored as parallel columns of
/// (user index, item index, rating) triples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TripletRatings {
    num_users: usize,
    num_items: usize,
    user_ids: Vec<UserIndex>,
    item_ids: Vec<ItemIndex>,
    ratings: Vec<f32>,
}

impl TripletRatings {
    /// Create an empty set of triples over `num_users` users and `num_items` items.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        TripletRatings {
            num_users,
            num_items,
            ..Default::default()
        }
    }

    /// Append a triple, growing the dimensions if the indices exceed them.
    pub fn push(&mut self, user: UserIndex, item: ItemIndex, rating: f32) {
        self.num_users = self.num_users.max(user + 1);
        self.num_items = self.num_items.max(item + 1);

        self.user_ids.push(user);
        self.item_ids.push(item);
        self.ratings.push(rating);
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    /// Whether there are no triples.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    /// The `idx`-th triple.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= self.len()`.
    pub fn get(&self, idx: usize) -> (UserIndex, ItemIndex, f32) {
        (self.user_ids[idx], self.item_ids[idx], self.ratings[idx])
    }

    /// Iterate over the triples in order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (UserIndex, ItemIndex, f32)> + 'a {
        izip!(&self.user_ids, &self.item_ids, &self.ratings).map(|(&u, &i, &r)| (u, i, r))
    }

    /// The user column.
    pub fn user_ids(&self) -> &[UserIndex] {
        &self.user_ids
    }

    /// The item column.
    pub fn item_ids(&self) -> &[ItemIndex] {
        &self.item_ids
    }

    /// The rating column.
    pub fn ratings(&self) -> &[f32] {
        &self.ratings
    }

    /// Mean rating, or 0 when empty.
    pub fn mean_rating(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }

        let total: f64 = self.ratings.iter().map(|&r| f64::from(r)).sum();

        (total / self.len() as f64) as f32
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// (users, items) dimensions.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Group the triples by user.
    pub fn to_compressed(&self) -> CompressedRatings {
        CompressedRatings::from(self)
    }
}

impl From<Vec<(UserIndex, ItemIndex, f32)>> for TripletRatings {
    fn from(data: Vec<(UserIndex, ItemIndex, f32)>) -> TripletRatings {
        let mut triplets = TripletRatings::new(0, 0);

        for (user, item, rating) in data {
            triplets.push(user, item, rating);
        }

        triplets
    }
}

/// Encoded ratings grouped by user, in compressed sparse row layout.
///
/// Within a user, ratings keep their training order.
#[derive(Clone, Debug, Default)]
pub struct CompressedRatings {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemIndex>,
    ratings: Vec<f32>,
}

impl<'a> From<&'a TripletRatings> for CompressedRatings {
    fn from(triplets: &TripletRatings) -> CompressedRatings {
        let mut order: Vec<usize> = (0..triplets.len()).collect();
        // Stable, so each user's ratings stay in training order.
        order.sort_by_key(|&idx| triplets.user_ids[idx]);

        let mut user_pointers = vec![0; triplets.num_users + 1];
        let mut item_ids = Vec::with_capacity(order.len());
        let mut ratings = Vec::with_capacity(order.len());

        for &idx in &order {
            item_ids.push(triplets.item_ids[idx]);
            ratings.push(triplets.ratings[idx]);

            user_pointers[triplets.user_ids[idx] + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedRatings {
            num_users: triplets.num_users,
            num_items: triplets.num_items,
            user_pointers,
            item_ids,
            ratings,
        }
    }
}

impl CompressedRatings {
    /// Iterate over all users, including those without ratings.
    pub fn iter_users(&self) -> CompressedRatingsUserIterator {
        CompressedRatingsUserIterator {
            ratings: self,
            idx: 0,
        }
    }

    /// The ratings of `user_id`, or `None` if out of range.
    pub fn get_user(&self, user_id: UserIndex) -> Option<CompressedRatingsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedRatingsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
            ratings: &self.ratings[start..stop],
        })
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }
}

/// Iterator over the users of a [`CompressedRatings`].
pub struct CompressedRatingsUserIterator<'a> {
    ratings: &'a CompressedRatings,
    idx: usize,
}

/// The ratings of a single user.
#[derive(Debug)]
pub struct CompressedRatingsUser<'a> {
    /// User index.
    pub user_id: UserIndex,
    /// Indices of the items the user rated.
    pub item_ids: &'a [ItemIndex],
    /// The ratings, aligned with `item_ids`.
    pub ratings: &'a [f32],
}

impl<'a> CompressedRatingsUser<'a> {
    /// Number of ratings.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user rated nothing.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for CompressedRatingsUserIterator<'a> {
    type Item = CompressedRatingsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.ratings.get_user(self.idx);

        self.idx += 1;

        value
    }
}
