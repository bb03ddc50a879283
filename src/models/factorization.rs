//! Explicit-feedback matrix factorization.
//!
//! A rating is modelled as the dot product of a user and an item latent
//! vector, optionally offset by a global mean and per-user and per-item
//! biases:
//!
//! ```text
//! r_ui = p_u . q_i + mu + b_u + b_i
//! ```
//!
//! Parameters are fitted with stochastic gradient descent on the squared
//! error with an L2 penalty. Each epoch is split into strata: users and items
//! are partitioned into `num_threads` contiguous blocks, and in stratum `s`
//! worker `p` updates the ratings falling in user block `p` and item block
//! `(p + s) % num_threads`. The blocks of one stratum share no user or item
//! rows, so workers update their own slices of the factor matrices without
//! locking. Every block carries its own seeded generator, which makes a fit
//! reproducible for a given seed and thread count.
//!
//! Training always runs for exactly `num_epochs` passes: there is no
//! convergence check or early stopping. Predictions are not clamped to any
//! rating range.
use std::ops::Range;

use ndarray::{Array2, ArrayBase, ArrayView1, ArrayViewMut2, Axis, Data, Ix1};
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::data::TripletRatings;
use crate::{FittingError, ItemIndex, RatingModel, UserIndex};

fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let scale = (cols as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen::<f32>() / scale)
}

/// The scoring rule shared by training and prediction.
#[inline]
fn predict_pair<S, T>(user: &ArrayBase<S, Ix1>, item: &ArrayBase<T, Ix1>, bias: f32) -> f32
where
    S: Data<Elem = f32>,
    T: Data<Elem = f32>,
{
    user.dot(item) + bias
}

/// Hyperparameters describing the factorization model.
///
/// Doubles as the training configuration: it can be deserialized from a
/// partial JSON document, with missing fields taking their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    latent_dim: usize,
    num_epochs: usize,
    learning_rate: f32,
    l2_penalty: f32,
    biases: bool,
    num_threads: usize,
    seed: u64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters with default settings and a random seed.
    pub fn new() -> Self {
        Hyperparameters {
            latent_dim: 100,
            num_epochs: 20,
            learning_rate: 0.01,
            l2_penalty: 0.02,
            biases: true,
            num_threads: rayon::current_num_threads(),
            seed: rand::thread_rng().gen(),
        }
    }

    /// Set the latent dimensionality (the rank of the factorization).
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the number of passes over the training data.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// Enable or disable the global, user and item bias terms.
    pub fn biases(mut self, biases: bool) -> Self {
        self.biases = biases;
        self
    }

    /// Set number of threads to be used.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the random seed.
    pub fn from_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            latent_dim: 2_usize.pow(Uniform::new(2, 8).sample(rng)),
            num_epochs: 2_usize.pow(Uniform::new(3, 7).sample(rng)),
            learning_rate: (10.0_f32).powf(Uniform::new(-3.0, -1.0).sample(rng)),
            l2_penalty: (10.0_f32).powf(Uniform::new(-4.0, -1.0).sample(rng)),
            biases: rng.gen_bool(0.5),
            num_threads: rayon::current_num_threads(),
            seed: rng.gen(),
        }
    }

    fn validate(&self) -> Result<(), FittingError> {
        if self.latent_dim == 0 {
            return Err(FittingError::InvalidHyperparameters(
                "latent_dim must be positive",
            ));
        }
        if self.num_epochs == 0 {
            return Err(FittingError::InvalidHyperparameters(
                "num_epochs must be positive",
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FittingError::InvalidHyperparameters(
                "learning_rate must be positive and finite",
            ));
        }
        if !(self.l2_penalty.is_finite() && self.l2_penalty >= 0.0) {
            return Err(FittingError::InvalidHyperparameters(
                "l2_penalty must be non-negative and finite",
            ));
        }
        if self.num_threads == 0 {
            return Err(FittingError::InvalidHyperparameters(
                "num_threads must be positive",
            ));
        }

        Ok(())
    }

    /// Fit a model on the encoded training ratings.
    ///
    /// Runs exactly `num_epochs` passes and returns the trained model; the
    /// hyperparameters themselves are left untouched, so fitting twice with
    /// the same data gives the same model.
    pub fn fit(&self, interactions: &TripletRatings) -> Result<FactorizationModel, FittingError> {
        self.validate()?;

        if interactions.is_empty() {
            return Err(FittingError::DatasetEmpty);
        }

        let (num_users, num_items) = interactions.shape();
        let mut rng = XorShiftRng::seed_from_u64(self.seed);

        let mut user_factors = embedding_init(num_users, self.latent_dim, &mut rng);
        let mut item_factors = embedding_init(num_items, self.latent_dim, &mut rng);
        let mut user_biases = vec![0.0; num_users];
        let mut item_biases = vec![0.0; num_items];
        let global_bias = if self.biases {
            interactions.mean_rating()
        } else {
            0.0
        };

        let num_blocks = self.num_threads.min(num_users).min(num_items).max(1);
        let user_ranges = block_ranges(num_users, num_blocks);
        let item_ranges = block_ranges(num_items, num_blocks);
        let mut blocks = assign_blocks(interactions, &user_ranges, &item_ranges, &mut rng);

        info!(
            num_users,
            num_items,
            num_ratings = interactions.len(),
            latent_dim = self.latent_dim,
            num_epochs = self.num_epochs,
            num_blocks,
            "fitting factorization model"
        );

        let mut loss = 0.0;

        for epoch in 0..self.num_epochs {
            let mut squared_error = 0.0;

            for stratum in 0..num_blocks {
                let users = split_rows(user_factors.view_mut(), &user_ranges);
                let user_bias_blocks = split_slice(&mut user_biases, &user_ranges);

                let mut items = split_rows(item_factors.view_mut(), &item_ranges);
                let mut item_bias_blocks = split_slice(&mut item_biases, &item_ranges);
                let mut item_offsets: Vec<usize> =
                    item_ranges.iter().map(|range| range.start).collect();

                // Worker p gets item block (p + stratum) % num_blocks.
                items.rotate_left(stratum);
                item_bias_blocks.rotate_left(stratum);
                item_offsets.rotate_left(stratum);

                let stratum_blocks: Vec<&mut Block> = blocks
                    .iter_mut()
                    .enumerate()
                    .map(|(p, row)| &mut row[(p + stratum) % num_blocks])
                    .collect();

                let shards: Vec<_> = izip!(
                    users,
                    user_bias_blocks,
                    user_ranges.iter().map(|range| range.start),
                    items,
                    item_bias_blocks,
                    item_offsets,
                    stratum_blocks
                ).collect();

                let errors: Vec<f64> = shards
                    .into_par_iter()
                    .map(
                        |(
                            user_factors,
                            user_biases,
                            user_offset,
                            item_factors,
                            item_biases,
                            item_offset,
                            block,
                        )| {
                            let shard = Shard {
                                user_factors,
                                user_biases,
                                user_offset,
                                item_factors,
                                item_biases,
                                item_offset,
                            };

                            self.sgd_pass(interactions, global_bias, shard, block)
                        },
                    )
                    .collect();

                squared_error += errors.iter().sum::<f64>();
            }

            loss = (squared_error / interactions.len() as f64).sqrt() as f32;

            debug!(epoch, loss, "finished epoch");
        }

        info!(loss, "fitted factorization model");

        let biases = if self.biases {
            Some(Biases {
                global: global_bias,
                users: user_biases,
                items: item_biases,
            })
        } else {
            None
        };

        Ok(FactorizationModel {
            hyper: self.clone(),
            user_factors,
            item_factors,
            biases,
            training_loss: loss,
        })
    }

    /// Run one pass over a block, returning its summed squared error.
    fn sgd_pass(
        &self,
        interactions: &TripletRatings,
        global_bias: f32,
        shard: Shard,
        block: &mut Block,
    ) -> f64 {
        let Shard {
            mut user_factors,
            user_biases,
            user_offset,
            mut item_factors,
            item_biases,
            item_offset,
        } = shard;

        let learning_rate = self.learning_rate;
        let l2_penalty = self.l2_penalty;

        block.triples.shuffle(&mut block.rng);

        let mut squared_error = 0.0;

        for &idx in &block.triples {
            let (user, item, rating) = interactions.get(idx);
            let (user, item) = (user - user_offset, item - item_offset);

            let mut user_vector = user_factors.row_mut(user);
            let mut item_vector = item_factors.row_mut(item);

            let bias = if self.biases {
                global_bias + user_biases[user] + item_biases[item]
            } else {
                0.0
            };

            let error = rating - predict_pair(&user_vector, &item_vector, bias);
            squared_error += f64::from(error * error);

            if self.biases {
                user_biases[user] += learning_rate * (error - l2_penalty * user_biases[user]);
                item_biases[item] += learning_rate * (error - l2_penalty * item_biases[item]);
            }

            for (p, q) in user_vector.iter_mut().zip(item_vector.iter_mut()) {
                let (user_value, item_value) = (*p, *q);

                *p += learning_rate * (error * item_value - l2_penalty * user_value);
                *q += learning_rate * (error * user_value - l2_penalty * item_value);
            }
        }

        squared_error
    }
}

/// The ratings falling into one (user block, item block) cell.
#[derive(Debug)]
struct Block {
    triples: Vec<usize>,
    rng: XorShiftRng,
}

/// Mutable views over the parameters one worker may touch in a stratum.
struct Shard<'a> {
    user_factors: ArrayViewMut2<'a, f32>,
    user_biases: &'a mut [f32],
    user_offset: usize,
    item_factors: ArrayViewMut2<'a, f32>,
    item_biases: &'a mut [f32],
    item_offset: usize,
}

/// Partition `0..len` into `num_blocks` contiguous, non-empty ranges
/// (`num_blocks` must not exceed `len`).
fn block_ranges(len: usize, num_blocks: usize) -> Vec<Range<usize>> {
    let base = len / num_blocks;
    let remainder = len % num_blocks;

    let mut start = 0;

    (0..num_blocks)
        .map(|block| {
            let size = base + if block < remainder { 1 } else { 0 };
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

fn block_of(ranges: &[Range<usize>], idx: usize) -> usize {
    ranges
        .binary_search_by(|range| {
            if range.end <= idx {
                std::cmp::Ordering::Less
            } else if range.start > idx {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .unwrap_or_else(|insertion| insertion.min(ranges.len() - 1))
}

fn assign_blocks<R: Rng>(
    interactions: &TripletRatings,
    user_ranges: &[Range<usize>],
    item_ranges: &[Range<usize>],
    rng: &mut R,
) -> Vec<Vec<Block>> {
    let mut blocks: Vec<Vec<Block>> = user_ranges
        .iter()
        .map(|_| {
            item_ranges
                .iter()
                .map(|_| Block {
                    triples: Vec::new(),
                    rng: XorShiftRng::seed_from_u64(rng.gen()),
                })
                .collect()
        })
        .collect();

    for (idx, (user, item, _)) in interactions.iter().enumerate() {
        blocks[block_of(user_ranges, user)][block_of(item_ranges, item)]
            .triples
            .push(idx);
    }

    blocks
}

fn split_rows<'a>(
    mut view: ArrayViewMut2<'a, f32>,
    ranges: &[Range<usize>],
) -> Vec<ArrayViewMut2<'a, f32>> {
    let mut blocks = Vec::with_capacity(ranges.len());

    for range in ranges {
        let (head, tail) = view.split_at(Axis(0), range.len());
        blocks.push(head);
        view = tail;
    }

    blocks
}

fn split_slice<'a>(mut slice: &'a mut [f32], ranges: &[Range<usize>]) -> Vec<&'a mut [f32]> {
    let mut blocks = Vec::with_capacity(ranges.len());

    for range in ranges {
        let (head, tail) = std::mem::take(&mut slice).split_at_mut(range.len());
        blocks.push(head);
        slice = tail;
    }

    blocks
}

#[derive(Clone, Debug, PartialEq)]
struct Biases {
    global: f32,
    users: Vec<f32>,
    items: Vec<f32>,
}

/// A fitted factorization model.
///
/// Immutable once returned by [`Hyperparameters::fit`]; safe to share
/// between threads for concurrent prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct FactorizationModel {
    hyper: Hyperparameters,
    user_factors: Array2<f32>,
    item_factors: Array2<f32>,
    biases: Option<Biases>,
    training_loss: f32,
}

impl FactorizationModel {
    /// A bias-free model with the given factor matrices.
    #[cfg(test)]
    pub(crate) fn from_factors(user_factors: Array2<f32>, item_factors: Array2<f32>) -> Self {
        FactorizationModel {
            hyper: Hyperparameters::new()
                .latent_dim(user_factors.ncols())
                .biases(false)
                .from_seed(0),
            user_factors,
            item_factors,
            biases: None,
            training_loss: 0.0,
        }
    }

    /// The hyperparameters the model was fitted with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Latent dimensionality (rank).
    pub fn latent_dim(&self) -> usize {
        self.hyper.latent_dim
    }

    /// Number of training passes that were run.
    pub fn num_epochs(&self) -> usize {
        self.hyper.num_epochs
    }

    /// Learning rate used in training.
    pub fn learning_rate(&self) -> f32 {
        self.hyper.learning_rate
    }

    /// L2 penalty used in training.
    pub fn l2_penalty(&self) -> f32 {
        self.hyper.l2_penalty
    }

    /// Root mean squared training error over the final epoch.
    pub fn training_loss(&self) -> f32 {
        self.training_loss
    }

    /// Latent vector of `user`.
    pub fn user_factors(&self, user: UserIndex) -> Option<ArrayView1<f32>> {
        if user < self.user_factors.nrows() {
            Some(self.user_factors.row(user))
        } else {
            None
        }
    }

    /// Latent vector of `item`.
    pub fn item_factors(&self, item: ItemIndex) -> Option<ArrayView1<f32>> {
        if item < self.item_factors.nrows() {
            Some(self.item_factors.row(item))
        } else {
            None
        }
    }

    /// Whether the model has bias terms.
    pub fn has_biases(&self) -> bool {
        self.biases.is_some()
    }

    /// The global bias (training mean), if biases are enabled.
    pub fn global_bias(&self) -> Option<f32> {
        self.biases.as_ref().map(|biases| biases.global)
    }

    /// The bias of `user`, if biases are enabled and `user` is in range.
    pub fn user_bias(&self, user: UserIndex) -> Option<f32> {
        self.biases
            .as_ref()
            .and_then(|biases| biases.users.get(user).cloned())
    }

    /// The bias of `item`, if biases are enabled and `item` is in range.
    pub fn item_bias(&self, item: ItemIndex) -> Option<f32> {
        self.biases
            .as_ref()
            .and_then(|biases| biases.items.get(item).cloned())
    }

    /// Score used when the user, the item, or both have no factors: the
    /// global bias plus whichever of the user and item biases is known.
    /// Always 0 for a model without biases.
    pub fn fallback_score(&self, user: Option<UserIndex>, item: Option<ItemIndex>) -> f32 {
        self.global_bias().unwrap_or(0.0)
            + user.and_then(|user| self.user_bias(user)).unwrap_or(0.0)
            + item.and_then(|item| self.item_bias(item)).unwrap_or(0.0)
    }
}

impl RatingModel for FactorizationModel {
    fn num_users(&self) -> usize {
        self.user_factors.nrows()
    }

    fn num_items(&self) -> usize {
        self.item_factors.nrows()
    }

    fn score(&self, user: UserIndex, item: ItemIndex) -> Option<f32> {
        let user_vector = self.user_factors(user)?;
        let item_vector = self.item_factors(item)?;

        let bias = match self.biases {
            Some(ref biases) => biases.global + biases.users[user] + biases.items[item],
            None => 0.0,
        };

        Some(predict_pair(&user_vector, &item_vector, bias))
    }
}
