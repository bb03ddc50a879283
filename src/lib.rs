#![deny(missing_docs)]
//! # mfr
//!
//! `mfr` predicts explicit ratings with a matrix factorization model and
//! turns those predictions into ranked top-N recommendations.
//!
//! The pipeline is batch-only: raw ratings are encoded into dense indices,
//! a [`FactorizationModel`](models::factorization::FactorizationModel) is
//! fitted with stochastic gradient descent, and the resulting
//! [`Recommender`](recommender::Recommender) serves predictions, evaluation
//! metrics and recommendations without further mutation.
//!
//! ## Example
//!
//! ```rust
//! use mfr::data::{Rating, Ratings};
//! use mfr::models::factorization::Hyperparameters;
//! use mfr::recommender::Recommender;
//!
//! let ratings = Ratings::from(vec![
//!     Rating::new(1, 1, 5.0),
//!     Rating::new(1, 2, 1.0),
//!     Rating::new(2, 1, 4.0),
//! ]);
//!
//! let hyper = Hyperparameters::new()
//!     .latent_dim(2)
//!     .num_epochs(50)
//!     .learning_rate(0.05)
//!     .num_threads(1)
//!     .from_seed(42);
//!
//! let recommender = Recommender::train(&ratings, &hyper).unwrap();
//!
//! let liked = recommender.predict(1, 1).unwrap();
//! let disliked = recommender.predict(1, 2).unwrap();
//! assert!(liked.score().unwrap() > disliked.score().unwrap());
//!
//! let top = recommender.recommend(1, &[1, 2], 1).unwrap();
//! assert_eq!(top.items[0].item_id, 1);
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[cfg(feature = "csv")]
extern crate csv;
#[macro_use]
extern crate failure;
extern crate ndarray;
extern crate rand;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;
extern crate siphasher;
extern crate tracing;

pub mod data;
pub mod datasets;
pub mod encoding;
pub mod evaluation;
pub mod models;
pub mod ranking;
pub mod recommender;

/// Raw user identifier, as supplied by the rating source.
pub type UserId = u64;
/// Raw item identifier, as supplied by the rating source.
pub type ItemId = u64;
/// Dense, zero-based user index assigned by the encoder.
pub type UserIndex = usize;
/// Dense, zero-based item index assigned by the encoder.
pub type ItemIndex = usize;
/// Alias for timestamps.
pub type Timestamp = u64;

/// Prediction error types.
#[derive(Debug, Fail, PartialEq)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(
        display = "Invalid prediction value for user {} and item {}: non-finite or not a number.",
        user_id, item_id
    )]
    InvalidPredictionValue {
        /// The user the prediction was requested for.
        user_id: UserId,
        /// The item the prediction was requested for.
        item_id: ItemId,
    },
    /// Recommendations were requested for a user with no training ratings.
    #[fail(display = "User {} has no ratings in the training set.", _0)]
    ColdStartUser(UserId),
    /// The number of recommendations must be positive.
    #[fail(display = "Invalid number of recommendations: {}.", _0)]
    InvalidTopN(usize),
}

/// Fitting error types.
#[derive(Debug, Fail, PartialEq)]
pub enum FittingError {
    /// No ratings were given.
    #[fail(display = "No ratings to fit the model on.")]
    DatasetEmpty,
    /// A hyperparameter is out of its valid range.
    #[fail(display = "Invalid hyperparameters: {}.", _0)]
    InvalidHyperparameters(&'static str),
}

/// Evaluation error types.
#[derive(Debug, Fail, PartialEq)]
pub enum EvaluationError {
    /// No ratings were given.
    #[fail(display = "No ratings to evaluate the model on.")]
    DatasetEmpty,
    /// Every rating given involves a user or item unseen in training, so
    /// none can be scored.
    #[fail(
        display = "All {} ratings involve cold-start users or items.",
        num_cold_start
    )]
    NoKnownRatings {
        /// Number of cold-start ratings that were given.
        num_cold_start: usize,
    },
    /// A test rating refers to an index the model has no factors for.
    #[fail(display = "User index {} or item index {} is out of range.", user, item)]
    IndexOutOfRange {
        /// Encoded user index.
        user: UserIndex,
        /// Encoded item index.
        item: ItemIndex,
    },
    /// Failed prediction due to numerical issues.
    #[fail(
        display = "Invalid prediction value for user index {} and item index {}.",
        user, item
    )]
    InvalidPredictionValue {
        /// Encoded user index.
        user: UserIndex,
        /// Encoded item index.
        item: ItemIndex,
    },
}

/// Trait describing fitted models that score encoded (user, item) pairs.
pub trait RatingModel {
    /// Number of users the model has factors for.
    fn num_users(&self) -> usize;
    /// Number of items the model has factors for.
    fn num_items(&self) -> usize;
    /// Predict the rating of `item` by `user`.
    ///
    /// Returns `None` if either index is out of range.
    fn score(&self, user: UserIndex, item: ItemIndex) -> Option<f32>;
}
