//! Consumer-facing prediction and recommendation.
//!
//! A [`Recommender`] bundles the encoder and the factorization model
//! produced by one training run. Both are immutable after training, so a
//! recommender can be shared across threads and queried concurrently.
use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::data::{CompressedRatings, Rating, Ratings};
use crate::encoding::{Encoder, IdSpace};
use crate::evaluation::{self, RegressionMetrics};
use crate::models::factorization::{FactorizationModel, Hyperparameters};
use crate::ranking::{self, RankedItem};
use crate::{EvaluationError, FittingError, ItemId, PredictionError, RatingModel, UserId};

/// Which identifiers of a prediction request were not seen in training.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColdStartIdentifier {
    /// The user is unknown; the item is known.
    User(UserId),
    /// The item is unknown; the user is known.
    Item(ItemId),
    /// Neither is known.
    UserAndItem(UserId, ItemId),
}

/// The outcome of a single prediction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Estimate {
    /// Both identifiers are known and the model produced this score.
    Score(f32),
    /// At least one identifier is cold-start. `fallback` is the global
    /// bias plus the bias of whichever identifier is known (0 for models
    /// without biases); it is not a model score.
    ColdStart {
        /// The unknown identifiers.
        unknown: ColdStartIdentifier,
        /// A bias-only estimate callers may choose to use.
        fallback: f32,
    },
}

/// A predicted rating for one (user, item) pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// The raw user identifier.
    pub user_id: UserId,
    /// The raw item identifier.
    pub item_id: ItemId,
    /// The model score or the cold-start outcome.
    pub estimate: Estimate,
}

impl Prediction {
    /// The model score, or `None` for a cold-start pair.
    pub fn score(&self) -> Option<f32> {
        match self.estimate {
            Estimate::Score(score) => Some(score),
            Estimate::ColdStart { .. } => None,
        }
    }

    /// Whether either identifier was unknown.
    pub fn is_cold_start(&self) -> bool {
        self.score().is_none()
    }

    /// The model score, or the fallback for a cold-start pair.
    pub fn score_or_fallback(&self) -> f32 {
        match self.estimate {
            Estimate::Score(score) => score,
            Estimate::ColdStart { fallback, .. } => fallback,
        }
    }
}

/// A ranked list of recommendations for one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    /// The user the list was built for.
    pub user_id: UserId,
    /// The best candidates, highest score first.
    pub items: Vec<RankedItem>,
    /// Candidates that were not ranked because they never appeared in
    /// training, in input order.
    pub cold_start_items: Vec<ItemId>,
}

/// Metrics over the held-out ratings the model could score, together with
/// the ratings it could not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Metrics over the ratings whose user and item are both known.
    pub metrics: RegressionMetrics,
    /// Ratings left out because their user or item is cold-start, in input
    /// order.
    pub cold_start: Vec<Rating>,
}

/// A trained model together with the identifier encoding it was trained on.
#[derive(Clone, Debug)]
pub struct Recommender {
    model: FactorizationModel,
    encoder: Encoder,
    rated: CompressedRatings,
}

impl Recommender {
    /// Encode `ratings` and fit a model with `hyper`.
    pub fn train(ratings: &Ratings, hyper: &Hyperparameters) -> Result<Self, FittingError> {
        if ratings.is_empty() {
            return Err(FittingError::DatasetEmpty);
        }

        let (encoder, triplets) = Encoder::fit(ratings);

        info!(
            num_users = encoder.num_users(),
            num_items = encoder.num_items(),
            num_ratings = triplets.len(),
            "encoded training ratings"
        );

        let model = hyper.fit(&triplets)?;

        Ok(Recommender {
            model,
            encoder,
            rated: triplets.to_compressed(),
        })
    }

    /// The fitted model.
    pub fn model(&self) -> &FactorizationModel {
        &self.model
    }

    /// The identifier encoder.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Compute regression metrics over held-out ratings.
    ///
    /// Ratings whose user or item is cold-start cannot be scored by the
    /// model. They are left out of the metrics and returned in
    /// [`Evaluation::cold_start`]. Fails with
    /// [`EvaluationError::DatasetEmpty`] for an empty test set and with
    /// [`EvaluationError::NoKnownRatings`] when every rating is cold-start.
    pub fn evaluate(&self, test: &Ratings) -> Result<Evaluation, EvaluationError> {
        if test.is_empty() {
            return Err(EvaluationError::DatasetEmpty);
        }

        let (known, cold_start) = self.encoder.encode_known(test);

        if known.is_empty() {
            return Err(EvaluationError::NoKnownRatings {
                num_cold_start: cold_start.len(),
            });
        }

        if !cold_start.is_empty() {
            warn!(
                num_cold_start = cold_start.len(),
                num_ratings = test.len(),
                "skipping test ratings with cold-start users or items"
            );
        }

        Ok(Evaluation {
            metrics: evaluation::evaluate(&self.model, &known)?,
            cold_start,
        })
    }

    /// Predict the rating of `item_id` by `user_id`.
    pub fn predict(&self, user_id: UserId, item_id: ItemId) -> Result<Prediction, PredictionError> {
        let user = self.encoder.lookup(IdSpace::User, user_id);
        let item = self.encoder.lookup(IdSpace::Item, item_id);

        let estimate = match (user, item) {
            (Some(user), Some(item)) => match self.model.score(user, item) {
                Some(score) if score.is_finite() => Estimate::Score(score),
                _ => return Err(PredictionError::InvalidPredictionValue { user_id, item_id }),
            },
            (None, Some(_)) => Estimate::ColdStart {
                unknown: ColdStartIdentifier::User(user_id),
                fallback: self.model.fallback_score(user, item),
            },
            (Some(_), None) => Estimate::ColdStart {
                unknown: ColdStartIdentifier::Item(item_id),
                fallback: self.model.fallback_score(user, item),
            },
            (None, None) => Estimate::ColdStart {
                unknown: ColdStartIdentifier::UserAndItem(user_id, item_id),
                fallback: self.model.fallback_score(user, item),
            },
        };

        Ok(Prediction {
            user_id,
            item_id,
            estimate,
        })
    }

    /// Rank `candidates` for `user_id` and return the best `top_n`.
    ///
    /// Candidates are scored in parallel; ties keep the order in which they
    /// were supplied. Candidate items unseen in training are reported in
    /// [`Recommendations::cold_start_items`] instead of being ranked.
    pub fn recommend(
        &self,
        user_id: UserId,
        candidates: &[ItemId],
        top_n: usize,
    ) -> Result<Recommendations, PredictionError> {
        if top_n == 0 {
            return Err(PredictionError::InvalidTopN(top_n));
        }

        let user = self
            .encoder
            .lookup(IdSpace::User, user_id)
            .ok_or(PredictionError::ColdStartUser(user_id))?;

        let scored: Vec<Result<Option<RankedItem>, PredictionError>> = candidates
            .par_iter()
            .map(|&item_id| match self.encoder.lookup(IdSpace::Item, item_id) {
                None => Ok(None),
                Some(item) => match self.model.score(user, item) {
                    Some(score) if score.is_finite() => Ok(Some(RankedItem { item_id, score })),
                    _ => Err(PredictionError::InvalidPredictionValue { user_id, item_id }),
                },
            })
            .collect();
        let scored = scored.into_iter().collect::<Result<Vec<_>, _>>()?;

        let cold_start_items = izip!(candidates, &scored)
            .filter(|(_, scored)| scored.is_none())
            .map(|(&item_id, _)| item_id)
            .collect();

        Ok(Recommendations {
            user_id,
            items: ranking::top_k(scored.into_iter().flatten(), top_n),
            cold_start_items,
        })
    }

    /// Items `user_id` rated in training, in training order. `None` for a
    /// cold-start user.
    pub fn rated_items(&self, user_id: UserId) -> Option<Vec<ItemId>> {
        let user = self.encoder.lookup(IdSpace::User, user_id)?;
        let rated = self.rated.get_user(user)?;

        Some(
            rated
                .item_ids
                .iter()
                .filter_map(|&item| self.encoder.decode(IdSpace::Item, item))
                .collect(),
        )
    }

    /// Filter `items` down to those `user_id` did not rate in training,
    /// preserving order. A cold-start user keeps every item.
    pub fn unrated_candidates<I>(&self, user_id: UserId, items: I) -> Vec<ItemId>
    where
        I: IntoIterator<Item = ItemId>,
    {
        let rated: HashSet<ItemId> = self
            .rated_items(user_id)
            .unwrap_or_default()
            .into_iter()
            .collect();

        items
            .into_iter()
            .filter(|item_id| !rated.contains(item_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::*;

    fn small_example() -> Ratings {
        Ratings::from(vec![
            Rating::new(1, 1, 5.0),
            Rating::new(1, 2, 1.0),
            Rating::new(2, 1, 4.0),
        ])
    }

    fn small_hyperparameters() -> Hyperparameters {
        Hyperparameters::new()
            .latent_dim(2)
            .num_epochs(50)
            .learning_rate(0.05)
            .num_threads(1)
            .from_seed(42)
    }

    /// 30 users by 20 items; users prefer items with a matching id parity.
    fn parity_ratings() -> Ratings {
        let mut ratings = Ratings::new();

        for user in 0..30u64 {
            for item in 0..20u64 {
                if (user + item) % 3 == 0 {
                    continue;
                }
                let rating = if user % 2 == item % 2 { 5.0 } else { 1.0 };
                ratings.push(Rating::new(user, 100 + item, rating));
            }
        }

        ratings
    }

    #[test]
    fn small_example_scenario() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();
        let encoder = recommender.encoder();

        assert_eq!(encoder.lookup(IdSpace::User, 1), Some(0));
        assert_eq!(encoder.lookup(IdSpace::User, 2), Some(1));
        assert_eq!(encoder.lookup(IdSpace::Item, 1), Some(0));
        assert_eq!(encoder.lookup(IdSpace::Item, 2), Some(1));

        let liked = recommender.predict(1, 1).unwrap().score().unwrap();
        let disliked = recommender.predict(1, 2).unwrap().score().unwrap();

        assert!((liked - 5.0).abs() < (disliked - 5.0).abs());
    }

    #[test]
    fn empty_training_set() {
        let result = Recommender::train(&Ratings::new(), &small_hyperparameters());

        assert_eq!(result.unwrap_err(), FittingError::DatasetEmpty);
    }

    #[test]
    fn cold_start_user() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        let prediction = recommender.predict(99, 1).unwrap();

        assert!(prediction.is_cold_start());
        assert_eq!(prediction.score(), None);
        match prediction.estimate {
            Estimate::ColdStart { unknown, fallback } => {
                assert_eq!(unknown, ColdStartIdentifier::User(99));
                assert_eq!(
                    fallback,
                    recommender.model().global_bias().unwrap()
                        + recommender.model().item_bias(0).unwrap()
                );
            }
            other => panic!("Expected a cold-start estimate, got {:?}", other),
        }
    }

    #[test]
    fn cold_start_item_and_both() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        assert_eq!(
            recommender.predict(1, 7).unwrap().estimate,
            Estimate::ColdStart {
                unknown: ColdStartIdentifier::Item(7),
                fallback: recommender.model().fallback_score(Some(0), None),
            }
        );

        let both = recommender.predict(8, 9).unwrap();
        assert_eq!(
            both.score_or_fallback(),
            recommender.model().global_bias().unwrap()
        );
        match both.estimate {
            Estimate::ColdStart { unknown, .. } => {
                assert_eq!(unknown, ColdStartIdentifier::UserAndItem(8, 9))
            }
            other => panic!("Expected a cold-start estimate, got {:?}", other),
        }
    }

    #[test]
    fn evaluate_empty() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        assert_eq!(
            recommender.evaluate(&Ratings::new()).unwrap_err(),
            EvaluationError::DatasetEmpty
        );

        let unknown = Ratings::from(vec![Rating::new(9, 9, 3.0), Rating::new(8, 1, 2.0)]);
        assert_eq!(
            recommender.evaluate(&unknown).unwrap_err(),
            EvaluationError::NoKnownRatings { num_cold_start: 2 }
        );
    }

    #[test]
    fn evaluate_skips_cold_start() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        let test = Ratings::from(vec![
            Rating::new(2, 2, 1.0),
            Rating::new(3, 1, 4.0),
            Rating::new(1, 1, 5.0),
        ]);
        let evaluation = recommender.evaluate(&test).unwrap();

        assert_eq!(evaluation.metrics.num_ratings, 2);
        assert!(evaluation.metrics.rmse >= 0.0);
        assert_eq!(evaluation.cold_start, vec![Rating::new(3, 1, 4.0)]);

        let evaluation = recommender
            .evaluate(&Ratings::from(vec![
                Rating::new(9, 9, 3.0),
                Rating::new(1, 1, 5.0),
            ]))
            .unwrap();

        assert_eq!(evaluation.metrics.num_ratings, 1);
        assert_eq!(evaluation.cold_start, vec![Rating::new(9, 9, 3.0)]);
    }

    #[test]
    fn learns_preferences() {
        let data = parity_ratings();
        let hyper = Hyperparameters::new()
            .latent_dim(4)
            .num_epochs(60)
            .learning_rate(0.05)
            .num_threads(2)
            .from_seed(5);

        let recommender = Recommender::train(&data, &hyper).unwrap();

        let evaluation = recommender.evaluate(&data).unwrap();
        assert!(evaluation.cold_start.is_empty());
        assert!(
            evaluation.metrics.rmse < 1.0,
            "Training RMSE too high: {:?}",
            evaluation.metrics
        );

        // User 0 never rated item 100 + 3 = 103 ((0 + 3) % 3 == 0): odd item, dislike.
        // User 0 never rated item 106: even item, like.
        let liked = recommender.predict(0, 106).unwrap().score().unwrap();
        let disliked = recommender.predict(0, 103).unwrap().score().unwrap();
        assert!(liked > disliked);
    }

    #[test]
    fn recommend_is_deterministic_and_sorted() {
        let recommender = Recommender::train(&parity_ratings(), &small_hyperparameters()).unwrap();
        let candidates: Vec<ItemId> = (100..120).rev().collect();

        let first = recommender.recommend(4, &candidates, 5).unwrap();
        let second = recommender.recommend(4, &candidates, 5).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.items.len(), 5);
        assert!(first
            .items
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score));
    }

    #[test]
    fn recommend_returns_everything_when_top_n_is_large() {
        let recommender = Recommender::train(&parity_ratings(), &small_hyperparameters()).unwrap();
        let candidates: Vec<ItemId> = (100..120).collect();

        let recommendations = recommender.recommend(3, &candidates, 100).unwrap();

        assert_eq!(recommendations.items.len(), candidates.len());
        assert!(recommendations.cold_start_items.is_empty());

        for (position, item) in recommendations.items.iter().enumerate() {
            let prediction = recommender.predict(3, item.item_id).unwrap();
            assert_eq!(prediction.score(), Some(item.score));

            if position > 0 {
                assert!(recommendations.items[position - 1].score >= item.score);
            }
        }
    }

    /// Items 2 and 3 get identical factors, so they always tie for user 1.
    fn tied_recommender() -> Recommender {
        let ratings = Ratings::from(vec![
            Rating::new(1, 1, 5.0),
            Rating::new(1, 2, 3.0),
            Rating::new(1, 3, 3.0),
            Rating::new(2, 4, 1.0),
        ]);
        let (encoder, triplets) = Encoder::fit(&ratings);

        let model = FactorizationModel::from_factors(
            arr2(&[[1.0, 0.0], [0.0, 1.0]]),
            arr2(&[[1.0, 0.0], [0.5, 0.0], [0.5, 0.0], [0.1, 0.0]]),
        );

        Recommender {
            model,
            encoder,
            rated: triplets.to_compressed(),
        }
    }

    #[test]
    fn recommend_ties_keep_candidate_order() {
        let recommender = tied_recommender();

        let ids = |candidates: &[ItemId]| -> Vec<ItemId> {
            recommender
                .recommend(1, candidates, 4)
                .unwrap()
                .items
                .iter()
                .map(|item| item.item_id)
                .collect()
        };

        assert_eq!(ids(&[3, 4, 1, 2]), vec![1, 3, 2, 4]);
        assert_eq!(ids(&[2, 4, 1, 3]), vec![1, 2, 3, 4]);
        assert_eq!(ids(&[2, 1, 3, 2]), vec![1, 2, 3, 2]);

        let top_two = recommender.recommend(1, &[4, 3, 2, 1], 2).unwrap();
        assert_eq!(top_two.items[0].item_id, 1);
        assert_eq!(top_two.items[1].item_id, 3);
        assert_eq!(top_two.items[1].score, 0.5);
    }

    #[test]
    fn recommend_reports_failures() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        assert_eq!(
            recommender.recommend(1, &[1, 2], 0).unwrap_err(),
            PredictionError::InvalidTopN(0)
        );
        assert_eq!(
            recommender.recommend(42, &[1, 2], 5).unwrap_err(),
            PredictionError::ColdStartUser(42)
        );

        let recommendations = recommender.recommend(1, &[7, 1, 8, 2], 5).unwrap();
        assert_eq!(recommendations.cold_start_items, vec![7, 8]);
        assert_eq!(recommendations.items.len(), 2);
        assert_eq!(recommendations.items[0].item_id, 1);
    }

    #[test]
    fn unrated_candidates() {
        let recommender = Recommender::train(&small_example(), &small_hyperparameters()).unwrap();

        assert_eq!(recommender.rated_items(1), Some(vec![1, 2]));
        assert_eq!(recommender.rated_items(2), Some(vec![1]));
        assert_eq!(recommender.rated_items(3), None);

        assert_eq!(recommender.unrated_candidates(2, vec![1, 2, 3]), vec![2, 3]);
        assert_eq!(recommender.unrated_candidates(3, vec![1, 2]), vec![1, 2]);
    }

    #[test]
    fn shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Recommender>();

        let recommender = Recommender::train(&parity_ratings(), &small_hyperparameters()).unwrap();
        let candidates: Vec<ItemId> = (100..120).collect();
        let expected = recommender.recommend(0, &candidates, 3).unwrap();

        let results: Vec<_> = (0..8)
            .into_par_iter()
            .map(|_| recommender.recommend(0, &candidates, 3).unwrap())
            .collect();

        assert!(results.iter().all(|result| result == &expected));
    }
}
