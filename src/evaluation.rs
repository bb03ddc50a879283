//! Regression metrics for rating prediction.
use rayon::prelude::*;
use tracing::info;

use crate::data::TripletRatings;
use crate::{EvaluationError, RatingModel};

/// Error metrics of a model over a labelled test set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    /// Number of ratings evaluated.
    pub num_ratings: usize,
    /// Mean absolute error.
    pub mae: f32,
    /// Mean squared error.
    pub mse: f32,
    /// Root mean squared error.
    pub rmse: f32,
    /// Coefficient of determination.
    ///
    /// When every label is identical this is 1 for perfect predictions and
    /// 0 otherwise.
    pub r_squared: f32,
}

/// Score every test triple with `model` and compute regression metrics.
///
/// Fails with [`EvaluationError::DatasetEmpty`] when there is nothing to
/// evaluate; the model is never modified.
pub fn evaluate<T: RatingModel + Sync>(
    model: &T,
    test: &TripletRatings,
) -> Result<RegressionMetrics, EvaluationError> {
    if test.is_empty() {
        return Err(EvaluationError::DatasetEmpty);
    }

    let scored: Vec<Result<f32, EvaluationError>> = (0..test.len())
        .into_par_iter()
        .map(|idx| {
            let (user, item, _) = test.get(idx);

            match model.score(user, item) {
                Some(prediction) if prediction.is_finite() => Ok(prediction),
                Some(_) => Err(EvaluationError::InvalidPredictionValue { user, item }),
                None => Err(EvaluationError::IndexOutOfRange { user, item }),
            }
        })
        .collect();

    // Collected in order first, so the reported failure is the earliest one.
    let predictions = scored.into_iter().collect::<Result<Vec<f32>, _>>()?;

    let num_ratings = test.len() as f64;
    let mean_label = f64::from(test.mean_rating());

    let mut absolute_error = 0.0;
    let mut squared_error = 0.0;
    let mut total_variance = 0.0;

    for (&label, &prediction) in izip!(test.ratings(), &predictions) {
        let label = f64::from(label);
        let error = label - f64::from(prediction);

        absolute_error += error.abs();
        squared_error += error * error;
        total_variance += (label - mean_label) * (label - mean_label);
    }

    let mse = squared_error / num_ratings;
    let r_squared = if total_variance > 0.0 {
        1.0 - squared_error / total_variance
    } else if squared_error == 0.0 {
        1.0
    } else {
        0.0
    };

    let metrics = RegressionMetrics {
        num_ratings: test.len(),
        mae: (absolute_error / num_ratings) as f32,
        mse: mse as f32,
        rmse: mse.sqrt() as f32,
        r_squared: r_squared as f32,
    };

    info!(
        num_ratings = metrics.num_ratings,
        rmse = metrics.rmse,
        r_squared = metrics.r_squared,
        "evaluated model"
    );

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ItemIndex, UserIndex};

    /// Predicts `offset + user + item` for a fixed grid of users and items.
    struct AdditiveModel {
        offset: f32,
    }

    impl RatingModel for AdditiveModel {
        fn num_users(&self) -> usize {
            3
        }
        fn num_items(&self) -> usize {
            3
        }
        fn score(&self, user: UserIndex, item: ItemIndex) -> Option<f32> {
            if user < 3 && item < 3 {
                Some(self.offset + (user + item) as f32)
            } else {
                None
            }
        }
    }

    struct NanModel;

    impl RatingModel for NanModel {
        fn num_users(&self) -> usize {
            1
        }
        fn num_items(&self) -> usize {
            1
        }
        fn score(&self, _: UserIndex, _: ItemIndex) -> Option<f32> {
            Some(std::f32::NAN)
        }
    }

    fn test_set() -> TripletRatings {
        TripletRatings::from(vec![(0, 0, 0.0), (0, 2, 2.0), (1, 1, 2.0), (2, 2, 4.0)])
    }

    #[test]
    fn perfect_predictions() {
        let metrics = evaluate(&AdditiveModel { offset: 0.0 }, &test_set()).unwrap();

        assert_eq!(metrics.num_ratings, 4);
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.mae, 0.0);
        assert_eq!(metrics.r_squared, 1.0);
    }

    #[test]
    fn constant_offset() {
        let metrics = evaluate(&AdditiveModel { offset: 0.5 }, &test_set()).unwrap();

        assert!((metrics.rmse - 0.5).abs() < 1e-6);
        assert!((metrics.mae - 0.5).abs() < 1e-6);
        assert!((metrics.mse - 0.25).abs() < 1e-6);
        // Labels have mean 2 and total variance 8.
        assert!((metrics.r_squared - (1.0 - 1.0 / 8.0)).abs() < 1e-6);
    }

    #[test]
    fn constant_labels() {
        let test = TripletRatings::from(vec![(0, 1, 1.0), (1, 0, 1.0)]);

        let perfect = evaluate(&AdditiveModel { offset: 0.0 }, &test).unwrap();
        let off = evaluate(&AdditiveModel { offset: 1.0 }, &test).unwrap();

        assert_eq!(perfect.r_squared, 1.0);
        assert_eq!(off.r_squared, 0.0);
        assert!(off.rmse > 0.0);
    }

    #[test]
    fn empty_test_set() {
        let result = evaluate(&AdditiveModel { offset: 0.0 }, &TripletRatings::new(3, 3));

        assert_eq!(result.unwrap_err(), EvaluationError::DatasetEmpty);
    }

    #[test]
    fn out_of_range() {
        let test = TripletRatings::from(vec![(0, 0, 0.0), (5, 0, 1.0)]);
        let result = evaluate(&AdditiveModel { offset: 0.0 }, &test);

        assert_eq!(
            result.unwrap_err(),
            EvaluationError::IndexOutOfRange { user: 5, item: 0 }
        );
    }

    #[test]
    fn reports_first_failing_rating() {
        let test = TripletRatings::from(vec![
            (0, 0, 0.0),
            (1, 1, 2.0),
            (4, 0, 1.0),
            (0, 6, 1.0),
            (7, 7, 1.0),
        ]);
        let big = TripletRatings::from(
            (0..2000)
                .map(|idx| if idx < 1000 { (0, 0, 0.0) } else { (3 + idx, 0, 1.0) })
                .collect::<Vec<_>>(),
        );

        for _ in 0..20 {
            assert_eq!(
                evaluate(&AdditiveModel { offset: 0.0 }, &test).unwrap_err(),
                EvaluationError::IndexOutOfRange { user: 4, item: 0 }
            );
            assert_eq!(
                evaluate(&AdditiveModel { offset: 0.0 }, &big).unwrap_err(),
                EvaluationError::IndexOutOfRange { user: 1003, item: 0 }
            );
        }
    }

    #[test]
    fn non_finite_prediction() {
        let test = TripletRatings::from(vec![(0, 0, 1.0)]);

        assert_eq!(
            evaluate(&NanModel, &test).unwrap_err(),
            EvaluationError::InvalidPredictionValue { user: 0, item: 0 }
        );
    }
}
