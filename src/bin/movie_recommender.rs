//! Train a rating model on MovieLens-style CSV files, report its test error,
//! score one user and movie, and list the user's best unrated movies.
extern crate clap;
extern crate failure;
extern crate mfr;
extern crate serde_json;
extern crate tracing;
extern crate tracing_subscriber;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mfr::datasets::{Catalog, CsvCatalog, CsvRatingSource, RatingSource};
use mfr::encoding::IdSpace;
use mfr::models::factorization::Hyperparameters;
use mfr::ranking::DEFAULT_TOP_N;
use mfr::recommender::{Estimate, Recommender};
use mfr::{ItemId, UserId};

#[derive(Debug, Parser)]
#[command(name = "movie_recommender", about = "Matrix factorization movie recommender")]
struct Args {
    /// Training ratings (userId,movieId,rating[,timestamp]).
    #[arg(long)]
    train: PathBuf,

    /// Held-out ratings used to report RMSE and R-squared.
    #[arg(long)]
    test: Option<PathBuf>,

    /// Movie catalog (movieId,title[,genres]). Without it, every movie seen
    /// in training is a candidate and is shown by id.
    #[arg(long)]
    movies: Option<PathBuf>,

    /// JSON file with hyperparameters; missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rank of the factorization.
    #[arg(long)]
    latent_dim: Option<usize>,

    /// Number of passes over the training ratings.
    #[arg(long)]
    num_epochs: Option<usize>,

    /// SGD learning rate.
    #[arg(long)]
    learning_rate: Option<f32>,

    /// L2 penalty on factors and biases.
    #[arg(long)]
    l2_penalty: Option<f32>,

    /// Number of training threads.
    #[arg(long)]
    threads: Option<usize>,

    /// Random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// User to score and recommend for.
    #[arg(long, default_value_t = 6)]
    user: UserId,

    /// Movie whose rating is predicted for the user.
    #[arg(long, default_value_t = 10)]
    movie: ItemId,

    /// Number of movies to recommend.
    #[arg(long, default_value_t = DEFAULT_TOP_N)]
    top_n: usize,

    /// A movie is recommended when its predicted rating, rounded to one
    /// decimal, is above this.
    #[arg(long, default_value_t = 3.5)]
    threshold: f32,

    /// Skip unparseable rating rows instead of failing.
    #[arg(long)]
    skip_malformed: bool,
}

/// Whether a predicted rating, rounded to one decimal place as it is shown,
/// clears `threshold`.
fn is_recommended(score: f32, threshold: f32) -> bool {
    (score * 10.0).round() / 10.0 > threshold
}

fn hyperparameters(args: &Args) -> Result<Hyperparameters, failure::Error> {
    let mut hyper = match args.config {
        Some(ref path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => Hyperparameters::new(),
    };

    if let Some(latent_dim) = args.latent_dim {
        hyper = hyper.latent_dim(latent_dim);
    }
    if let Some(num_epochs) = args.num_epochs {
        hyper = hyper.num_epochs(num_epochs);
    }
    if let Some(learning_rate) = args.learning_rate {
        hyper = hyper.learning_rate(learning_rate);
    }
    if let Some(l2_penalty) = args.l2_penalty {
        hyper = hyper.l2_penalty(l2_penalty);
    }
    if let Some(threads) = args.threads {
        hyper = hyper.num_threads(threads);
    }
    if let Some(seed) = args.seed {
        hyper = hyper.from_seed(seed);
    }

    Ok(hyper)
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let hyper = hyperparameters(&args)?;

    info!(?hyper, "training configuration");

    let train = CsvRatingSource::new(&args.train)
        .skip_malformed(args.skip_malformed)
        .query_ratings()?;
    let recommender = Recommender::train(&train, &hyper)?;

    if let Some(ref path) = args.test {
        let test = CsvRatingSource::new(path)
            .skip_malformed(args.skip_malformed)
            .query_ratings()?;
        let evaluation = recommender.evaluate(&test)?;
        let metrics = evaluation.metrics;

        println!(
            "Model evaluation over {} ratings: RMSE {:.4}, R-squared {:.4}",
            metrics.num_ratings, metrics.rmse, metrics.r_squared
        );
        if !evaluation.cold_start.is_empty() {
            println!(
                "{} test ratings with users or movies unseen in training were not scored.",
                evaluation.cold_start.len()
            );
        }
    }

    let catalog = match args.movies {
        Some(ref path) => Some(CsvCatalog::open(path)?),
        None => None,
    };

    let title = |item_id: ItemId| -> Result<String, failure::Error> {
        let entry = match catalog {
            Some(ref catalog) => catalog.get_by_id(item_id)?,
            None => None,
        };

        Ok(entry
            .map(|entry| entry.title)
            .unwrap_or_else(|| format!("movie {}", item_id)))
    };

    let prediction = recommender.predict(args.user, args.movie)?;
    let score = prediction.score_or_fallback();

    if let Estimate::ColdStart { unknown, .. } = prediction.estimate {
        println!(
            "{:?} did not appear in training; falling back to the bias estimate.",
            unknown
        );
    }

    println!(
        "Predicted rating (1 to 5 stars) of {} by user {}: {:.1}",
        title(args.movie)?,
        args.user,
        score
    );
    if is_recommended(score, args.threshold) {
        println!("Movie {} is recommended for user {}.", args.movie, args.user);
    } else {
        println!("Movie {} is not recommended for user {}.", args.movie, args.user);
    }

    let all_items: Vec<ItemId> = match catalog {
        Some(ref catalog) => catalog
            .get_all()?
            .into_iter()
            .map(|entry| entry.item_id)
            .collect(),
        None => recommender.encoder().table(IdSpace::Item).raw_ids().to_vec(),
    };
    let candidates = recommender.unrated_candidates(args.user, all_items);
    let recommendations = recommender.recommend(args.user, &candidates, args.top_n)?;

    println!("Top {} movies for user {}:", args.top_n, args.user);
    for (rank, item) in recommendations.items.iter().enumerate() {
        println!(
            "{:>3}. {} (predicted {:.2})",
            rank + 1,
            title(item.item_id)?,
            item.score
        );
    }

    if !recommendations.cold_start_items.is_empty() {
        info!(
            num_unranked = recommendations.cold_start_items.len(),
            "catalog movies without training ratings were not ranked"
        );
    }

    Ok(())
}
