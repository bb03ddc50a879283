//! Sources of ratings and catalog entries.
//!
//! The core of the crate consumes these through the [`RatingSource`] and
//! [`Catalog`] traits, so the storage behind them can be swapped or faked
//! in tests. Failures are always reported to the caller.
use std::collections::HashMap;
#[cfg(feature = "csv")]
use std::path::{Path, PathBuf};

#[cfg(feature = "csv")]
use tracing::{info, warn};

use crate::data::Ratings;
#[cfg(feature = "csv")]
use crate::data::Rating;
use crate::ItemId;

/// Dataset error types.
#[derive(Debug, Fail, PartialEq)]
pub enum DatasetError {
    /// The backing store could not be read.
    #[fail(display = "Cannot read from {}: {}", source, reason)]
    UpstreamUnavailable {
        /// Which store failed.
        source: String,
        /// Why it failed.
        reason: String,
    },
    /// A record could not be parsed into the expected fields.
    #[fail(display = "Malformed record in {} at line {}: {}", source, line, reason)]
    MalformedRecord {
        /// Which store the record came from.
        source: String,
        /// One-based line number, 0 if unknown.
        line: u64,
        /// What was wrong with it.
        reason: String,
    },
}

/// A catalog entry, used only to present recommended items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// The raw item identifier.
    #[serde(rename = "movieId", alias = "item_id", alias = "itemId")]
    pub item_id: ItemId,
    /// Display name.
    pub title: String,
    /// Pipe-separated genres, possibly empty.
    #[serde(default)]
    pub genres: String,
}

/// Supplies the ratings a model is trained or evaluated on.
pub trait RatingSource {
    /// Fetch all ratings, in order.
    fn query_ratings(&self) -> Result<Ratings, DatasetError>;
}

/// Looks up catalog entries for presentation.
pub trait Catalog {
    /// The entry for `item_id`, if the catalog has one.
    fn get_by_id(&self, item_id: ItemId) -> Result<Option<CatalogEntry>, DatasetError>;
    /// All entries, in catalog order.
    fn get_all(&self) -> Result<Vec<CatalogEntry>, DatasetError>;
}

/// Ratings already in memory are their own source.
impl RatingSource for Ratings {
    fn query_ratings(&self) -> Result<Ratings, DatasetError> {
        Ok(self.clone())
    }
}

/// A catalog held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<ItemId, usize>,
}

impl InMemoryCatalog {
    /// Build a catalog from `entries`. If an identifier repeats, the first
    /// entry wins lookups.
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());

        for (position, entry) in entries.iter().enumerate() {
            index.entry(entry.item_id).or_insert(position);
        }

        InMemoryCatalog { entries, index }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Catalog for InMemoryCatalog {
    fn get_by_id(&self, item_id: ItemId) -> Result<Option<CatalogEntry>, DatasetError> {
        Ok(self
            .index
            .get(&item_id)
            .map(|&position| self.entries[position].clone()))
    }

    fn get_all(&self) -> Result<Vec<CatalogEntry>, DatasetError> {
        Ok(self.entries.clone())
    }
}

#[cfg(feature = "csv")]
fn csv_error(path: &Path, error: csv::Error) -> DatasetError {
    let source = path.display().to_string();

    if error.is_io_error() {
        DatasetError::UpstreamUnavailable {
            source,
            reason: error.to_string(),
        }
    } else {
        DatasetError::MalformedRecord {
            source,
            line: error.position().map(|position| position.line()).unwrap_or(0),
            reason: error.to_string(),
        }
    }
}

/// Read every record of a CSV file with a header row, passing each
/// record's line number and deserialized value to `sink`.
///
/// Rows that cannot be parsed, including rows with the wrong number of
/// fields or invalid UTF-8, reach `sink` as `MalformedRecord` errors and
/// reading carries on. Only I/O failures abort the read directly.
#[cfg(feature = "csv")]
fn read_csv<T, F>(path: &Path, delimiter: u8, mut sink: F) -> Result<(), DatasetError>
where
    T: serde::de::DeserializeOwned,
    F: FnMut(u64, Result<T, DatasetError>) -> Result<(), DatasetError>,
{
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .map_err(|error| csv_error(path, error))?;

    let headers = reader
        .headers()
        .map_err(|error| csv_error(path, error))?
        .clone();
    let mut record = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {
                let line = record.position().map(|position| position.line()).unwrap_or(0);
                let value = record
                    .deserialize(Some(&headers))
                    .map_err(|error| csv_error(path, error));

                sink(line, value)?;
            }
            Ok(false) => return Ok(()),
            Err(error) => {
                if error.is_io_error() {
                    return Err(csv_error(path, error));
                }

                let line = error.position().map(|position| position.line()).unwrap_or(0);
                sink(line, Err(csv_error(path, error)))?;
            }
        }
    }
}

/// Ratings stored in a CSV file with a `userId,movieId,rating[,timestamp]`
/// header, as in the MovieLens datasets.
#[cfg(feature = "csv")]
#[derive(Clone, Debug)]
pub struct CsvRatingSource {
    path: PathBuf,
    delimiter: u8,
    skip_malformed: bool,
}

#[cfg(feature = "csv")]
impl CsvRatingSource {
    /// Read ratings from `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        CsvRatingSource {
            path: path.as_ref().to_owned(),
            delimiter: b',',
            skip_malformed: false,
        }
    }

    /// Set the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Skip malformed rows with a warning instead of failing.
    pub fn skip_malformed(mut self, skip_malformed: bool) -> Self {
        self.skip_malformed = skip_malformed;
        self
    }
}

#[cfg(feature = "csv")]
impl RatingSource for CsvRatingSource {
    fn query_ratings(&self) -> Result<Ratings, DatasetError> {
        let mut ratings = Ratings::new();
        let mut num_skipped = 0;

        read_csv(&self.path, self.delimiter, |line, value: Result<Rating, _>| {
            let checked = value.and_then(|rating| {
                if rating.rating().is_finite() {
                    Ok(rating)
                } else {
                    Err(DatasetError::MalformedRecord {
                        source: self.path.display().to_string(),
                        line,
                        reason: format!("non-finite rating {}", rating.rating()),
                    })
                }
            });

            match checked {
                Ok(rating) => ratings.push(rating),
                Err(error @ DatasetError::MalformedRecord { .. }) if self.skip_malformed => {
                    warn!(%error, "skipping malformed rating");
                    num_skipped += 1;
                }
                Err(error) => return Err(error),
            }

            Ok(())
        })?;

        info!(
            path = %self.path.display(),
            num_ratings = ratings.len(),
            num_skipped,
            "loaded ratings"
        );

        Ok(ratings)
    }
}

/// A catalog loaded from a CSV file with a `movieId,title[,genres]` header.
#[cfg(feature = "csv")]
#[derive(Clone, Debug)]
pub struct CsvCatalog {
    catalog: InMemoryCatalog,
}

#[cfg(feature = "csv")]
impl CsvCatalog {
    /// Load the whole catalog from `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let mut entries = Vec::new();

        read_csv(path, b',', |_, value: Result<CatalogEntry, _>| {
            entries.push(value?);
            Ok(())
        })?;

        info!(path = %path.display(), num_entries = entries.len(), "loaded catalog");

        Ok(CsvCatalog {
            catalog: InMemoryCatalog::new(entries),
        })
    }
}

#[cfg(feature = "csv")]
impl Catalog for CsvCatalog {
    fn get_by_id(&self, item_id: ItemId) -> Result<Option<CatalogEntry>, DatasetError> {
        self.catalog.get_by_id(item_id)
    }

    fn get_all(&self) -> Result<Vec<CatalogEntry>, DatasetError> {
        self.catalog.get_all()
    }
}
