use std::collections::BTreeSet;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{entities::movie, query::SearchQuery};

const GENRE_DELIMITER: &str = ",";

/// Genre names attached to a movie.
///
/// Stored as a single comma-joined column, so values are split on the
/// delimiter and trimmed on the way in. Blank entries never survive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Genres(BTreeSet<String>);

impl Genres {
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = values
            .into_iter()
            .flat_map(|value| {
                value
                    .as_ref()
                    .split(GENRE_DELIMITER)
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        Self(set)
    }

    pub fn from_column(column: Option<&str>) -> Self {
        column.map(|c| Self::from_values([c])).unwrap_or_default()
    }

    /// Column value for storage; `None` rather than an empty string.
    pub fn to_column(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        let joined = self.0.iter().map(String::as_str).collect::<Vec<_>>();
        Some(joined.join(GENRE_DELIMITER))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for Genres {
    fn from(values: Vec<String>) -> Self {
        Self::from_values(values)
    }
}

impl From<Genres> for Vec<String> {
    fn from(genres: Genres) -> Self {
        genres.0.into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: String,
    pub title: String,
    pub genres: Genres,
    pub rating: String,
    pub released_year: String,
    pub created_at: Timestamp,
    pub last_modified_at: Timestamp,
}

/// Absent text columns surface as empty strings and absent genres as an
/// empty set. Timestamps are always written by the store.
impl TryFrom<movie::Model> for Movie {
    type Error = jiff::Error;

    fn try_from(row: movie::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            genres: Genres::from_column(row.genres.as_deref()),
            id: row.id,
            title: row.title.unwrap_or_default(),
            rating: row.rating.unwrap_or_default(),
            released_year: row.released_year.unwrap_or_default(),
            created_at: Timestamp::from_second(row.created_at)?,
            last_modified_at: Timestamp::from_second(row.last_modified_at)?,
        })
    }
}

/// Field values for a movie that does not exist yet. Identity and
/// timestamps are assigned by the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewMovie {
    pub title: Option<String>,
    pub rating: Option<String>,
    pub released_year: Option<String>,
    pub genres: Genres,
}

impl NewMovie {
    /// Key used to deduplicate cache-filled rows.
    pub fn fill_key(&self) -> Option<String> {
        self.title.as_deref().map(normalize_title).filter(|k| !k.is_empty())
    }
}

pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Search filters as received from the caller. Pagination stays textual
/// until the query builder validates it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub id: Option<String>,
    pub title: Option<String>,
    pub rating: Option<String>,
    pub year: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub page_size: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMovieRequest {
    pub title: String,
    pub rating: Option<String>,
    pub released_year: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMetadata {
    pub offset: u64,
    pub page_size: u64,
    pub total_size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MovieList {
    pub data: Vec<Movie>,
    pub metadata: ListMetadata,
}

impl MovieList {
    pub fn assemble(data: Vec<Movie>, total_size: u64, query: &SearchQuery) -> Self {
        Self {
            data,
            metadata: ListMetadata {
                offset: query.offset,
                page_size: query.limit,
                total_size,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: Timestamp,
    pub githash: &'static str,
    pub build_time_stamp: &'static str,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Report stamped with the build the binary was compiled from.
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let healthy = checks.iter().all(|c| c.healthy);
        Self {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp: Timestamp::now(),
            githash: option_env!("GIT_HASH").unwrap_or_default(),
            build_time_stamp: option_env!("BUILD_TIMESTAMP").unwrap_or_default(),
            checks,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.healthy)
    }
}
