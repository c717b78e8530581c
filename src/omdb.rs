use std::{num::NonZeroU32, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use serde::Deserialize;
use tracing::debug;

use crate::provider::{ExternalMovie, MetadataProvider};

const NOT_FOUND_MESSAGE: &str = "Movie not found!";
const MISSING_VALUE: &str = "N/A";

pub struct OmdbClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OmdbClient {
    pub fn new(client: reqwest::Client, api_key: String, base_url: String, rps: u32) -> Self {
        if api_key.trim().is_empty() {
            tracing::warn!("no OMDB_API_KEY provided, title lookups will report not found");
        }

        let per_second = NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));
        Self { client, api_key, base_url, limiter }
    }
}

#[async_trait]
impl MetadataProvider for OmdbClient {
    async fn lookup_by_title(&self, title: &str) -> anyhow::Result<Option<ExternalMovie>> {
        if self.api_key.trim().is_empty() {
            return Ok(None);
        }

        self.limiter.until_ready().await;

        let url = format!("{}/", self.base_url.trim_end_matches('/'));
        let resp: OmdbResponse = self
            .client
            .get(url)
            .query(&[("apikey", self.api_key.as_str()), ("t", title), ("type", "movie")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let found = resp.into_lookup()?;
        debug!(title = %title, found = found.is_some(), "omdb title lookup");
        Ok(found)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OmdbResponse {
    response: String,
    title: Option<String>,
    year: Option<String>,
    genre: Option<String>,
    #[serde(rename = "imdbRating")]
    imdb_rating: Option<String>,
    error: Option<String>,
}

impl OmdbResponse {
    fn into_lookup(self) -> anyhow::Result<Option<ExternalMovie>> {
        if !self.response.eq_ignore_ascii_case("true") {
            let error = self.error.unwrap_or_else(|| "unknown error".to_string());
            if error == NOT_FOUND_MESSAGE {
                return Ok(None);
            }
            anyhow::bail!("omdb rejected lookup: {error}");
        }

        let title = known(self.title).context("omdb match has no title")?;
        Ok(Some(ExternalMovie {
            title,
            rating: known(self.imdb_rating),
            released_year: known(self.year),
            genre: known(self.genre),
        }))
    }
}

fn known(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty() && v != MISSING_VALUE)
}
