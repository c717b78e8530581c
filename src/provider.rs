use async_trait::async_trait;

use crate::models::{Genres, NewMovie};

/// Best match returned by an external metadata source.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalMovie {
    pub title: String,
    pub rating: Option<String>,
    pub released_year: Option<String>,
    pub genre: Option<String>,
}

impl ExternalMovie {
    pub fn into_new_movie(self) -> NewMovie {
        NewMovie {
            title: Some(self.title),
            rating: self.rating,
            released_year: self.released_year,
            genres: Genres::from_values(self.genre),
        }
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// `Ok(None)` when the provider has no match for the title.
    async fn lookup_by_title(&self, title: &str) -> anyhow::Result<Option<ExternalMovie>>;
}
