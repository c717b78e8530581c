use anyhow::Context;
use async_trait::async_trait;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
    sea_query::{Expr, OnConflict},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    entities::movie,
    models::{Movie, NewMovie},
    query::Predicate,
};

/// Persistence operations the search pipeline depends on.
///
/// `count` and `fetch` must agree on the meaning of a predicate set so a
/// reported total matches the unpaginated result.
#[async_trait]
pub trait MovieStore: Send + Sync {
    async fn count(&self, predicates: &[Predicate]) -> anyhow::Result<u64>;

    /// Matching rows ordered by creation time, then id.
    async fn fetch(
        &self,
        predicates: &[Predicate],
        limit: u64,
        offset: u64,
    ) -> anyhow::Result<Vec<Movie>>;

    /// Always creates a new row, even when an identical one exists.
    async fn insert(&self, fields: NewMovie) -> anyhow::Result<Movie>;

    /// Creates a row keyed on the normalized title. When that key is already
    /// taken the existing row is returned untouched.
    async fn insert_cache_fill(&self, fields: NewMovie) -> anyhow::Result<Movie>;

    async fn get(&self, id: &str) -> anyhow::Result<Option<Movie>>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqlMovieStore {
    db: DatabaseConnection,
}

impl SqlMovieStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn read_back(&self, id: &str) -> anyhow::Result<Movie> {
        let row = movie::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .with_context(|| format!("movie {id} missing after insert"))?;
        Ok(Movie::try_from(row)?)
    }
}

#[async_trait]
impl MovieStore for SqlMovieStore {
    async fn count(&self, predicates: &[Predicate]) -> anyhow::Result<u64> {
        let total = movie::Entity::find().filter(condition(predicates)).count(&self.db).await?;
        Ok(total)
    }

    async fn fetch(
        &self,
        predicates: &[Predicate],
        limit: u64,
        offset: u64,
    ) -> anyhow::Result<Vec<Movie>> {
        let rows = movie::Entity::find()
            .filter(condition(predicates))
            .order_by_asc(movie::Column::CreatedAt)
            .order_by_asc(movie::Column::Id)
            .limit(limit)
            .offset(offset)
            .all(&self.db)
            .await?;

        let movies = rows.into_iter().map(Movie::try_from).collect::<Result<Vec<_>, _>>()?;
        Ok(movies)
    }

    async fn insert(&self, fields: NewMovie) -> anyhow::Result<Movie> {
        let id = Uuid::new_v4().to_string();
        movie::Entity::insert(new_row(id.clone(), fields, None))
            .exec_without_returning(&self.db)
            .await?;
        self.read_back(&id).await
    }

    async fn insert_cache_fill(&self, fields: NewMovie) -> anyhow::Result<Movie> {
        let Some(key) = fields.fill_key() else {
            return self.insert(fields).await;
        };

        let row = new_row(Uuid::new_v4().to_string(), fields, Some(key.clone()));
        let inserted = movie::Entity::insert(row)
            .on_conflict(OnConflict::column(movie::Column::FillKey).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        let row = movie::Entity::find()
            .filter(movie::Column::FillKey.eq(key.as_str()))
            .one(&self.db)
            .await?
            .with_context(|| format!("no movie for fill key {key:?} after insert"))?;

        if inserted == 0 {
            debug!(fill_key = %key, id = %row.id, "cache fill already persisted");
        }

        Ok(Movie::try_from(row)?)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Movie>> {
        let row = movie::Entity::find_by_id(id.to_string()).one(&self.db).await?;
        Ok(row.map(Movie::try_from).transpose()?)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.db.ping().await?;
        Ok(())
    }
}

fn condition(predicates: &[Predicate]) -> Condition {
    let mut cond = Condition::all();
    for predicate in predicates {
        cond = match predicate {
            Predicate::Id(id) => cond.add(movie::Column::Id.eq(id.as_str())),
            Predicate::Title(title) => cond.add(movie::Column::Title.eq(title.as_str())),
            Predicate::Rating(rating) => cond.add(movie::Column::Rating.eq(rating.as_str())),
            Predicate::ReleasedYear(year) => {
                cond.add(movie::Column::ReleasedYear.eq(year.as_str()))
            },
            // Genres are stored comma-joined without padding, so wrapping both
            // sides in delimiters gives an exact member match.
            Predicate::GenreIn(genres) => {
                let any = genres.iter().fold(Condition::any(), |any, genre| {
                    any.add(Expr::cust_with_values(
                        "instr(',' || genres || ',', ?) > 0",
                        [format!(",{genre},")],
                    ))
                });
                cond.add(any)
            },
        };
    }
    cond
}

fn new_row(id: String, fields: NewMovie, fill_key: Option<String>) -> movie::ActiveModel {
    let now = now_sec();
    movie::ActiveModel {
        id: Set(id),
        title: Set(fields.title),
        rating: Set(fields.rating),
        released_year: Set(fields.released_year),
        genres: Set(fields.genres.to_column()),
        fill_key: Set(fill_key),
        created_at: Set(now),
        last_modified_at: Set(now),
    }
}

fn now_sec() -> i64 {
    jiff::Timestamp::now().as_second()
}
