use crate::{
    error::{AppError, AppResult},
    models::{Genres, SearchParams},
};

/// One AND-ed search term. Absent filters have no term at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    Id(String),
    Title(String),
    Rating(String),
    ReleasedYear(String),
    /// Matches when any of the genres is in the row's genre set.
    GenreIn(Genres),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub predicates: Vec<Predicate>,
    pub limit: u64,
    pub offset: u64,
}

impl SearchQuery {
    pub fn title(&self) -> Option<&str> {
        self.predicates.iter().find_map(|p| match p {
            Predicate::Title(title) => Some(title.as_str()),
            _ => None,
        })
    }
}

pub fn build(params: &SearchParams) -> AppResult<SearchQuery> {
    let limit = parse_non_negative("pageSize", params.page_size.as_deref())?;
    let offset = parse_non_negative("offset", params.offset.as_deref())?;

    let mut predicates = Vec::new();
    if let Some(id) = present(&params.id) {
        predicates.push(Predicate::Id(id));
    }
    if let Some(title) = present(&params.title) {
        predicates.push(Predicate::Title(title));
    }
    if let Some(rating) = present(&params.rating) {
        predicates.push(Predicate::Rating(rating));
    }
    if let Some(year) = present(&params.year) {
        predicates.push(Predicate::ReleasedYear(year));
    }

    let genres = Genres::from_values(&params.genres);
    if !genres.is_empty() {
        predicates.push(Predicate::GenreIn(genres));
    }

    Ok(SearchQuery { predicates, limit, offset })
}

fn present(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn parse_non_negative(name: &str, value: Option<&str>) -> AppResult<u64> {
    let Some(value) = value else {
        return Err(AppError::InvalidRequest(format!("{name} is required")));
    };
    let invalid =
        || AppError::InvalidRequest(format!("{name} must be a non-negative integer, got {value:?}"));
    let parsed = value.trim().parse::<u64>().map_err(|_| invalid())?;
    // SQLite binds LIMIT and OFFSET as signed 64-bit integers.
    i64::try_from(parsed).map_err(|_| invalid())?;
    Ok(parsed)
}
