use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use axum_extra::extract::Query;

use crate::{
    AppState,
    error::AppResult,
    models::{CreateMovieRequest, HealthReport, Movie, MovieList, SearchParams},
};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/movies", get(search_movies).post(create_movie))
        .route("/movies/{id}", get(get_movie))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn search_movies(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<MovieList>> {
    let list = state.movies.search(&params).await?;
    Ok(Json(list))
}

pub async fn create_movie(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMovieRequest>,
) -> AppResult<(StatusCode, Json<Movie>)> {
    let movie = state.movies.create(req).await?;
    Ok((StatusCode::CREATED, Json(movie)))
}

pub async fn get_movie(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Movie>> {
    Ok(Json(state.movies.get(&id).await?))
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.movies.health().await;
    let status =
        if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}
