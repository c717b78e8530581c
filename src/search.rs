use std::{sync::Arc, time::Instant};

use tracing::{debug, info, warn};

use crate::{
    error::{AppError, AppResult, Stage},
    models::{
        CreateMovieRequest, Genres, HealthCheck, HealthReport, Movie, MovieList, NewMovie,
        SearchParams,
    },
    provider::MetadataProvider,
    query,
    store::MovieStore,
};

/// Movie lookups against the store, with a provider fallback that fills
/// the store on a title miss.
///
/// Every collaborator call is awaited inside the returned future, so
/// dropping a search cancels whatever step it is on.
#[derive(Clone)]
pub struct MovieSearch {
    store: Arc<dyn MovieStore>,
    provider: Arc<dyn MetadataProvider>,
}

impl MovieSearch {
    pub fn new(store: Arc<dyn MovieStore>, provider: Arc<dyn MetadataProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn search(&self, params: &SearchParams) -> AppResult<MovieList> {
        let query = query::build(params)?;
        debug!(
            predicates = query.predicates.len(),
            limit = query.limit,
            offset = query.offset,
            "searching movies"
        );

        let total =
            self.store.count(&query.predicates).await.map_err(AppError::upstream(Stage::Count))?;
        let movies = self
            .store
            .fetch(&query.predicates, query.limit, query.offset)
            .await
            .map_err(AppError::upstream(Stage::Fetch))?;

        if !movies.is_empty() {
            debug!(total = total, returned = movies.len(), "served from store");
            return Ok(MovieList::assemble(movies, total, &query));
        }

        let Some(title) = query.title() else {
            debug!("no local match and no title to look up");
            return Ok(MovieList::assemble(Vec::new(), total, &query));
        };

        match self.fill_from_provider(title).await? {
            Some(movie) => Ok(MovieList::assemble(vec![movie], total + 1, &query)),
            None => Ok(MovieList::assemble(Vec::new(), total, &query)),
        }
    }

    async fn fill_from_provider(&self, title: &str) -> AppResult<Option<Movie>> {
        debug!(title = %title, "no local match, consulting provider");

        let found = self
            .provider
            .lookup_by_title(title)
            .await
            .map_err(AppError::upstream(Stage::Lookup))?;
        let Some(external) = found else {
            debug!(title = %title, "provider has no match");
            return Ok(None);
        };

        let movie = self
            .store
            .insert_cache_fill(external.into_new_movie())
            .await
            .map_err(AppError::upstream(Stage::Insert))?;

        info!(title = %title, id = %movie.id, "cached movie from provider");
        Ok(Some(movie))
    }

    pub async fn create(&self, req: CreateMovieRequest) -> AppResult<Movie> {
        if req.title.trim().is_empty() {
            return Err(AppError::InvalidRequest("title is required".to_string()));
        }

        let fields = NewMovie {
            title: Some(req.title),
            rating: req.rating.filter(|r| !r.trim().is_empty()),
            released_year: req.released_year.filter(|y| !y.trim().is_empty()),
            genres: Genres::from_values(req.genres),
        };

        let movie = self.store.insert(fields).await.map_err(AppError::upstream(Stage::Insert))?;
        debug!(id = %movie.id, "created movie");
        Ok(movie)
    }

    pub async fn get(&self, id: &str) -> AppResult<Movie> {
        self.store
            .get(id)
            .await
            .map_err(AppError::upstream(Stage::Read))?
            .ok_or_else(|| AppError::NotFound(format!("movie {id}")))
    }

    pub async fn health(&self) -> HealthReport {
        let started = Instant::now();
        let result = self.store.ping().await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if let Err(err) = &result {
            warn!(error = %err, "database health check failed");
        }

        HealthReport::new(vec![HealthCheck {
            name: "database".to_string(),
            healthy: result.is_ok(),
            duration_ms,
            error: result.err().map(|e| format!("{e:#}")),
        }])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        db,
        models::normalize_title,
        provider::ExternalMovie,
        query::Predicate,
        store::SqlMovieStore,
    };

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Count(Vec<Predicate>),
        Fetch(Vec<Predicate>),
        Insert,
    }

    #[derive(Default)]
    struct FakeStore {
        movies: Mutex<Vec<Movie>>,
        calls: Mutex<Vec<Call>>,
        fail: Option<Stage>,
    }

    impl FakeStore {
        fn failing(stage: Stage) -> Self {
            Self { fail: Some(stage), ..Default::default() }
        }

        fn seed(&self, title: &str, genres: &[&str]) {
            let fields = NewMovie {
                title: Some(title.to_string()),
                rating: Some("7.5".to_string()),
                released_year: Some("1999".to_string()),
                genres: Genres::from_values(genres),
            };
            self.push(fields);
        }

        fn push(&self, fields: NewMovie) -> Movie {
            let mut movies = self.movies.lock().unwrap();
            let now = jiff::Timestamp::now();
            let movie = Movie {
                id: format!("fake-{}", movies.len() + 1),
                title: fields.title.unwrap_or_default(),
                genres: fields.genres,
                rating: fields.rating.unwrap_or_default(),
                released_year: fields.released_year.unwrap_or_default(),
                created_at: now,
                last_modified_at: now,
            };
            movies.push(movie.clone());
            movie
        }

        fn check(&self, stage: Stage) -> anyhow::Result<()> {
            match self.fail {
                Some(failing) if failing == stage => anyhow::bail!("store unavailable"),
                _ => Ok(()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn matching(&self, predicates: &[Predicate]) -> Vec<Movie> {
            self.movies
                .lock()
                .unwrap()
                .iter()
                .filter(|m| predicates.iter().all(|p| matches(p, m)))
                .cloned()
                .collect()
        }
    }

    fn matches(predicate: &Predicate, movie: &Movie) -> bool {
        match predicate {
            Predicate::Id(id) => &movie.id == id,
            Predicate::Title(title) => &movie.title == title,
            Predicate::Rating(rating) => &movie.rating == rating,
            Predicate::ReleasedYear(year) => &movie.released_year == year,
            Predicate::GenreIn(genres) => {
                genres.iter().any(|g| movie.genres.iter().any(|have| have == g))
            },
        }
    }

    #[async_trait]
    impl MovieStore for FakeStore {
        async fn count(&self, predicates: &[Predicate]) -> anyhow::Result<u64> {
            self.calls.lock().unwrap().push(Call::Count(predicates.to_vec()));
            self.check(Stage::Count)?;
            Ok(self.matching(predicates).len() as u64)
        }

        async fn fetch(
            &self,
            predicates: &[Predicate],
            limit: u64,
            offset: u64,
        ) -> anyhow::Result<Vec<Movie>> {
            self.calls.lock().unwrap().push(Call::Fetch(predicates.to_vec()));
            self.check(Stage::Fetch)?;
            Ok(self
                .matching(predicates)
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        }

        async fn insert(&self, fields: NewMovie) -> anyhow::Result<Movie> {
            self.calls.lock().unwrap().push(Call::Insert);
            self.check(Stage::Insert)?;
            Ok(self.push(fields))
        }

        async fn insert_cache_fill(&self, fields: NewMovie) -> anyhow::Result<Movie> {
            self.calls.lock().unwrap().push(Call::Insert);
            self.check(Stage::Insert)?;
            let key = fields.fill_key();
            let existing = self
                .movies
                .lock()
                .unwrap()
                .iter()
                .find(|m| key.as_deref() == Some(normalize_title(&m.title).as_str()))
                .cloned();
            Ok(existing.unwrap_or_else(|| self.push(fields)))
        }

        async fn get(&self, id: &str) -> anyhow::Result<Option<Movie>> {
            self.check(Stage::Read)?;
            Ok(self.movies.lock().unwrap().iter().find(|m| m.id == id).cloned())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            self.check(Stage::Read)
        }
    }

    enum Reply {
        Found(ExternalMovie),
        NotFound,
        Fail,
    }

    struct FakeProvider {
        reply: Reply,
        lookups: AtomicUsize,
    }

    impl FakeProvider {
        fn new(reply: Reply) -> Self {
            Self { reply, lookups: AtomicUsize::new(0) }
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataProvider for FakeProvider {
        async fn lookup_by_title(&self, _title: &str) -> anyhow::Result<Option<ExternalMovie>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Found(movie) => Ok(Some(movie.clone())),
                Reply::NotFound => Ok(None),
                Reply::Fail => anyhow::bail!("provider timed out"),
            }
        }
    }

    fn dune() -> ExternalMovie {
        ExternalMovie {
            title: "Dune".to_string(),
            rating: Some("8.0".to_string()),
            released_year: Some("2021".to_string()),
            genre: Some("Sci-Fi".to_string()),
        }
    }

    fn page(page_size: &str, offset: &str) -> SearchParams {
        SearchParams {
            page_size: Some(page_size.to_string()),
            offset: Some(offset.to_string()),
            ..Default::default()
        }
    }

    fn titled(title: &str) -> SearchParams {
        SearchParams { title: Some(title.to_string()), ..page("10", "0") }
    }

    fn setup(store: FakeStore, reply: Reply) -> (Arc<FakeStore>, Arc<FakeProvider>, MovieSearch) {
        let store = Arc::new(store);
        let provider = Arc::new(FakeProvider::new(reply));
        let search = MovieSearch::new(store.clone(), provider.clone());
        (store, provider, search)
    }

    #[tokio::test]
    async fn no_filters_search_the_whole_table() {
        let (store, _, search) = setup(FakeStore::default(), Reply::NotFound);
        for title in ["A", "B", "C"] {
            store.seed(title, &[]);
        }

        let result = search.search(&page("10", "0")).await.unwrap();

        assert_eq!(result.data.len(), 3);
        assert_eq!(result.metadata.total_size, 3);
        assert_eq!(store.calls(), vec![Call::Count(vec![]), Call::Fetch(vec![])]);
    }

    #[tokio::test]
    async fn count_and_fetch_use_identical_predicates() {
        let (store, _, search) = setup(FakeStore::default(), Reply::NotFound);
        store.seed("Heat", &["Crime"]);

        let params = SearchParams {
            title: Some("Heat".to_string()),
            year: Some("1999".to_string()),
            genres: vec!["Crime".to_string()],
            ..page("10", "0")
        };
        search.search(&params).await.unwrap();

        let calls = store.calls();
        let [Call::Count(counted), Call::Fetch(fetched)] = calls.as_slice() else {
            panic!("unexpected calls: {calls:?}");
        };
        assert_eq!(counted, fetched);
        assert_eq!(counted.len(), 3);
    }

    #[tokio::test]
    async fn local_hit_never_consults_provider() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));
        store.seed("Dune", &["Sci-Fi"]);

        let result = search.search(&titled("Dune")).await.unwrap();

        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0].id, "fake-1");
        assert_eq!(result.metadata.total_size, 1);
        assert_eq!(provider.lookups(), 0);
    }

    #[tokio::test]
    async fn miss_without_title_returns_empty() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));
        store.seed("Heat", &["Crime"]);

        let params = SearchParams { rating: Some("9.9".to_string()), ..page("10", "0") };
        let result = search.search(&params).await.unwrap();

        assert!(result.data.is_empty());
        assert_eq!(result.metadata.total_size, 0);
        assert_eq!(provider.lookups(), 0);
        assert!(!store.calls().contains(&Call::Insert));
    }

    #[tokio::test]
    async fn title_miss_is_filled_from_provider() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));

        let result = search.search(&titled("Dune")).await.unwrap();

        assert_eq!(provider.lookups(), 1);
        assert_eq!(result.metadata.total_size, 1);
        assert_eq!(result.metadata.page_size, 10);
        assert_eq!(result.metadata.offset, 0);
        let [movie] = result.data.as_slice() else {
            panic!("expected one movie, got {:?}", result.data);
        };
        assert!(!movie.id.is_empty());
        assert_eq!(movie.title, "Dune");
        assert_eq!(movie.rating, "8.0");
        assert_eq!(movie.released_year, "2021");
        assert_eq!(movie.genres, Genres::from_values(["Sci-Fi"]));
        assert_eq!(store.movies.lock().unwrap().as_slice(), std::slice::from_ref(movie));
    }

    #[tokio::test]
    async fn provider_not_found_is_an_empty_success() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::NotFound);

        let result = search.search(&titled("Nonexistent")).await.unwrap();

        assert!(result.data.is_empty());
        assert_eq!(result.metadata.total_size, 0);
        assert_eq!(provider.lookups(), 1);
        assert!(!store.calls().contains(&Call::Insert));
    }

    #[tokio::test]
    async fn provider_failure_fails_the_search() {
        let (store, _, search) = setup(FakeStore::default(), Reply::Fail);

        let err = search.search(&titled("Dune")).await.unwrap_err();

        assert!(matches!(err, AppError::Upstream { stage: Stage::Lookup, .. }), "{err}");
        assert!(!store.calls().contains(&Call::Insert));
    }

    #[tokio::test]
    async fn genre_search_paginates_without_enrichment() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));
        for i in 0..4 {
            store.seed(&format!("Comedy {i}"), &["Comedy"]);
        }
        for i in 0..3 {
            store.seed(&format!("Drama {i}"), &["Drama"]);
        }
        store.seed("Scream", &["Horror"]);

        let params = SearchParams {
            genres: vec!["Comedy".to_string(), "Drama".to_string()],
            ..page("5", "0")
        };
        let result = search.search(&params).await.unwrap();

        assert_eq!(result.data.len(), 5);
        assert_eq!(result.metadata.total_size, 7);
        assert_eq!(provider.lookups(), 0);
    }

    #[tokio::test]
    async fn invalid_page_size_makes_no_store_calls() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));

        let params = SearchParams { title: Some("Dune".to_string()), ..page("abc", "0") };
        let err = search.search(&params).await.unwrap_err();

        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert!(store.calls().is_empty());
        assert_eq!(provider.lookups(), 0);
    }

    #[tokio::test]
    async fn empty_page_with_title_consults_provider() {
        let (store, provider, search) = setup(FakeStore::default(), Reply::Found(dune()));
        store.seed("Dune", &["Sci-Fi"]);

        let params = SearchParams { title: Some("Dune".to_string()), ..page("10", "5") };
        let result = search.search(&params).await.unwrap();

        assert_eq!(provider.lookups(), 1);
        assert_eq!(result.metadata.total_size, 2);
        assert_eq!(result.metadata.offset, 5);
        let [movie] = result.data.as_slice() else {
            panic!("expected one movie, got {:?}", result.data);
        };
        assert_eq!(movie.id, "fake-1");
    }

    #[tokio::test]
    async fn store_failures_name_their_stage() {
        for stage in [Stage::Count, Stage::Fetch, Stage::Insert] {
            let (_, _, search) = setup(FakeStore::failing(stage), Reply::Found(dune()));
            let err = search.search(&titled("Dune")).await.unwrap_err();
            match err {
                AppError::Upstream { stage: failed, .. } => assert_eq!(failed, stage),
                other => panic!("expected upstream failure at {stage}, got {other}"),
            }
        }
    }

    #[tokio::test]
    async fn count_failure_skips_fetch() {
        let (store, _, search) = setup(FakeStore::failing(Stage::Count), Reply::NotFound);
        search.search(&titled("Dune")).await.unwrap_err();
        assert_eq!(store.calls(), vec![Call::Count(vec![Predicate::Title("Dune".to_string())])]);
    }

    #[tokio::test]
    async fn create_requires_title() {
        let (store, _, search) = setup(FakeStore::default(), Reply::NotFound);
        let req = CreateMovieRequest {
            title: " ".to_string(),
            rating: None,
            released_year: None,
            genres: vec![],
        };
        assert!(matches!(search.create(req).await, Err(AppError::InvalidRequest(_))));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn get_unknown_movie_is_not_found() {
        let (_, _, search) = setup(FakeStore::default(), Reply::NotFound);
        assert!(matches!(search.get("nope").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn health_reports_database_failure() {
        let (_, _, search) = setup(FakeStore::failing(Stage::Read), Reply::NotFound);
        let report = search.health().await;
        assert_eq!(report.status, "unhealthy");
        assert!(!report.is_healthy());
        assert!(report.checks[0].error.is_some());
    }

    async fn sql_search(provider: Arc<FakeProvider>) -> (SqlMovieStore, MovieSearch) {
        let db = db::connect_and_migrate("sqlite::memory:").await.unwrap();
        let store = SqlMovieStore::new(db);
        let search = MovieSearch::new(Arc::new(store.clone()), provider);
        (store, search)
    }

    #[tokio::test]
    async fn repeated_miss_persists_one_record() {
        let provider = Arc::new(FakeProvider::new(Reply::Found(dune())));
        let (store, search) = sql_search(provider.clone()).await;

        // The stored title differs in case, so both searches miss locally.
        let first = search.search(&titled("dune")).await.unwrap();
        let second = search.search(&titled("dune")).await.unwrap();

        assert_eq!(provider.lookups(), 2);
        assert_eq!(first.data, second.data);
        assert_eq!(store.count(&[Predicate::Title("Dune".to_string())]).await.unwrap(), 1);

        let exact = search.search(&titled("Dune")).await.unwrap();
        assert_eq!(exact.data, first.data);
        assert_eq!(provider.lookups(), 2);
    }

    #[tokio::test]
    async fn page_past_a_filled_title_looks_up_again() {
        let provider = Arc::new(FakeProvider::new(Reply::Found(dune())));
        let (store, search) = sql_search(provider.clone()).await;

        let first = search.search(&titled("Dune")).await.unwrap();
        let params = SearchParams { title: Some("Dune".to_string()), ..page("10", "5") };
        let past = search.search(&params).await.unwrap();

        assert_eq!(provider.lookups(), 2);
        assert_eq!(past.metadata.total_size, 2);
        assert_eq!(past.data, first.data);
        assert_eq!(store.count(&[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn oversized_pagination_is_rejected_before_the_store() {
        let provider = Arc::new(FakeProvider::new(Reply::Found(dune())));
        let (store, search) = sql_search(provider.clone()).await;

        for params in [page("18446744073709551615", "0"), page("10", "9223372036854775808")] {
            let err = search.search(&params).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidRequest(_)), "{err}");
        }
        assert_eq!(provider.lookups(), 0);
        assert_eq!(store.count(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_fills_share_one_record() {
        let provider = Arc::new(FakeProvider::new(Reply::Found(dune())));
        let (store, search) = sql_search(provider).await;

        let params = titled("dune");
        let results =
            futures::future::join_all((0..8).map(|_| search.search(&params))).await;

        let ids: Vec<_> = results
            .into_iter()
            .map(|r| {
                let list = r.unwrap();
                assert_eq!(list.metadata.total_size, 1);
                list.data[0].id.clone()
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "{ids:?}");
        assert_eq!(store.count(&[]).await.unwrap(), 1);
    }
}
