use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedfetch::{FeedStream, FetchError, Fetcher};
use merchfeed_db::models::{ParsingResult, Product, Run};
use merchfeed_db::{Postgres, StorageError};
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::decoder::{DecodeError, Decoder};

/// Provides times, so tests can pin them.
pub trait Clock: Send + Sync {
    /// Current UTC time in integer milliseconds since the epoch.
    fn timestamp(&self) -> i64;
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn timestamp(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fetches feed files.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch_file(&self, url: &str) -> Result<FeedStream, FetchError>;
}

#[async_trait]
impl Fetch for Fetcher {
    async fn fetch_file(&self, url: &str) -> Result<FeedStream, FetchError> {
        Fetcher::fetch_file(self, url).await
    }
}

/// Decodes xml feed files into parsing results.
#[async_trait]
pub trait Decode: Send + Sync {
    async fn decode(
        &self,
        file: FeedStream,
        output: mpsc::Sender<ParsingResult>,
    ) -> Result<(), DecodeError>;
}

#[async_trait]
impl Decode for Decoder {
    async fn decode(
        &self,
        file: FeedStream,
        output: mpsc::Sender<ParsingResult>,
    ) -> Result<(), DecodeError> {
        Decoder::decode(self, file, &output).await
    }
}

/// Products and runs storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates a new run unless one is already in flight for the shop.
    async fn start_run(&self, shop_url: &str, version: i64) -> Result<Run, StorageError>;
    /// Finishes the run and writes back its statistics.
    async fn finish_run(&self, run: &Run) -> Result<(), StorageError>;
    /// Upserts a batch of products and their shippings; returns the number
    /// of created and updated products.
    async fn update_products(
        &self,
        products: Vec<Product>,
        shop_id: i32,
    ) -> Result<(i32, i32), StorageError>;
    /// Tombstones all live products of the shop older than `version`;
    /// returns how many were tombstoned.
    async fn delete_old_products(
        &self,
        shop_id: i32,
        version: i64,
        batch_size: usize,
    ) -> Result<i32, StorageError>;
}

#[async_trait]
impl Storage for Postgres {
    async fn start_run(&self, shop_url: &str, version: i64) -> Result<Run, StorageError> {
        Postgres::start_run(self, shop_url, version).await
    }

    async fn finish_run(&self, run: &Run) -> Result<(), StorageError> {
        Postgres::finish_run(self, run).await
    }

    async fn update_products(
        &self,
        products: Vec<Product>,
        shop_id: i32,
    ) -> Result<(i32, i32), StorageError> {
        Postgres::update_products(self, products, shop_id).await
    }

    async fn delete_old_products(
        &self,
        shop_id: i32,
        version: i64,
        batch_size: usize,
    ) -> Result<i32, StorageError> {
        Postgres::delete_old_products(self, shop_id, version, batch_size).await
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("can't start parsing")]
    StartRun(#[source] StorageError),

    #[error("can't fetch feed file")]
    Fetch(#[source] FetchError),

    #[error("can't decode feed file")]
    Decode(#[source] DecodeError),

    #[error("can't filter products: batch receiver dropped")]
    Filter,

    #[error("can't update products")]
    Update(#[source] StorageError),

    #[error("can't delete outdated products")]
    Delete(#[source] StorageError),

    #[error("can't finish parsing")]
    Finish(#[source] StorageError),

    #[error("can't finish failed parsing: {source} (fail reason: {reason})")]
    FinishFailed {
        source: StorageError,
        reason: Box<ParseError>,
    },
}

impl ParseError {
    /// Channel-closure errors are fallout of another stage failing first.
    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ParseError::Decode(DecodeError::Cancelled) | ParseError::Filter,
        )
    }
}

/// Formats an error with all its causes, outermost first, for run status
/// messages and logs.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Entry point the command handler drives.
#[async_trait]
pub trait ParseFeed: Send + Sync {
    async fn parse(&self, shop_url: &str) -> Result<(), ParseError>;
}

/// Drives one feed run end to end: versioned run record, fetch, the
/// decode → batch → upsert pipeline, reaping of outdated products, run
/// finalization.
pub struct Parser<F, D, S, C = SystemClock> {
    fetcher: F,
    decoder: D,
    storage: S,
    batch_size: usize,
    clock: C,
}

impl<F, D, S> Parser<F, D, S>
where
    F: Fetch,
    D: Decode,
    S: Storage,
{
    pub fn new(fetcher: F, decoder: D, storage: S, batch_size: usize) -> Self {
        Self {
            fetcher,
            decoder,
            storage,
            batch_size,
            clock: SystemClock,
        }
    }
}

impl<F, D, S, C> Parser<F, D, S, C>
where
    F: Fetch,
    D: Decode,
    S: Storage,
    C: Clock,
{
    /// Replaces the parser's clock.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Parser<F, D, S, C2> {
        Parser {
            fetcher: self.fetcher,
            decoder: self.decoder,
            storage: self.storage,
            batch_size: self.batch_size,
            clock,
        }
    }

    /// Parses the feed file at `shop_url` into the product store.
    ///
    /// Every failure past `start_run` finalizes the run as unsuccessful with
    /// the failure recorded in its status message; counters reflect exactly
    /// the stages that ran.
    pub async fn parse(&self, shop_url: &str) -> Result<(), ParseError> {
        let version = self.clock.timestamp();

        let mut run = self
            .storage
            .start_run(shop_url, version)
            .await
            .map_err(ParseError::StartRun)?;

        let feed_file = match self.fetcher.fetch_file(shop_url).await {
            Ok(file) => file,
            Err(err) => {
                return self.finish_parsing(&mut run, Err(ParseError::Fetch(err))).await;
            }
        };

        let outcome = self.parse_products(run.shop_id, version, feed_file).await;

        run.created_products = Some(outcome.created);
        run.updated_products = Some(outcome.updated);
        run.failed_products = Some(outcome.failed);

        if let Err(err) = outcome.result {
            return self.finish_parsing(&mut run, Err(err)).await;
        }

        match self
            .storage
            .delete_old_products(run.shop_id, version, self.batch_size)
            .await
        {
            Ok(deleted) => run.deleted_products = Some(deleted),
            Err(err) => {
                run.deleted_products = Some(0);
                return self.finish_parsing(&mut run, Err(ParseError::Delete(err))).await;
            }
        }

        self.finish_parsing(&mut run, Ok(())).await
    }

    /// Runs the three-stage pipeline over the feed stream.
    ///
    /// The stages are connected by capacity-1 channels, so memory is bounded
    /// by one in-flight batch plus the items in transit, and a slow
    /// transaction backpressures the decoder. A stage failing closes its
    /// channels, which winds down the other stages; all three are awaited
    /// before the counters are read.
    async fn parse_products(
        &self,
        shop_id: i32,
        version: i64,
        feed_file: FeedStream,
    ) -> PipelineOutcome {
        let (results_tx, mut results_rx) = mpsc::channel::<ParsingResult>(1);
        let (batches_tx, mut batches_rx) = mpsc::channel::<Vec<Product>>(1);

        let created = AtomicI32::new(0);
        let updated = AtomicI32::new(0);
        let failed = AtomicI32::new(0);
        let (created_count, updated_count, failed_count) = (&created, &updated, &failed);

        let batch_size = self.batch_size;

        let decode = async move {
            self.decoder
                .decode(feed_file, results_tx)
                .await
                .map_err(ParseError::Decode)
        };

        let filter = async move {
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(result) = results_rx.recv().await {
                if result.error.is_some() {
                    failed_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                batch.push(result.product);
                if batch.len() == batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if batches_tx.send(full).await.is_err() {
                        return Err(ParseError::Filter);
                    }
                }
            }

            if !batch.is_empty() && batches_tx.send(batch).await.is_err() {
                return Err(ParseError::Filter);
            }

            Ok(())
        };

        let upsert = async move {
            while let Some(mut batch) = batches_rx.recv().await {
                for product in &mut batch {
                    product.version = version;
                }

                let (new_products, updated_products) = self
                    .storage
                    .update_products(batch, shop_id)
                    .await
                    .map_err(ParseError::Update)?;

                created_count.fetch_add(new_products, Ordering::Relaxed);
                updated_count.fetch_add(updated_products, Ordering::Relaxed);
            }
            Ok(())
        };

        let (decoded, filtered, upserted) = tokio::join!(decode, filter, upsert);

        PipelineOutcome {
            created: created.load(Ordering::Relaxed),
            updated: updated.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            result: match first_pipeline_error([decoded.err(), filtered.err(), upserted.err()]) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// Finalizes the run with the outcome in `status`. When finalization
    /// itself fails after a pipeline failure, the returned error carries
    /// both.
    async fn finish_parsing(
        &self,
        run: &mut Run,
        status: Result<(), ParseError>,
    ) -> Result<(), ParseError> {
        if let Err(err) = &status {
            run.status_message = Some(error_chain(err));
        }
        run.is_success = Some(status.is_ok());
        run.finished_at = Some(self.clock.now());

        match (self.storage.finish_run(run).await, status) {
            (Ok(()), status) => status,
            (Err(finish_err), Ok(())) => Err(ParseError::Finish(finish_err)),
            (Err(finish_err), Err(reason)) => Err(ParseError::FinishFailed {
                source: finish_err,
                reason: Box::new(reason),
            }),
        }
    }
}

#[async_trait]
impl<F, D, S, C> ParseFeed for Parser<F, D, S, C>
where
    F: Fetch,
    D: Decode,
    S: Storage,
    C: Clock,
{
    async fn parse(&self, shop_url: &str) -> Result<(), ParseError> {
        Parser::parse(self, shop_url).await
    }
}

struct PipelineOutcome {
    created: i32,
    updated: i32,
    failed: i32,
    result: Result<(), ParseError>,
}

/// Picks the pipeline error to surface. A stage that failed on its own beats
/// the channel-closure errors its failure caused in the other stages.
fn first_pipeline_error(errors: [Option<ParseError>; 3]) -> Option<ParseError> {
    let mut errors: Vec<ParseError> = errors.into_iter().flatten().collect();
    if errors.is_empty() {
        return None;
    }
    let ix = errors
        .iter()
        .position(|err| !err.is_cancellation())
        .unwrap_or(0);
    Some(errors.swap_remove(ix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const BATCH_SIZE: usize = 2;
    const VERSION: i64 = 1_650_000_000_000;
    const SHOP_URL: &str = "https://shop.example.com/feed.xml";
    const RUN_ID: i32 = 7;
    const SHOP_ID: i32 = 3;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 4, 1, 1, 1, 1).unwrap()
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 4, 1, 1, 1, 1).unwrap()
    }

    fn new_run() -> Run {
        Run {
            id: RUN_ID,
            shop_id: SHOP_ID,
            created_at: created_at(),
            finished_at: None,
            is_success: None,
            status_message: None,
            created_products: None,
            updated_products: None,
            deleted_products: None,
            failed_products: None,
            products_version: VERSION,
        }
    }

    fn product(product_id: &str) -> Product {
        Product {
            product_id: product_id.to_owned(),
            title: format!("Product {product_id}"),
            ..Product::default()
        }
    }

    fn results(entries: &[Option<&str>]) -> Vec<ParsingResult> {
        entries
            .iter()
            .map(|entry| match entry {
                Some(product_id) => ParsingResult::product(product(product_id)),
                None => ParsingResult::error("bad item"),
            })
            .collect()
    }

    struct FakeClock;

    impl Clock for FakeClock {
        fn timestamp(&self) -> i64 {
            VERSION
        }

        fn now(&self) -> DateTime<Utc> {
            now()
        }
    }

    struct FakeFetcher {
        error: Mutex<Option<FetchError>>,
    }

    impl FakeFetcher {
        fn ok() -> Self {
            Self {
                error: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                error: Mutex::new(Some(FetchError::StatusNotOk(
                    reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                ))),
            }
        }
    }

    #[async_trait]
    impl Fetch for FakeFetcher {
        async fn fetch_file(&self, _url: &str) -> Result<FeedStream, FetchError> {
            match self.error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(Box::pin(tokio::io::empty())),
            }
        }
    }

    struct FakeDecoder {
        results: Mutex<Option<Vec<ParsingResult>>>,
        error: Mutex<Option<DecodeError>>,
    }

    impl FakeDecoder {
        fn new(results: Vec<ParsingResult>) -> Self {
            Self {
                results: Mutex::new(Some(results)),
                error: Mutex::new(None),
            }
        }

        fn failing(results: Vec<ParsingResult>, error: DecodeError) -> Self {
            Self {
                results: Mutex::new(Some(results)),
                error: Mutex::new(Some(error)),
            }
        }
    }

    #[async_trait]
    impl Decode for FakeDecoder {
        async fn decode(
            &self,
            _file: FeedStream,
            output: mpsc::Sender<ParsingResult>,
        ) -> Result<(), DecodeError> {
            let results = self.results.lock().unwrap().take().unwrap_or_default();
            for result in results {
                if output.send(result).await.is_err() {
                    return Err(DecodeError::Cancelled);
                }
            }
            match self.error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        start_error: Mutex<Option<StorageError>>,
        update_results: Mutex<VecDeque<Result<(i32, i32), StorageError>>>,
        updates: Mutex<Vec<(Vec<Product>, i32)>>,
        delete_result: Mutex<Option<Result<i32, StorageError>>>,
        finish_error: Mutex<Option<StorageError>>,
        finished: Mutex<Option<Run>>,
    }

    impl FakeStorage {
        fn with_updates(results: Vec<Result<(i32, i32), StorageError>>) -> Arc<Self> {
            let storage = Self::default();
            *storage.update_results.lock().unwrap() = results.into();
            Arc::new(storage)
        }

        fn finished_run(&self) -> Option<Run> {
            self.finished.lock().unwrap().clone()
        }

        fn recorded_updates(&self) -> Vec<(Vec<Product>, i32)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Storage for Arc<FakeStorage> {
        async fn start_run(&self, _shop_url: &str, version: i64) -> Result<Run, StorageError> {
            if let Some(err) = self.start_error.lock().unwrap().take() {
                return Err(err);
            }
            assert_eq!(version, VERSION);
            Ok(new_run())
        }

        async fn finish_run(&self, run: &Run) -> Result<(), StorageError> {
            *self.finished.lock().unwrap() = Some(run.clone());
            match self.finish_error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn update_products(
            &self,
            products: Vec<Product>,
            shop_id: i32,
        ) -> Result<(i32, i32), StorageError> {
            self.updates.lock().unwrap().push((products, shop_id));
            self.update_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((0, 0)))
        }

        async fn delete_old_products(
            &self,
            shop_id: i32,
            version: i64,
            batch_size: usize,
        ) -> Result<i32, StorageError> {
            assert_eq!(shop_id, SHOP_ID);
            assert_eq!(version, VERSION);
            assert_eq!(batch_size, BATCH_SIZE);
            self.delete_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(0))
        }
    }

    fn parser(
        fetcher: FakeFetcher,
        decoder: FakeDecoder,
        storage: Arc<FakeStorage>,
    ) -> Parser<FakeFetcher, FakeDecoder, Arc<FakeStorage>, FakeClock> {
        Parser::new(fetcher, decoder, storage, BATCH_SIZE).with_clock(FakeClock)
    }

    #[tokio::test]
    async fn parse_counts_and_finalizes_successful_run() {
        // Nine results with two bad items; batches of two.
        let feed = results(&[
            Some("1"),
            Some("2"),
            None,
            Some("3"),
            Some("4"),
            None,
            Some("5"),
            Some("6"),
            Some("7"),
        ]);
        let storage = FakeStorage::with_updates(vec![
            Ok((1, 1)),
            Ok((1, 1)),
            Ok((1, 1)),
            Ok((1, 0)),
        ]);
        *storage.delete_result.lock().unwrap() = Some(Ok(12));

        let parser = parser(FakeFetcher::ok(), FakeDecoder::new(feed), Arc::clone(&storage));

        parser.parse(SHOP_URL).await.expect("parse should succeed");

        let updates = storage.recorded_updates();
        let batch_sizes: Vec<usize> = updates.iter().map(|(batch, _)| batch.len()).collect();
        assert_eq!(batch_sizes, vec![2, 2, 2, 1]);
        assert!(updates.iter().all(|(_, shop_id)| *shop_id == SHOP_ID));
        assert!(
            updates
                .iter()
                .flat_map(|(batch, _)| batch)
                .all(|product| product.version == VERSION),
        );

        let finished = storage.finished_run().expect("run should be finalized");
        assert_eq!(finished.is_success, Some(true));
        assert_eq!(finished.status_message, None);
        assert_eq!(finished.finished_at, Some(now()));
        assert_eq!(finished.created_products, Some(4));
        assert_eq!(finished.updated_products, Some(3));
        assert_eq!(finished.deleted_products, Some(12));
        assert_eq!(finished.failed_products, Some(2));
        assert_eq!(finished.products_version, VERSION);
    }

    #[tokio::test]
    async fn start_run_failure_returns_without_finalizing() {
        let storage = FakeStorage::with_updates(vec![]);
        *storage.start_error.lock().unwrap() = Some(StorageError::AlreadyRunning);

        let parser = parser(
            FakeFetcher::ok(),
            FakeDecoder::new(vec![]),
            Arc::clone(&storage),
        );

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");

        assert!(matches!(
            err,
            ParseError::StartRun(StorageError::AlreadyRunning),
        ));
        assert_eq!(storage.finished_run(), None);
    }

    #[tokio::test]
    async fn fetch_failure_finalizes_run_as_unsuccessful() {
        let storage = FakeStorage::with_updates(vec![]);

        let parser = parser(
            FakeFetcher::failing(),
            FakeDecoder::new(vec![]),
            Arc::clone(&storage),
        );

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");
        assert!(matches!(err, ParseError::Fetch(_)));

        let finished = storage.finished_run().expect("run should be finalized");
        assert_eq!(finished.is_success, Some(false));
        assert_eq!(
            finished.status_message.as_deref(),
            Some("can't fetch feed file: response status is not 200 OK"),
        );
        // The pipeline never ran, so no counter was reached.
        assert_eq!(finished.created_products, None);
        assert_eq!(finished.updated_products, None);
        assert_eq!(finished.deleted_products, None);
        assert_eq!(finished.failed_products, None);
    }

    #[tokio::test]
    async fn update_failure_keeps_partial_counters() {
        // Two full batches; the second upsert fails.
        let feed = results(&[Some("1"), Some("2"), None, Some("3"), Some("4"), None]);
        let storage = FakeStorage::with_updates(vec![
            Ok((1, 1)),
            Err(StorageError::RunNotFound),
        ]);

        let parser = parser(FakeFetcher::ok(), FakeDecoder::new(feed), Arc::clone(&storage));

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");
        assert!(matches!(err, ParseError::Update(_)));

        let finished = storage.finished_run().expect("run should be finalized");
        assert_eq!(finished.is_success, Some(false));
        assert!(
            finished
                .status_message
                .as_deref()
                .is_some_and(|msg| msg.starts_with("can't update products")),
        );
        assert_eq!(finished.created_products, Some(1));
        assert_eq!(finished.updated_products, Some(1));
        assert_eq!(finished.failed_products, Some(2));
        assert_eq!(finished.deleted_products, None);
    }

    #[tokio::test]
    async fn decode_failure_mid_stream_keeps_written_batches() {
        let feed = results(&[Some("1"), Some("2")]);
        let storage = FakeStorage::with_updates(vec![Ok((1, 1))]);

        let parser = parser(
            FakeFetcher::ok(),
            FakeDecoder::failing(feed, DecodeError::UnexpectedEof),
            Arc::clone(&storage),
        );

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");
        assert!(matches!(err, ParseError::Decode(DecodeError::UnexpectedEof)));

        let finished = storage.finished_run().expect("run should be finalized");
        assert_eq!(finished.is_success, Some(false));
        assert!(
            finished
                .status_message
                .as_deref()
                .is_some_and(|msg| msg.starts_with("can't decode feed file")),
        );
        assert_eq!(finished.created_products, Some(1));
        assert_eq!(finished.updated_products, Some(1));
        assert_eq!(finished.failed_products, Some(0));
        assert_eq!(finished.deleted_products, None);
    }

    #[tokio::test]
    async fn delete_failure_finalizes_run_as_unsuccessful() {
        let feed = results(&[Some("1")]);
        let storage = FakeStorage::with_updates(vec![Ok((1, 0))]);
        *storage.delete_result.lock().unwrap() = Some(Err(StorageError::RunNotFound));

        let parser = parser(FakeFetcher::ok(), FakeDecoder::new(feed), Arc::clone(&storage));

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");
        assert!(matches!(err, ParseError::Delete(_)));

        let finished = storage.finished_run().expect("run should be finalized");
        assert_eq!(finished.is_success, Some(false));
        assert!(
            finished
                .status_message
                .as_deref()
                .is_some_and(|msg| msg.starts_with("can't delete outdated products")),
        );
        assert_eq!(finished.deleted_products, Some(0));
    }

    #[tokio::test]
    async fn finish_failure_after_pipeline_failure_reports_both() {
        let storage = FakeStorage::with_updates(vec![]);
        *storage.finish_error.lock().unwrap() = Some(StorageError::RunNotFound);

        let parser = parser(
            FakeFetcher::failing(),
            FakeDecoder::new(vec![]),
            Arc::clone(&storage),
        );

        let err = parser.parse(SHOP_URL).await.err().expect("parse should fail");

        let message = err.to_string();
        assert!(message.contains("can't finish failed parsing"));
        assert!(message.contains("can't fetch feed file"));
    }

    #[test]
    fn error_chain_includes_all_causes() {
        let err = ParseError::Fetch(FetchError::StatusNotOk(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        ));

        assert_eq!(
            error_chain(&err),
            "can't fetch feed file: response status is not 200 OK",
        );
    }
}
