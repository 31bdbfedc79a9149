//! Pipeline integration tests.
//!
//! Drive the full supervisor with scripted sources and in-memory storage.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use market_recorder::application::services::{
    CollectorConfig, PipelinePhase, QueueConfig, RestartPolicy, WriterConfig,
};
use market_recorder::infrastructure::storage::InMemoryStorage;
use market_recorder::{
    BinningConfig, EventSink, Instrument, MarketDataSource, MarketEvent, OrderBookSnapshot,
    PriceLevel, RecordKind, Side, SourceError, StorageBackend, StorageBackends, StorageError,
    StorageRecord, Supervisor, SupervisorConfig, TradeEvent,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn instrument() -> Instrument {
    Instrument::new("binance", "BTCUSDT")
}

fn trade(id: i64) -> TradeEvent {
    TradeEvent {
        exchange: "binance".to_string(),
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        price: dec("70000.00"),
        size: dec("0.015"),
        trade_id: id.to_string(),
        timestamp_ms: 1_700_000_000_000 + id,
    }
}

/// Mid 70000 at 5 bps: three distinct bins.
fn snapshot(nonce: u64) -> OrderBookSnapshot {
    OrderBookSnapshot {
        exchange: "binance".to_string(),
        symbol: "BTCUSDT".to_string(),
        bids: vec![
            PriceLevel::new(dec("69990"), dec("1")),
            PriceLevel::new(dec("69960"), dec("0.5")),
        ],
        asks: vec![PriceLevel::new(dec("70010"), dec("2"))],
        nonce,
        timestamp_ms: 1_700_000_000_000 + i64::try_from(nonce).unwrap(),
    }
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        collector: CollectorConfig {
            instrument: instrument(),
            snapshot_cadence: Duration::from_millis(100),
            source_buffer: 64,
            binning: BinningConfig::new(dec("5"), 50).unwrap(),
        },
        queue: QueueConfig {
            capacity: 1_000,
            enqueue_timeout: Duration::from_millis(50),
        },
        writer: WriterConfig {
            max_batch_size: 100,
            flush_interval: Duration::from_millis(20),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(100),
        },
        restart: RestartPolicy {
            base_delay: Duration::from_millis(20),
            multiplier: 3.0,
            max_delay: Duration::from_secs(1),
            healthy_after: Duration::from_secs(10),
        },
        shutdown_timeout: Duration::from_secs(5),
    }
}

/// Poll until `done` holds, giving up after `limit` of (virtual) time.
async fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Delivers fixed events, then stays connected.
struct ScriptedSource {
    trades: Vec<TradeEvent>,
    books: Vec<OrderBookSnapshot>,
}

#[async_trait]
impl MarketDataSource for ScriptedSource {
    async fn subscribe_trades(
        &self,
        _instrument: &Instrument,
        sink: EventSink,
    ) -> Result<(), SourceError> {
        for trade in &self.trades {
            sink.deliver(MarketEvent::Trade(trade.clone())).await?;
        }
        std::future::pending().await
    }

    async fn subscribe_order_book(
        &self,
        _instrument: &Instrument,
        sink: EventSink,
        _cadence: Duration,
    ) -> Result<(), SourceError> {
        for book in &self.books {
            sink.deliver(MarketEvent::Book(book.clone())).await?;
        }
        std::future::pending().await
    }
}

/// Book stream that drops immediately on every subscription.
#[derive(Default)]
struct DroppingSource {
    subscribed_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl MarketDataSource for DroppingSource {
    async fn subscribe_trades(
        &self,
        _instrument: &Instrument,
        _sink: EventSink,
    ) -> Result<(), SourceError> {
        std::future::pending().await
    }

    async fn subscribe_order_book(
        &self,
        _instrument: &Instrument,
        _sink: EventSink,
        _cadence: Duration,
    ) -> Result<(), SourceError> {
        self.subscribed_at.lock().push(Instant::now());
        Err(SourceError::ReconnectExhausted { attempts: 10 })
    }
}

/// Panics on the first book subscription, then behaves.
#[derive(Default)]
struct PanicOnceSource {
    calls: AtomicU32,
}

#[async_trait]
impl MarketDataSource for PanicOnceSource {
    async fn subscribe_trades(
        &self,
        _instrument: &Instrument,
        _sink: EventSink,
    ) -> Result<(), SourceError> {
        std::future::pending().await
    }

    async fn subscribe_order_book(
        &self,
        _instrument: &Instrument,
        sink: EventSink,
        _cadence: Duration,
    ) -> Result<(), SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("corrupt frame");
        }
        sink.deliver(MarketEvent::Book(snapshot(1))).await?;
        std::future::pending().await
    }
}

/// Storage that panics on its first write, then stores normally.
#[derive(Default)]
struct PanicOnceStorage {
    inner: InMemoryStorage,
    calls: AtomicU32,
}

#[async_trait]
impl StorageBackend for PanicOnceStorage {
    async fn write(&self, records: &[StorageRecord]) -> Result<(), StorageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("storage client bug");
        }
        self.inner.write(records).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn records_flow_from_source_to_storage() {
    let storage = Arc::new(InMemoryStorage::new());
    let source = ScriptedSource {
        trades: vec![trade(1), trade(2)],
        books: vec![snapshot(1), snapshot(2), snapshot(4)],
    };
    let supervisor = Supervisor::new(
        config(),
        Arc::new(source),
        StorageBackends::shared(storage.clone()),
    );
    let status = supervisor.status();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    wait_for(Duration::from_secs(5), || {
        storage.records_of(RecordKind::Trade).len() == 2
            && storage.records_of(RecordKind::BookBin).len() == 9
            && storage.records_of(RecordKind::Gap).len() == 1
    })
    .await;
    assert!(status.borrow().is_ready());

    shutdown.cancel();
    let report = tokio_test::assert_ok!(run.await);

    assert!(report.is_clean());
    assert_eq!(report.restarts, 0);
    assert!(storage.is_closed());
    assert_eq!(status.borrow().phase, PipelinePhase::Stopped);

    let gap = &storage.records_of(RecordKind::Gap)[0];
    assert_eq!(gap.tag_value("severity"), Some("gap"));
    assert_eq!(
        gap.to_line(),
        "orderbook_gaps,exchange=binance,symbol=BTCUSDT,severity=gap \
         expected_nonce=3i,observed_nonce=4i,missing=1i 1700000000004000000"
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_partial_batches() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut config = config();
    config.writer.flush_interval = Duration::from_secs(3_600);

    let source = ScriptedSource {
        trades: (1..=5).map(trade).collect(),
        books: vec![],
    };
    let supervisor = Supervisor::new(
        config,
        Arc::new(source),
        StorageBackends::shared(storage.clone()),
    );
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(storage.batches().is_empty());

    shutdown.cancel();
    let report = run.await.unwrap();

    assert!(report.is_clean());
    let trades = storage.records_of(RecordKind::Trade);
    assert_eq!(trades.len(), 5);
    let timestamps: Vec<i64> = trades.iter().map(|r| r.timestamp_ns()).collect();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn failing_collector_restarts_with_growing_delays() {
    let storage = Arc::new(InMemoryStorage::new());
    let source = Arc::new(DroppingSource::default());
    let supervisor = Supervisor::new(
        config(),
        source.clone(),
        StorageBackends::shared(storage.clone()),
    );
    let status = supervisor.status();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    wait_for(Duration::from_secs(5), || source.subscribed_at.lock().len() >= 4).await;
    shutdown.cancel();
    let report = run.await.unwrap();

    let at = source.subscribed_at.lock().clone();
    let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(
        gaps.windows(2).all(|w| w[0] < w[1]),
        "restart delays should grow: {gaps:?}"
    );
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(1) + Duration::from_millis(50)));

    assert!(report.is_clean());
    assert!(report.restarts >= 3);
    let collector = status.borrow().tasks["collector"].clone();
    assert!(collector.restarts >= 3);
    assert!(
        collector
            .last_error
            .unwrap()
            .contains("reconnect attempts exhausted")
    );
}

#[tokio::test(start_paused = true)]
async fn panicking_collector_is_restarted() {
    let storage = Arc::new(InMemoryStorage::new());
    let source = Arc::new(PanicOnceSource::default());
    let supervisor = Supervisor::new(
        config(),
        source.clone(),
        StorageBackends::shared(storage.clone()),
    );
    let status = supervisor.status();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    wait_for(Duration::from_secs(5), || {
        storage.records_of(RecordKind::BookBin).len() == 3
    })
    .await;

    {
        let status = status.borrow();
        let collector = &status.tasks["collector"];
        assert_eq!(collector.restarts, 1);
        assert!(
            collector
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("corrupt frame"))
        );
    }

    shutdown.cancel();
    let report = run.await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.restarts, 1);
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn batch_lost_to_writer_panic_is_counted() {
    let storage = Arc::new(PanicOnceStorage::default());
    let source = ScriptedSource {
        trades: vec![trade(1), trade(2)],
        books: vec![],
    };
    let supervisor = Supervisor::new(
        config(),
        Arc::new(source),
        StorageBackends::shared(storage.clone()),
    );
    let status = supervisor.status();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    wait_for(Duration::from_secs(5), || {
        status
            .borrow()
            .tasks
            .get("writer:trade")
            .is_some_and(|task| task.restarts == 1)
    })
    .await;

    shutdown.cancel();
    let report = run.await.unwrap();
    assert!(report.is_clean());

    let status = status.borrow();
    let writer = status.queues["trade"].writer;
    assert_eq!(writer.batches_dropped, 1);
    assert_eq!(writer.records_dropped, 2);
    assert_eq!(writer.pending, 0);
    assert!(storage.inner.records_of(RecordKind::Trade).is_empty());
}
