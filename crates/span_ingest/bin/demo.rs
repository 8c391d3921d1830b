//! Feeds random legacy span payloads through the unmarshal pool into an
//! in-memory store and prints what landed in each table.
//!
//! ```text
//! RUST_LOG=span_ingest=debug cargo run --bin demo -- 5000
//! ```

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use span_ingest::protoparser::parse_spot_span;
use span_ingest::{ColumnarSpanExporter, IngestConfig, MemoryStore, UnmarshalPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PAYLOADS: usize = 1_000;
const SERVICES: &[&str] = &["cart", "orders", "payment", "gateway"];
const OPERATIONS: &[&str] = &["GET /api/items", "POST /api/orders", "SELECT orders", "redis GET"];

fn payload(rng: &mut impl Rng) -> Vec<u8> {
    let start: i64 = 1_652_756_014_000_000_000 + rng.gen_range(0..1_000_000_000);
    let mut tags = serde_json::json!({
        "span_id": format!("{:016x}", rng.gen::<u64>()),
        "org_name": "erda",
        "service_name": SERVICES.choose(rng).copied().unwrap_or("cart"),
        "operation_name": OPERATIONS.choose(rng).copied().unwrap_or("GET /"),
        "terminus_key": format!("tk-{}", rng.gen_range(0..16)),
    });
    // A few payloads are malformed and must be rejected.
    if rng.gen_ratio(19, 20) {
        tags["trace_id"] = format!("{:032x}", rng.gen::<u128>()).into();
    }
    serde_json::json!({
        "name": "span",
        "timestamp": start,
        "tags": tags,
        "fields": {
            "start_time": start,
            "end_time": start + rng.gen_range(1_000..50_000_000),
        },
    })
    .to_string()
    .into_bytes()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "span_ingest=info,workpool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let payloads: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("payload count must be a number")?,
        None => DEFAULT_PAYLOADS,
    };

    let config = IngestConfig::load()?;
    let store = MemoryStore::new();
    let exporter = Arc::new(
        ColumnarSpanExporter::start(
            config.exporter.clone(),
            Arc::new(store.clone()),
            CancellationToken::new(),
        )
        .await?,
    );
    let pool = UnmarshalPool::start(config.unmarshal_worker_count())?;
    tracing::info!(payloads, unmarshal_workers = pool.workers(), "demo started");

    let producer = Arc::clone(&exporter);
    let (accepted, rejected) = tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        let (mut accepted, mut rejected) = (0usize, 0usize);
        for _ in 0..payloads {
            let exporter = Arc::clone(&producer);
            let result = parse_spot_span(&pool, payload(&mut rng), move |span| {
                exporter.blocking_write_batch(vec![span]).map_err(Into::into)
            });
            match result {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::debug!(error = %e, "payload rejected");
                    rejected += 1;
                }
            }
        }
        (accepted, rejected)
    })
    .await?;

    exporter.shutdown().await;

    let metrics = exporter.metrics();
    println!("payloads accepted:  {accepted}");
    println!("payloads rejected:  {rejected}");
    println!("series rows:        {}", store.series_rows().len());
    println!("meta rows:          {}", store.meta_rows().len());
    println!("cached series ids:  {}", exporter.cache().len());
    println!("batches sent:       {}", metrics.batches_sent());
    println!("batches dropped:    {}", metrics.batches_dropped());
    Ok(())
}
