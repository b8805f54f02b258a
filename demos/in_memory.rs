use std::{
    collections::HashMap,
    fs::File,
    io::BufWriter,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use pacebench::{
    BoxError, Client, Operation, Outcome, StopCondition, Stress, StressConfig, ThreadMode, Warmup,
};
use parking_lot::RwLock;
use tracing_subscriber::EnvFilter;

/// A toy partitioned store. Every 500th write stalls for 50ms, which is
/// exactly what shows up in response time and hides in service time.
#[derive(Default)]
struct Store {
    partitions: RwLock<HashMap<u64, Vec<u64>>>,
    writes: AtomicU64,
}

impl Client<(u64, u64)> for Store {
    async fn execute(&self, op: &Operation<(u64, u64)>) -> Result<Outcome, BoxError> {
        let (partition, row) = op.payload;
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        let delay = if n % 500 == 0 { 50_000 } else { 200 };
        tokio::time::sleep(Duration::from_micros(delay)).await;

        self.partitions.write().entry(partition).or_default().push(row);
        Ok(Outcome::new(1, 1))
    }
}

struct Writes;

impl pacebench::OperationFactory for Writes {
    type Payload = (u64, u64);

    fn create(&self, index: u64) -> (u64, u64) {
        (index % 1024, index)
    }

    fn describe(&self) -> String {
        "WRITE".to_string()
    }
}

#[tokio::main]
async fn main() -> pacebench::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = StressConfig::builder()
        // Grow from 1 to 32 workers and stop once throughput flattens out
        .threads(ThreadMode::Range {
            min: 1,
            max: 32,
            auto: true,
        })
        .rate(20_000.0)
        .stop(StopCondition::Duration(Duration::from_secs(5)))
        .warmup(Some(Warmup {
            iterations: 5_000,
            threads: 4,
        }))
        .mutating(true)
        .settle_delay(Duration::from_secs(1))
        .build();

    Stress::builder()
        .config(config)
        .factory(Writes)
        .client(Store::default())
        .response_log(Box::new(BufWriter::new(File::create("response.hlog")?)))
        .service_log(Box::new(BufWriter::new(File::create("service.hlog")?)))
        .build()
        .run()
        .await?;
    Ok(())
}
