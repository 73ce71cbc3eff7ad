//! Publish one batch of raw phone number candidates to the intake queue.
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;

use phone_common::lifecycle::init_tracing;
use phone_common::queue::{PgQueue, QueueClient};
use phone_producer::config::Config;
use phone_producer::error::ProduceError;
use phone_producer::producer::{random_raws, read_raws, Producer};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let raws = match &config.input_path {
        Some(path) => File::open(path)
            .map(BufReader::new)
            .and_then(read_raws)
            .map_err(|error| ProduceError::ReadError {
                path: path.to_owned(),
                error,
            })?,
        None => random_raws(&mut rand::thread_rng(), config.batch_size),
    };

    let pool = config
        .pool
        .connect()
        .await
        .wrap_err("failed to connect to the database")?;
    let queue: Arc<dyn QueueClient> = Arc::new(PgQueue::from_pool(pool, config.poll_interval.0));
    let handle = queue
        .resolve_queue(config.queue_name.as_str())
        .await
        .wrap_err("failed to resolve the intake queue")?;

    let producer = Producer::new(queue, handle, config.group_key.as_str());
    let summary = producer.publish_raws(raws).await?;

    info!(
        queue = config.queue_name.as_str(),
        sent = summary.sent,
        deduplicated = summary.deduplicated,
        "published candidates"
    );

    Ok(())
}
