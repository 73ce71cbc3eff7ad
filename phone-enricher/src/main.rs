//! Consume raw candidates from the intake queue and publish enriched records.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;

use phone_common::consumer::Consumer;
use phone_common::health::HealthRegistry;
use phone_common::lifecycle::{init_tracing, shutdown_token};
use phone_common::metrics::{serve, setup_metrics_routes};
use phone_common::queue::{PgQueue, QueueClient};
use phone_enricher::config::Config;
use phone_enricher::enricher::Enricher;

pub async fn index() -> &'static str {
    "phone enricher"
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let normalizer = config
        .normalizer
        .normalizer()
        .wrap_err("invalid normalizer configuration")?;

    let pool = config
        .pool
        .connect()
        .await
        .wrap_err("failed to connect to the database")?;
    let queue: Arc<dyn QueueClient> = Arc::new(PgQueue::from_pool(pool, config.poll_interval.0));

    let intake = queue
        .resolve_queue(config.intake_queue_name.as_str())
        .await
        .wrap_err("failed to resolve the intake queue")?;
    let output = queue
        .resolve_queue(config.output_queue_name.as_str())
        .await
        .wrap_err("failed to resolve the output queue")?;

    let liveness = HealthRegistry::new("liveness");
    let enricher = Enricher::new(
        normalizer,
        config.normalizer.phone_fields.clone(),
        queue.clone(),
        output,
        config.output_group_key.as_str(),
    );
    let consumer = Consumer::new(
        "enricher",
        queue,
        intake,
        enricher,
        config
            .consumer_settings()
            .wrap_err("invalid consumer settings")?,
        liveness.register("enricher".to_owned(), config.liveness_deadline.0),
    );

    let shutdown = shutdown_token()?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { serve(router, &bind, shutdown).await })
    };

    let result = consumer.run(shutdown.clone()).await;

    shutdown.cancel();
    server.await?.wrap_err("metrics server failed")?;
    result.wrap_err("consumer loop failed")?;
    info!("enricher stopped");

    Ok(())
}
