use std::time::Duration;

use feedfetch::Fetcher;
use lapin::{Connection, ConnectionProperties};
use log::{error, info};
use merchfeed_db::{Postgres, get_pool, migrations};
use merchfeed_ingest::config::Config;
use merchfeed_ingest::decoder::Decoder;
use merchfeed_ingest::handler::Handler;
use merchfeed_ingest::parser::Parser;
use merchfeed_ingest::rabbitmq::RabbitMq;
use miette::IntoDiagnostic;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> miette::Result<()> {
    env_logger::init();

    let config = Config::config().into_diagnostic()?;
    let cancel = CancellationToken::new();

    migrations::run_migrations(&config.database_url)?;

    let amqp_connection =
        Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .into_diagnostic()?;
    let mut rmq = RabbitMq::new(
        &amqp_connection,
        config.rabbitmq_exchange.clone(),
        cancel.clone(),
    )
    .await
    .into_diagnostic()?;

    let pool = get_pool(&config.database_url, config.db_pool_size).into_diagnostic()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout))
        .build()
        .into_diagnostic()?;

    let parser = Parser::new(
        Fetcher::new(client, config.user_agent.clone()),
        Decoder,
        Postgres::new(pool),
        config.batch_size,
    );

    let handler = Handler::new(parser);
    handler
        .start(&mut rmq, &config.rabbitmq_queue)
        .await
        .into_diagnostic()?;

    info!("feed parser up and running");

    shutdown_signal().await;

    info!("graceful shutdown start");
    cancel.cancel();

    // Wait for the in-flight delivery to be handled before tearing down the
    // broker connection.
    rmq.done().await;

    if let Err(err) = amqp_connection.close(200, "shutting down").await {
        error!("can't close RabbitMQ connection: {err}");
    }

    info!("graceful shutdown successful");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("can't install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
