use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{error, info};

mod api;
mod config;
mod connectivity;
mod db;
mod dispatch;
mod ingest;
mod mqtt;
mod packet;
mod query;
mod schema;
mod utils;

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::Config::load();

    // without the store there is nothing to serve
    let db = Arc::new(
        db::Db::connect(&config.database_url, config.store_timeout)
            .context("failed to connect to database")?,
    );

    // the broker may be down; the API stays up and the worker keeps retrying
    let (reporter, connectivity) = connectivity::monitor();
    let (link, commands, eventloop) = mqtt::connect(&config.mqtt);
    let listener = ingest::IngestListener::new(
        db.clone(),
        config.mqtt.data_topic.clone(),
        config.ingestion_policy,
    );
    let worker = mqtt::MqttWorker::new(
        &link,
        commands,
        listener,
        reporter,
        config.mqtt.reconnect_delay,
    );
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {err}");
            std::future::pending::<()>().await;
        }
    };
    let task = actix_web::rt::spawn(worker.run(eventloop, shutdown));

    let state = api::AppState {
        queries: query::QueryService::new(db),
        dispatcher: dispatch::Dispatcher::new(
            link,
            connectivity,
            config.mqtt.command_topic.clone(),
            config.publish_timeout,
        ),
    };
    let server =
        api::new_http_server(state, &config.http).context("failed to start API server")?;

    let (res, _) = tokio::join!(server, task);
    res.context("API server failed")?;

    info!("Stopped");
    Ok(())
}
