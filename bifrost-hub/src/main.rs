//! Process wiring: datastore, oracles, subscribers, workers, and the
//! well-known HTTP server.

mod config;
mod convert;
mod receive;
mod send;
mod well_known;

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use bifrost_atproto::blobs::RemoteBlobCache;
use bifrost_atproto::dns::LoggingDnsAdmin;
use bifrost_atproto::firehose::{FirehoseHandler, FirehoseSubscriber};
use bifrost_atproto::identity::AtprotoIdentity;
use bifrost_atproto::plc::PlcClient;
use bifrost_atproto::repo::DatastoreRepoStorage;
use bifrost_atproto::services::{XrpcChatService, XrpcModerationService};
use bifrost_atproto::shadow::ShadowRepos;
use bifrost_core::convert::Converter;
use bifrost_core::store::Datastore;
use bifrost_core::tasks::{Dispatcher, InProcessQueue, Task, TaskRunner};
use bifrost_core::userset::UserSetLoader;
use bifrost_core::CoreError;
use bifrost_nostr::hub::NostrHub;
use bifrost_nostr::identity::NostrIdentity;

use config::Config;
use convert::DefaultConverter;
use receive::ReceiveWorker;
use send::SendEngine;
use well_known::AppState;

/// Runs tasks synchronously through the receive worker, which is built after
/// the dispatcher it needs. Inline mode only.
struct LateRunner(OnceLock<Arc<ReceiveWorker>>);

#[async_trait]
impl TaskRunner for LateRunner {
    async fn run(&self, task: Task) -> bifrost_core::Result<()> {
        match self.0.get() {
            Some(worker) => {
                worker.handle(task).await.map_err(|e| CoreError::TaskQueue(e.to_string()))
            }
            None => Err(CoreError::TaskQueue("receive worker not wired yet".into())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let config = Config::parse();
    let domains = config.domains();

    let store = Datastore::open(&config.data_dir)?;
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("bifrost (https://fed.brid.gy/)")
        .build()?;

    // task transport
    let inline_runner = Arc::new(LateRunner(OnceLock::new()));
    let (queue, task_rx) = InProcessQueue::new();
    let dispatcher = Arc::new(if config.inline_tasks {
        Dispatcher::inline(inline_runner.clone())
    } else {
        Dispatcher::new(queue)
    });

    // atproto side
    let storage = Arc::new(DatastoreRepoStorage::new(&store)?);
    let plc = Arc::new(PlcClient::new(format!("https://{}", config.plc_host), http.clone()));
    let resolver = hickory_resolver::TokioAsyncResolver::tokio(
        Default::default(),
        Default::default(),
    );
    let identity = Arc::new(AtprotoIdentity::new(
        store.clone(),
        plc.clone(),
        storage.clone(),
        http.clone(),
        format!("https://{}", config.appview_host),
        Some(resolver),
    ));
    let blobs = RemoteBlobCache::new(store.clone(), http.clone());
    let converter: Arc<dyn Converter> = Arc::new(DefaultConverter::new(store.clone(), blobs));
    let chat = Arc::new(XrpcChatService::new(
        format!("https://{}", config.chat_host),
        config.chat_did.clone(),
        http.clone(),
    ));
    let moderation = Arc::new(XrpcModerationService::new(
        format!("https://{}", config.mod_service_host),
        config.mod_service_did.clone(),
        http.clone(),
    ));
    let shadow = Arc::new(ShadowRepos::new(
        store.clone(),
        storage.clone(),
        plc.clone(),
        Arc::new(LoggingDnsAdmin),
        dispatcher.clone(),
        converter.clone(),
        chat,
        moderation,
        domains.clone(),
    ));

    // nostr side
    let nostr_identity = Arc::new(NostrIdentity::new(
        store.clone(),
        http.clone(),
        config.nostr_default_relay.clone(),
    ));

    // engine and workers
    let engine = Arc::new(SendEngine::new(
        store.clone(),
        shadow,
        nostr_identity,
        converter.clone(),
        domains.clone(),
    ));
    let worker = Arc::new(ReceiveWorker::new(store.clone(), engine, converter.clone()));
    let _ = inline_runner.0.set(worker.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // relevant-set loader feeds both subscribers
    let (loader, sets_rx) = UserSetLoader::new(store.clone());
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    tokio::spawn(loader.run(shutdown_rx.clone(), relay_tx));

    // atproto firehose
    let (subscriber, events_rx) =
        FirehoseSubscriber::new(config.bgs_host.clone(), store.clone(), sets_rx.clone());
    tokio::spawn(subscriber.run(shutdown_rx.clone()));
    let handler = FirehoseHandler::new(store.clone(), dispatcher.clone(), identity);
    tokio::spawn(handler.run(events_rx));

    // nostr relays, default first, the rest discovered by the loader
    let hub = NostrHub::new(
        store.clone(),
        dispatcher.clone(),
        sets_rx,
        domains.clone(),
        shutdown_rx.clone(),
    );
    hub.add_relay(&config.nostr_default_relay);
    {
        let hub = hub.clone();
        tokio::spawn(async move {
            while let Some(url) = relay_rx.recv().await {
                hub.add_relay(&url);
            }
        });
    }

    // receive workers
    if !config.inline_tasks {
        tokio::spawn(worker.run(task_rx));
    }

    // well-known endpoints
    let app = well_known::router(Arc::new(AppState { store: store.clone(), domains }));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %config.listen, "bifrost hub up");

    tokio::select! {
        result = axum::serve(listener, app) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
            // let subscribers close their sockets and drain in-flight work
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            store.flush()?;
        }
    }
    Ok(())
}
