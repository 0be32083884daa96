//! Work Harness Coordinator service binary.
//!
//! Hosts the three background worker loops (outbox publisher, inbox
//! dispatcher, perspective runner) against one Postgres database, plus a
//! health/readiness HTTP server. Grounded directly on
//! `sr-governor/main.rs`'s `GovernorState`/`run_governor_loop`/
//! `shutdown_signal` shape.

mod config;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use config::ServiceConfig;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use wh_core::{InstanceId, WorkClass};
use wh_runtime::{channel, ReceptorRegistry, WorkerLoop};
use wh_store::PgWorkStore;

struct ServiceState {
    config: ServiceConfig,
    instance_id: InstanceId,
    ready: AtomicBool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServiceConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    let instance_id = InstanceId::new();
    let host_name = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let process_id = std::process::id();

    info!(
        service = %config.service_name,
        %instance_id,
        host_name = %host_name,
        "starting work harness coordinator"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_db_connections)
        .connect(&config.database_url)
        .await?;

    info!("database connection established, applying migrations");
    for (name, sql) in wh_store::migrations::ALL {
        sqlx::raw_sql(sql).execute(&pool).await.map_err(|e| {
            error!(migration = name, error = %e, "migration failed");
            e
        })?;
    }

    let store = Arc::new(PgWorkStore::new(pool));

    let state = Arc::new(ServiceState {
        config: config.clone(),
        instance_id,
        ready: AtomicBool::new(true),
    });

    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_state = state.clone();
    let health_app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .layer(TraceLayer::new_for_http());

    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "health server listening");
        match tokio::net::TcpListener::bind(health_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, health_app).await {
                    error!(error = %e, "health server error");
                }
            }
            Err(e) => error!(error = %e, "failed to bind health server"),
        }
    });

    let cancellation = CancellationToken::new();
    let receptors = Arc::new(ReceptorRegistry::new());

    let mut worker_handles = Vec::new();
    for work_class in [WorkClass::Outbox, WorkClass::Inbox, WorkClass::Perspective] {
        let (channel_tx, channel_rx) = channel::channel(256);
        let worker = Arc::new(WorkerLoop::new(
            work_class,
            store.clone(),
            wh_runtime::AlwaysReady,
            channel_tx,
            config.worker.clone(),
            instance_id,
            config.service_name.clone(),
            host_name.clone(),
            process_id,
        ));

        let worker_cancellation = cancellation.clone();
        let worker_for_loop = worker.clone();
        worker_handles.push(tokio::spawn(async move {
            worker_for_loop.run(worker_cancellation).await;
        }));

        let sink = worker.result_sink();
        let receptors = receptors.clone();
        let consumer_cancellation = cancellation.clone();
        worker_handles.push(tokio::spawn(async move {
            run_consumer(work_class, channel_rx, sink, receptors, consumer_cancellation).await;
        }));
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping workers");
    state.ready.store(false, Ordering::Relaxed);
    cancellation.cancel();

    for handle in worker_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), handle).await;
    }
    health_server.abort();

    info!("work harness coordinator shutdown complete");
    Ok(())
}

/// Drains claimed items for one work class, dispatching each to the
/// matching registry and reporting the outcome back to the worker's
/// local bags for the next orchestrator call. Concrete transport
/// delivery for outbox items is out of scope (`spec.md` §1); this loop
/// logs what it would hand off. The perspective arm is the skeleton
/// runner (`DESIGN.md` Open Question 2): it marks a claimed checkpoint
/// processed without loading or applying any event.
async fn run_consumer(
    work_class: WorkClass,
    channel: wh_runtime::WorkChannelConsumer,
    sink: wh_runtime::ResultSink,
    receptors: Arc<ReceptorRegistry>,
    cancellation: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            item = channel.recv() => item,
            _ = cancellation.cancelled() => return,
        };

        let Some(item) = item else {
            return;
        };

        match work_class {
            WorkClass::Outbox => {
                info!(message_id = %item.message_id, "would hand outbox item to transport");
                sink.complete(wh_core::MessageCompletion {
                    message_id: item.message_id,
                    completed_status: wh_core::StatusFlags::PUBLISHED,
                })
                .await;
            }
            WorkClass::Inbox => {
                let handler_name = item.handler_name.as_deref().unwrap_or_default();
                let outcome = receptors
                    .dispatch(handler_name, &item.envelope_type, &item.envelope_data)
                    .await;
                match outcome {
                    wh_ports::ReceptorOutcome::Ok(_) => {
                        sink.complete(wh_core::MessageCompletion {
                            message_id: item.message_id,
                            completed_status: wh_core::StatusFlags::RECEPTOR_PROCESSED,
                        })
                        .await;
                    }
                    wh_ports::ReceptorOutcome::Failed { error_kind, message } => {
                        warn!(message_id = %item.message_id, error_kind, message, "receptor failed");
                        sink.fail(wh_core::MessageFailure {
                            message_id: item.message_id,
                            completed_status: wh_core::StatusFlags::empty(),
                            error: message,
                        })
                        .await;
                    }
                }
            }
            WorkClass::Perspective => {
                // Skeleton runner: this core has no event-log table to
                // load `item`'s events from, so the claimed checkpoint is
                // marked processed directly, without running a
                // projection or advancing `last_event_id`. A host with
                // its own event store can dispatch through
                // `wh_runtime::ApplierRegistry` here instead.
                info!(
                    checkpoint_id = %item.message_id,
                    perspective = item.handler_name.as_deref().unwrap_or_default(),
                    "marking perspective checkpoint processed (skeleton runner)"
                );
                sink.complete(wh_core::MessageCompletion {
                    message_id: item.message_id,
                    completed_status: wh_core::StatusFlags::PERSPECTIVE_PROCESSED_ASYNC,
                })
                .await;
            }
        }
    }
}

async fn ready_handler(state: Arc<ServiceState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": if state.ready.load(Ordering::Relaxed) { "ready" } else { "not_ready" },
        "service": state.config.service_name,
        "instance_id": state.instance_id.to_string(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
