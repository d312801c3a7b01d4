use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use worker_lease::clock::{Clock, SystemClock};
use worker_lease::config::{Config, StorageType};
use worker_lease::handlers;
use worker_lease::storage::memory::MemoryStorage;
use worker_lease::storage::redis::RedisStorage;
use worker_lease::storage::LeaseStore;
use worker_lease::telemetry::{LogTelemetry, Telemetry};
use worker_lease::{ElectionAllocator, LeaseEvent, WorkerLease};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // 加载配置
    let config = Config::from_env()?;
    info!("Starting worker-lease with config: {:?}", config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let telemetry: Arc<dyn Telemetry> = Arc::new(LogTelemetry);

    // 创建存储
    let store: Arc<dyn LeaseStore> = match config.storage_type {
        StorageType::Memory => {
            info!("Using memory storage");
            let memory = Arc::new(MemoryStorage::with_options(clock.clone(), config.store.clone()));

            let purge = memory.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    let removed = purge.purge_expired();
                    if removed > 0 {
                        info!("[EXPIRED CLEANUP] Purged {} expired entries", removed);
                    }
                }
            });
            memory as Arc<dyn LeaseStore>
        }
        StorageType::Redis => {
            info!("Using Redis storage");
            let redis_url = config
                .redis_url
                .as_deref()
                .context("Redis URL not configured")?;
            let redis = RedisStorage::new(
                redis_url,
                config.redis_username.clone(),
                config.redis_password.clone(),
                config.redis_db,
                config.store.clone(),
                telemetry.clone(),
            )
            .await
            .context("Failed to connect to Redis")?;
            Arc::new(redis) as Arc<dyn LeaseStore>
        }
    };
    store.initialise().await?;

    let allocator = ElectionAllocator::new(
        store,
        config.worker.clone(),
        clock.clone(),
        telemetry.clone(),
    );
    let worker = Arc::new(WorkerLease::new(
        config.worker.clone(),
        Arc::new(allocator),
        clock,
        telemetry,
    )?);

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LeaseEvent::Allocated { expiry } => {
                    info!("[LEASE] Holding lease until {}", expiry.to_rfc3339())
                }
                LeaseEvent::Expired => log::warn!("[LEASE] Lease expired"),
            }
        }
    });

    let cancel = CancellationToken::new();
    let mut leasing = worker.start_leasing(cancel.clone());

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Server starting on http://{}", bind_addr);
    info!("Swagger UI available at http://{}/swagger-ui/", bind_addr);

    // 启动 HTTP 服务
    let app_worker = worker.clone();
    let server = HttpServer::new(move || {
        let openapi = handlers::ApiDoc::openapi();

        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(app_worker.clone()))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
            .route("/api/lease/status", web::get().to(handlers::lease_status))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested, stopping leasing");
            cancel.cancel();
            None
        }
        joined = &mut leasing => Some(joined),
    };
    let outcome = match finished {
        Some(joined) => joined?,
        None => leasing.await?,
    };

    worker.release().await;
    server_handle.stop(true).await;
    server_task.await??;

    if let Err(e) = &outcome {
        log::error!("[LEASE] Leasing stopped on error: {}", e);
    }
    Ok(outcome?)
}
