use actix_web::{web, App, HttpServer};
use chat_delivery_service::{
    buffer::{start_psub_listener, BufferStore, EventHub, MemoryBufferStore, RedisBufferStore},
    config::{BufferBackend, Config, DurableBackend},
    db,
    error::AppError,
    logging,
    middleware::{SignatureVerifier, TokenVerifier},
    routes,
    services::{
        ChatRepository, ChatServices, FlushPolicy, MembershipChecker, MemoryChatRepository,
        PgChatRepository, PgMembership, QStashClient, StaticMembership,
    },
    state::AppState,
};
use redis_utils::RedisPool;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let hub = EventHub::new(cfg.subscriber_buffer);

    let redis = match cfg.buffer_backend {
        BufferBackend::Redis => Some(
            RedisPool::connect(&cfg.redis_url)
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?,
        ),
        BufferBackend::Memory => None,
    };

    let buffer: Arc<dyn BufferStore> = match &redis {
        Some(pool) => {
            // Cross-instance fan-out: every published event comes back through the hub.
            actix_web::rt::spawn(start_psub_listener(pool.clone(), hub.clone()));
            Arc::new(RedisBufferStore::new(
                pool.clone(),
                hub.clone(),
                cfg.redis_command_timeout,
            ))
        }
        None => {
            tracing::warn!("using in-memory buffer store; events stay on this instance");
            Arc::new(MemoryBufferStore::new(hub.clone()))
        }
    };

    let (repo, membership): (Arc<dyn ChatRepository>, Arc<dyn MembershipChecker>) =
        match (cfg.durable_backend, cfg.database_url.as_deref()) {
            (DurableBackend::Postgres, Some(url)) => {
                let pool = db::init_pool(url)
                    .await
                    .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
                (
                    Arc::new(
                        PgChatRepository::new(pool.clone(), cfg.db_command_timeout)
                            .with_cache(redis.clone(), cfg.redis_command_timeout),
                    ),
                    Arc::new(PgMembership::new(pool, cfg.db_command_timeout)),
                )
            }
            (DurableBackend::Postgres, None) => {
                return Err(AppError::Config("DATABASE_URL missing".into()))
            }
            (DurableBackend::Memory, _) => {
                tracing::warn!("using in-memory durable store; nothing survives a restart");
                (
                    Arc::new(MemoryChatRepository::new()),
                    Arc::new(StaticMembership::new()),
                )
            }
        };

    let delivery = Arc::new(QStashClient::new(&cfg.qstash)?);
    let services = ChatServices::new(
        buffer,
        repo,
        membership,
        delivery,
        FlushPolicy::from(&cfg.flush),
        cfg.seen_lookup_concurrency,
    );

    let signature = SignatureVerifier::new(cfg.signing.current.clone(), cfg.signing.next.clone());
    if !signature.is_configured() {
        tracing::warn!("no flush signing keys configured; every flush callback will be rejected");
    }

    let state = AppState {
        services,
        tokens: Arc::new(TokenVerifier::new(&cfg.jwt_secret)),
        signature: Arc::new(signature),
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting chat-delivery-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .shutdown_timeout(cfg.shutdown_grace.as_secs())
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| AppError::StartServer(format!("server: {e}")))
}
