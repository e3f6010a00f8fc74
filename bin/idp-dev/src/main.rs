//! Identity Provider Development Server
//!
//! Runs every component in one process against in-memory stores:
//! - SSO pipeline (signed authentication requests to signed responses)
//! - Authorization decisions over the synchronized policy cache
//! - Policy cache synchronizer with cache-clear fan-out
//! - Logout fan-out with background redelivery
//! - Attribute queries answered from the session store
//!
//! Policies are seeded from the files listed under `[[policies]]`.

mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use idp_codec::{HmacJsonCodec, StaticKeyResolver};
use idp_common::{
    IdentifierGenerator, MetadataResolver, RandomIdentifierGenerator, SignedMessageCodec, SigningIdentity,
};
use idp_config::{IdpConfig, RetryConfig};
use idp_delivery::{
    Acceptance, HttpTransport, HttpTransportConfig, PayloadRegenerator, RetryPolicy, RetryingDelivery,
    SignedExchangeSender, SignedMessageRegenerator,
};
use idp_policy::{
    AuthorizationProcessor, ClearCacheSigner, DecisionEngine, PolicyCache, PolicyCacheSynchronizer, SyncConfig,
};
use idp_sso::{
    AttributeAuthorityProcessor, AuthnRequestHandler, Handler, LogoutService, ResponseFactory, ResponseSettings, SessionValidator,
    SignedResponseHandler, SsoPipeline,
};
use idp_store::{InMemoryPolicyStore, InMemorySessionStore, StaticMetadata};

use crate::routes::{AppState, SuspendedTransactions};

#[derive(Parser, Debug)]
#[command(name = "idp-dev")]
#[command(about = "Identity provider development server")]
struct Args {
    /// Configuration file
    #[arg(long, env = "IDP_CONFIG", default_value = "idp.toml")]
    config: String,

    /// HTTP port
    #[arg(long, env = "IDP_PORT", default_value = "8080")]
    port: u16,

    /// Lifetime of sessions created through /sessions
    #[arg(long, env = "IDP_SESSION_LIFETIME_SECS", default_value = "28800")]
    session_lifetime_secs: i64,

    /// How long a suspended SSO transaction waits to be resumed
    #[arg(long, env = "IDP_TRANSACTION_LIFETIME_SECS", default_value = "600")]
    transaction_lifetime_secs: i64,

    /// Interval between expired session and transaction sweeps
    #[arg(long, env = "IDP_SESSION_PURGE_INTERVAL_SECS", default_value = "60")]
    session_purge_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = IdpConfig::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    idp_common::logging::init_tracing(config.logging.json);

    info!("Starting identity provider development server");
    info!(
        issuer = %config.identity.issuer,
        services = config.services.len(),
        default_decision = %config.authorization.default_decision,
        "Configuration loaded"
    );

    // 1. Signing and identifiers
    let keys = StaticKeyResolver::from_hex(config.keys.iter())?;
    let codec: Arc<dyn SignedMessageCodec> = Arc::new(HmacJsonCodec::new(Arc::new(keys)));
    let identity = SigningIdentity::new(config.identity.signing_key_name.clone());
    let issuer = config.identity.issuer.clone();
    let identifiers: Arc<dyn IdentifierGenerator> = Arc::new(RandomIdentifierGenerator);

    // 2. Stores and metadata
    let sessions = Arc::new(InMemorySessionStore::new(identifiers.clone()));
    let metadata: Arc<dyn MetadataResolver> = Arc::new(StaticMetadata::new(config.services.clone()));
    let policy_store = Arc::new(InMemoryPolicyStore::new());
    for seed in &config.policies {
        let document = std::fs::read_to_string(&seed.path)
            .with_context(|| format!("failed to read policy {}", seed.path.display()))?;
        let sequence_id = policy_store
            .put_document(&seed.service_id, &document)
            .with_context(|| format!("invalid policy {}", seed.path.display()))?;
        info!(service_id = %seed.service_id, path = %seed.path.display(), sequence_id, "Seeded policy");
    }

    // 3. Outbound delivery
    let transport = Arc::new(HttpTransport::new(HttpTransportConfig {
        connect_timeout: config.transport.connect_timeout(),
        request_timeout: config.transport.request_timeout(),
        ..Default::default()
    })?);
    let regenerator: Arc<dyn PayloadRegenerator> = Arc::new(SignedMessageRegenerator::new(
        codec.clone(),
        identity.clone(),
        identifiers.clone(),
    ));
    let delivery = |name: &str, retry: &RetryConfig, acceptance: Acceptance| {
        RetryingDelivery::new(
            name,
            RetryPolicy {
                retry_interval: retry.retry_interval(),
                max_age: retry.max_age(),
            },
            regenerator.clone(),
            Arc::new(SignedExchangeSender::new(
                transport.clone(),
                codec.clone(),
                acceptance,
                config.transport.request_timeout(),
            )),
        )
        .map(Arc::new)
    };
    let logout_retry = delivery("logout", &config.logout_retry, Acceptance::AnyVerifiedResponse)?;
    let cache_retry = delivery("cache-clear", &config.cache_retry, Acceptance::SuccessStatus)?;

    // 4. Authorization
    let cache = Arc::new(PolicyCache::new());
    let sync = Arc::new(PolicyCacheSynchronizer::new(
        SyncConfig {
            poll_interval: config.policy_sync.poll_interval(),
            ..Default::default()
        },
        cache.clone(),
        policy_store,
        metadata.clone(),
        ClearCacheSigner {
            codec: codec.clone(),
            identity: identity.clone(),
            issuer: issuer.clone(),
            identifiers: identifiers.clone(),
        },
        cache_retry.clone(),
    )?);
    // load before serving so the first decisions see the seeded policies
    if let Err(e) = sync.poll_once().await {
        warn!(error = %e, "Initial policy load failed, will retry on the next poll");
    }
    let engine = Arc::new(DecisionEngine::new(cache, config.authorization.default_decision));
    let authz = Arc::new(AuthorizationProcessor::new(
        engine.clone(),
        sessions.clone(),
        metadata.clone(),
        codec.clone(),
        identity.clone(),
        issuer.clone(),
        identifiers.clone(),
    ));

    let attributes = Arc::new(AttributeAuthorityProcessor::new(
        sessions.clone(),
        metadata.clone(),
        codec.clone(),
        identity.clone(),
        issuer.clone(),
        identifiers.clone(),
        config.sso.allowed_time_skew(),
    )?);

    // 5. SSO pipeline
    let responses = Arc::new(ResponseFactory::new(
        codec.clone(),
        identity.clone(),
        issuer.clone(),
        identifiers.clone(),
        ResponseSettings {
            allowed_time_skew: config.sso.allowed_time_skew(),
            identifier_format_attributes: config.sso.identifier_format_attributes.clone(),
            vendor_override_marker: config.sso.vendor_override_marker.clone(),
            vendor_override_attribute: config.sso.vendor_override_attribute.clone(),
        },
    )?);
    let request_handlers: Vec<Arc<dyn Handler>> =
        vec![Arc::new(AuthnRequestHandler::new(codec.clone(), metadata.clone()))];
    let response_handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(SignedResponseHandler::new(responses.clone()))];
    let pipeline = Arc::new(SsoPipeline::new(
        request_handlers,
        SessionValidator::new(sessions.clone(), identifiers.clone(), responses),
        response_handlers,
    )?);

    // 6. Logout
    let logout = Arc::new(LogoutService::new(
        sessions.clone(),
        metadata,
        codec,
        identity,
        issuer,
        identifiers.clone(),
        logout_retry.clone(),
    ));

    // 7. Background loops
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sync_handle = sync.start();
    let logout_retry_handle = logout_retry.start();
    let cache_retry_handle = cache_retry.start();
    let suspended = Arc::new(SuspendedTransactions::new());
    let purge_handle = {
        let sessions = sessions.clone();
        let suspended = suspended.clone();
        let transaction_lifetime = chrono::Duration::seconds(args.transaction_lifetime_secs);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let period = Duration::from_secs(args.session_purge_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        sessions.purge_expired(now);
                        routes::purge_suspended(&suspended, now, transaction_lifetime);
                    }
                }
            }
        })
    };

    // 8. HTTP server
    let state = AppState {
        sessions,
        engine,
        authz,
        attributes,
        pipeline,
        logout,
        sync: sync.clone(),
        logout_retry: logout_retry.clone(),
        cache_retry: cache_retry.clone(),
        identifiers,
        suspended,
        session_lifetime: chrono::Duration::seconds(args.session_lifetime_secs),
    };
    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Identity provider listening on http://{}", addr);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("HTTP server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("HTTP server shutting down");
                }
            }
        })
    };

    info!("Press Ctrl+C to shutdown");
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let _ = shutdown_tx.send(());
    sync.shutdown();
    logout_retry.shutdown();
    cache_retry.shutdown();

    let shutdown_timeout = Duration::from_secs(30);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = server_handle.await;
        let _ = purge_handle.await;
        let _ = sync_handle.await;
        let _ = logout_retry_handle.await;
        let _ = cache_retry_handle.await;
    })
    .await;

    if logout_retry.pending() > 0 || cache_retry.pending() > 0 {
        warn!(
            logout = logout_retry.pending(),
            cache_clear = cache_retry.pending(),
            "Undelivered messages dropped at shutdown"
        );
    }
    info!("Identity provider shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
