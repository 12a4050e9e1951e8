use crate::{
    APP_USER_AGENT,
    api::{self, AppState},
    auth::{AuthManager, AuthSettings, IdentityServices, password::spawn_hash},
    cli::{
        commands::{auth as auth_args, auth::AdminBootstrap, gateway, geo},
        telemetry,
    },
    client_info::{CachedGeoLookup, ClientInfoExtractor, HttpGeoLookup},
    middleware::LogTrafficRecorder,
    session::SessionStore,
    store::{
        CreateUserOutcome, NewUser, UserRepository,
        memory::{MemorySessionRepository, MemoryTokenRepository, MemoryUserRepository},
        postgres::{PgSessionRepository, PgTokenRepository, PgUserRepository, apply_schema},
    },
    token::TokenService,
};
use anyhow::{Context, Result};
use reqwest::Client;
use secrecy::ExposeSecret;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    /// In-memory stores when absent.
    pub dsn: Option<String>,
    pub gateway: gateway::Options,
    pub auth: auth_args::Options,
    pub geo: geo::Options,
}

/// Run the gateway until SIGINT or SIGTERM.
///
/// # Errors
/// Returns an error if the database, a provider, the route table or the listener
/// cannot be set up.
pub async fn execute(args: Args) -> Result<()> {
    let client = Client::builder()
        .user_agent(APP_USER_AGENT)
        .timeout(OUTBOUND_TIMEOUT)
        .build()?;

    let pool = match args.dsn.as_deref() {
        Some(dsn) => Some(connect(dsn).await?),
        None => {
            warn!("no --dsn given, users, sessions and tokens are kept in memory");
            None
        }
    };

    let services = identity_services(pool.as_ref(), &args.auth);

    if let Some(admin) = &args.auth.admin {
        bootstrap_admin(services.users.as_ref(), admin).await?;
    }

    let settings = AuthSettings {
        gateway_base_url: args.gateway.gateway_base_url.clone(),
        session_ttl: time::Duration::seconds(args.auth.session_ttl_seconds),
        basic_failure_delay: Duration::from_millis(args.auth.basic_auth_failure_delay_ms),
    };

    let mut auth = AuthManager::new(services, settings, client.clone());
    for provider in &args.gateway.config.providers {
        auth.register_provider(provider)
            .with_context(|| format!("Failed to register provider {}", provider.name))?;
        info!(provider = %provider.name, "registered delegated identity provider");
    }

    let geo_lookup = args.geo.lookup_url.as_ref().map(|url| {
        info!(url = %url, "geolocation enabled");
        Arc::new(CachedGeoLookup::new(
            Arc::new(HttpGeoLookup::new(url.clone(), client.clone())),
            args.geo.cache_ttl,
            args.geo.cache_capacity,
        ))
    });

    let state = Arc::new(AppState {
        auth: Arc::new(auth),
        client_info: Arc::new(ClientInfoExtractor::new(geo_lookup)),
        traffic: Arc::new(LogTrafficRecorder),
        pool,
    });

    if let Some(path) = &args.gateway.config_path {
        info!(path = %path.display(), routes = args.gateway.config.routes.len(), "loaded gateway config");
    }

    let app = api::app(state, &args.gateway.config)?;

    let result = api::serve(args.port, app, shutdown_signal()).await;

    telemetry::shutdown_tracer();

    result
}

async fn connect(dsn: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 30))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;
    apply_schema(&pool)
        .await
        .context("Failed to apply database schema")?;
    info!("database schema applied");
    Ok(pool)
}

fn identity_services(pool: Option<&PgPool>, options: &auth_args::Options) -> IdentityServices {
    let window = time::Duration::seconds(options.token_session_window_seconds);

    match pool {
        Some(pool) => {
            let users: Arc<dyn UserRepository> = Arc::new(PgUserRepository::new(pool.clone()));
            IdentityServices {
                sessions: Arc::new(
                    SessionStore::new(Arc::new(PgSessionRepository::new(pool.clone())))
                        .with_token_session_window(window),
                ),
                tokens: Arc::new(TokenService::new(
                    Arc::new(PgTokenRepository::new(pool.clone())),
                    users.clone(),
                )),
                users,
            }
        }
        None => {
            let users: Arc<dyn UserRepository> = Arc::new(MemoryUserRepository::default());
            IdentityServices {
                sessions: Arc::new(
                    SessionStore::new(Arc::new(MemorySessionRepository::default()))
                        .with_token_session_window(window),
                ),
                tokens: Arc::new(TokenService::new(
                    Arc::new(MemoryTokenRepository::default()),
                    users.clone(),
                )),
                users,
            }
        }
    }
}

/// Ensure the configured admin exists. An existing user with that name is left as is.
async fn bootstrap_admin(users: &dyn UserRepository, admin: &AdminBootstrap) -> Result<()> {
    if let Some(existing) = users.find_by_username(&admin.username).await? {
        if !existing.is_admin {
            warn!(username = %existing.username, "bootstrap user exists but is not an admin");
        }
        return Ok(());
    }

    let outcome = users
        .create(NewUser {
            username: admin.username.clone(),
            email: admin.email.clone(),
            password_hash: Some(spawn_hash(admin.password.expose_secret().to_string()).await?),
            is_admin: true,
        })
        .await?;

    match outcome {
        CreateUserOutcome::Created(user) => {
            info!(user_id = %user.id, username = %user.username, "created admin user");
        }
        CreateUserOutcome::Conflict => {
            info!(username = %admin.username, "admin user already exists");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
