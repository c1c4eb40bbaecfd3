use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use stateless_session::{configure_session, crypto::Secret, Session, SessionConfig};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "using a generated secret; sessions will not survive a restart");
            SessionConfig::builder()
                .secret(Secret::generate())
                .expire_after(Duration::from_secs(3600))
                .build()?
        }
    };
    info!(?config, "session configuration loaded");

    let app = Router::new()
        .route("/", get(visit))
        .route("/logout", get(logout))
        .route("/health", get(health_check));
    let app = configure_session(app, config)?.layer(TraceLayer::new_for_http());

    let port = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server running on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn visit(session: Session) -> String {
    let visits = session.get::<u64>("visits").ok().flatten().unwrap_or(0) + 1;
    if let Err(e) = session.insert("visits", visits) {
        warn!(error = %e, "failed to update visit counter");
    }
    format!("visit #{visits}\n")
}

async fn logout(session: Session) -> &'static str {
    session.destroy();
    "bye\n"
}

async fn health_check() -> &'static str {
    "OK"
}
