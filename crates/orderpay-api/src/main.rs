//! # orderpay
//!
//! Order/payment transaction server.
//!
//! ## Usage
//!
//! ```bash
//! # Providers are enabled by their credentials
//! export STRIPE_SECRET_KEY=sk_test_...
//! export STRIPE_PUBLISHABLE_KEY=pk_test_...
//! export STRIPE_WEBHOOK_SECRET=whsec_...
//!
//! export BKASH_APP_KEY=...
//! export BKASH_APP_SECRET=...
//! export BKASH_USERNAME=...
//! export BKASH_PASSWORD=...
//! export BKASH_WEBHOOK_SECRET=...
//!
//! # Run the server
//! orderpay
//! ```

use orderpay_api::{routes, state::AppState};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    print_banner();

    let state = AppState::new().await?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    info!("Products loaded: {}", state.catalog.products().await.len());
    info!("Payment providers: {:?}", state.engine.providers());

    let recovered = state.engine.recover_incomplete_checkouts().await?;
    if recovered > 0 {
        info!("Recovered {} interrupted checkouts", recovered);
    }

    spawn_reservation_sweeper(Arc::clone(&state.engine), state.config.sweep_interval);

    let app = routes::create_router(state);

    info!("orderpay starting on http://{}", addr);

    if !is_prod {
        info!("Checkout: POST http://{}/api/v1/checkout", addr);
        info!("Webhooks: POST http://{}/webhook/{{provider}}", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// `RUST_LOG` filtering (default info), JSON lines when `LOG_FORMAT=json`
fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn spawn_reservation_sweeper(engine: Arc<orderpay_engine::Engine>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            engine.sweep_expired_reservations().await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn print_banner() {
    println!(
        r#"
  orderpay
  ━━━━━━━━━━━━━━━━━━━━━━━
  Order/payment transaction engine
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
