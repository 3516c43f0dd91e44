//! # Application State
//!
//! Shared state for the Axum application: the engine, its catalog and the
//! server configuration.

use anyhow::Context;
use orderpay_bkash::BkashGateway;
use orderpay_core::{CatalogFile, GatewayRegistry, InMemoryCatalog, InMemoryStore, Product};
use orderpay_engine::{Engine, EngineConfig};
use orderpay_stripe::StripeGateway;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Environment (development, staging, production)
    pub environment: String,
    /// Product catalog with seed stock; falls back to `config/products.toml`
    pub catalog_path: Option<String>,
    /// How often expired reservations are swept
    pub sweep_interval: Duration,
}

impl AppConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            catalog_path: std::env::var("CATALOG_PATH").ok(),
            sweep_interval: Duration::from_secs(
                std::env::var("SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid socket address {}:{}", self.host, self.port))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub catalog: Arc<InMemoryCatalog>,
    pub config: AppConfig,
}

impl AppState {
    /// Build the engine from the environment: catalog file, engine config
    /// and whichever providers are configured.
    pub async fn new() -> anyhow::Result<Self> {
        let config = AppConfig::from_env();

        let products = load_product_catalog(config.catalog_path.as_deref())?;
        let catalog = Arc::new(InMemoryCatalog::from_products(products.clone()));

        let engine = Engine::new(
            EngineConfig::from_env()?,
            catalog.clone(),
            Arc::new(InMemoryStore::new()),
            gateways_from_env()?,
        )?;
        engine.track_products(&products).await;

        Ok(Self::from_parts(engine, catalog, config))
    }

    pub fn from_parts(engine: Engine, catalog: Arc<InMemoryCatalog>, config: AppConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            catalog,
            config,
        }
    }
}

/// Register every provider whose credentials are present.
///
/// A provider with no credentials at all is skipped; one with broken
/// credentials is a startup error.
fn gateways_from_env() -> anyhow::Result<GatewayRegistry> {
    let mut gateways = GatewayRegistry::new();

    if std::env::var("STRIPE_SECRET_KEY").is_ok() {
        let stripe = StripeGateway::from_env().context("Failed to initialize Stripe")?;
        gateways.register(Arc::new(stripe));
    } else {
        warn!("STRIPE_SECRET_KEY not set, Stripe disabled");
    }

    if std::env::var("BKASH_APP_KEY").is_ok() {
        let bkash = BkashGateway::from_env().context("Failed to initialize bKash")?;
        gateways.register(Arc::new(bkash));
    } else {
        warn!("BKASH_APP_KEY not set, bKash disabled");
    }

    Ok(gateways)
}

/// Load product catalog from config file
fn load_product_catalog(explicit: Option<&str>) -> anyhow::Result<Vec<Product>> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path))?;
        return parse_catalog(path, &content);
    }

    let config_paths = [
        "config/products.toml",
        "../config/products.toml",
        "../../config/products.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            return parse_catalog(path, &content);
        }
    }

    warn!("No product catalog found, using empty catalog");
    Ok(Vec::new())
}

fn parse_catalog(path: &str, content: &str) -> anyhow::Result<Vec<Product>> {
    let catalog = CatalogFile::from_toml(content)
        .with_context(|| format!("Failed to parse {}", path))?;
    info!("Loaded {} products from {}", catalog.products.len(), path);
    Ok(catalog.products)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let config = AppConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "test".to_string(),
            catalog_path: None,
            sweep_interval: Duration::from_secs(60),
        };

        assert_eq!(config.socket_addr().unwrap().to_string(), "0.0.0.0:3000");
        assert!(!config.is_production());
    }

    #[test]
    fn test_bad_socket_addr_is_an_error() {
        let config = AppConfig {
            host: "not a host".to_string(),
            port: 3000,
            environment: "test".to_string(),
            catalog_path: None,
            sweep_interval: Duration::from_secs(60),
        };

        assert!(config.socket_addr().is_err());
    }

    #[test]
    fn test_bundled_catalog_parses() {
        let content = include_str!("../../../config/products.toml");
        let products = parse_catalog("config/products.toml", content).unwrap();

        assert!(!products.is_empty());
        assert!(products.iter().all(|p| p.price.is_positive()));
    }
}
