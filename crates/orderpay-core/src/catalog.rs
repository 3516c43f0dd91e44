//! # Catalog
//!
//! Read-only product lookup consumed by the order builder.
//! Products are loaded from `config/products.toml` in the server binary.

use crate::error::EngineResult;
use crate::money::Amount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Purchasable status of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    OutOfStock,
}

impl Default for ProductStatus {
    fn default() -> Self {
        ProductStatus::Active
    }
}

/// A product in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    /// Unique product identifier (e.g., "mech-keyboard-87")
    pub id: String,

    /// Display name
    pub name: String,

    /// Current catalog price
    pub price: Amount,

    #[serde(default)]
    pub status: ProductStatus,

    /// Initial stock seeded into the stock ledger at startup
    #[serde(default)]
    pub stock: u64,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Amount) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            status: ProductStatus::Active,
            stock: 0,
        }
    }

    /// Builder: set seed stock
    pub fn with_stock(mut self, stock: u64) -> Self {
        self.stock = stock;
        self
    }

    /// Builder: set status
    pub fn with_status(mut self, status: ProductStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_purchasable(&self) -> bool {
        self.status == ProductStatus::Active
    }
}

/// Authoritative product lookup.
///
/// Implementations must read price and status from the source of truth,
/// never from a display cache.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_product(&self, product_id: &str) -> EngineResult<Option<Product>>;
}

/// Serialized catalog file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub products: Vec<Product>,
}

impl CatalogFile {
    /// Load catalog from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

/// In-process catalog backed by a map
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<String, Product>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_products(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: RwLock::new(products.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }

    pub async fn upsert(&self, product: Product) {
        self.products.write().await.insert(product.id.clone(), product);
    }

    /// Change the current price; existing orders keep their snapshot
    pub async fn set_price(&self, product_id: &str, price: Amount) -> bool {
        match self.products.write().await.get_mut(product_id) {
            Some(product) => {
                product.price = price;
                true
            }
            None => false,
        }
    }

    pub async fn set_status(&self, product_id: &str, status: ProductStatus) -> bool {
        match self.products.write().await.get_mut(product_id) {
            Some(product) => {
                product.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn products(&self) -> Vec<Product> {
        self.products.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_product(&self, product_id: &str) -> EngineResult<Option<Product>> {
        Ok(self.products.read().await.get(product_id).cloned())
    }
}
