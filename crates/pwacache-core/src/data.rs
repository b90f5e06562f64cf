//! Application JSON documents, loaded through the fetch engine.
//!
//! Any failure degrades to an empty list; the UI renders "no data".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::network::{Destination, ResourceRequest};
use crate::strategy::FetchEngine;

pub const PROFORMAS_PATH: &str = "data/proformas.json";
pub const PRODUCTOS_PATH: &str = "data/productos.json";
pub const PEDIDOS_PATH: &str = "data/pedidos.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Proforma {
    pub id: i64,
    /// Document number.
    pub n: String,
    pub cliente: String,
    pub fecha: String,
    pub entrega: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Producto {
    pub codigo: String,
    pub descripcion: String,
    pub cantidad: f64,
    pub precio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct ProductosPorProforma {
    #[serde(rename = "proformaId")]
    pub proforma_id: i64,
    #[serde(default)]
    pub items: Vec<Producto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Pedido {
    pub id: i64,
    pub n: String,
    pub entrega: String,
    pub empaquetacion: String,
}

#[derive(Clone)]
pub struct DataService {
    engine: FetchEngine,
    base_url: Url,
}

impl DataService {
    /// `base_url` must end with a slash for relative paths to resolve under it.
    pub fn new(engine: FetchEngine, base_url: Url) -> Self {
        Self { engine, base_url }
    }

    /// Load a JSON array at `path` relative to the base URL.
    pub async fn load_list<T: DeserializeOwned>(&self, path: &str) -> Vec<T> {
        let url = match self.base_url.join(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path, error = %e, "Invalid data path");
                return Vec::new();
            }
        };
        let request = ResourceRequest::get(url).with_destination(Destination::Empty);

        let response = match self.engine.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path, error = %e, "Data unavailable, showing empty list");
                return Vec::new();
            }
        };
        match response.json::<Vec<T>>() {
            Ok(items) => items,
            Err(e) => {
                warn!(path, error = %e, "Failed to parse data, showing empty list");
                Vec::new()
            }
        }
    }

    pub async fn proformas(&self) -> Vec<Proforma> {
        self.load_list(PROFORMAS_PATH).await
    }

    pub async fn proforma(&self, id: i64) -> Option<Proforma> {
        self.proformas().await.into_iter().find(|p| p.id == id)
    }

    pub async fn productos_for(&self, proforma_id: i64) -> Option<ProductosPorProforma> {
        self.load_list::<ProductosPorProforma>(PRODUCTOS_PATH)
            .await
            .into_iter()
            .find(|p| p.proforma_id == proforma_id)
    }

    pub async fn pedidos(&self) -> Vec<Pedido> {
        self.load_list(PEDIDOS_PATH).await
    }
}
