//! pgexporter-core — PostgreSQL metrics exporter engine.
//!
//! Provides:
//! - `descriptors` — query mappings, built-in and user queries, settings
//! - `collector` — scraping engine and the default exporter
//! - `probe` — per-request collector for `/probe`
//! - `pool` — per-target connections, serialization, shutdown
//! - `datasource` / `dsn` / `config` — target resolution and auth modules
//! - `connection` — database seam (`postgres` driver and a scripted mock)
//! - `scrape` — samples, errors, exposition families

pub mod collector;
pub mod config;
pub mod connection;
pub mod datasource;
pub mod descriptors;
pub mod dsn;
pub mod error;
pub mod options;
pub mod pool;
pub mod probe;
pub mod scrape;
pub mod values;
