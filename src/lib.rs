//! Sensor/dataset provisioning orchestrator for the water-monitoring
//! backend.
//!
//! This crate owns everything needed to get a new physical or virtual
//! sensor ingesting time-series data: the per-tenant database schema and
//! its credentials, message-broker and object-storage credentials, the
//! FROST compatibility views over the tenant tables, the handoff to the
//! external worker fleet over the message bus, and the cascading
//! teardown. It has no CLI or HTTP surface of its own; the API layer
//! embeds it as a library:
//!
//! - call [`init_tracing`] once at startup,
//! - load a [`Config`] via [`config::load_from_env`],
//! - connect the pools with [`connect_pools`] and run
//!   [`store::create_metadata_schema`],
//! - construct a [`Provisioner`] and call
//!   [`Provisioner::create_sensor`] / [`Provisioner::create_dataset`] /
//!   [`Provisioner::delete_sensor`].
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – metadata-store PostgreSQL DSN
//! - `VAULT_ENCRYPTION_KEY` (**required**) – base64 32-byte secret key
//! - `MQTT_BROKER_HOST`, `MQTT_USER`, `MQTT_PASSWORD` (**required**)
//! - `PROVISION_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `PROVISION_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`config::load_from_env`] for the full list.
use std::{env, io::IsTerminal};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod schema;
pub mod store;
pub mod vault;

pub use config::{BusTransport, Config};
pub use error::{ProvisionError, Result};
pub use models::{
    BrokerCredentials, BucketCredentials, DatabaseCredentials, IngestType, ParserConfig, Project,
    PropertySpec, ProvisioningPayload, ProvisioningState, Thing,
};
pub use orchestrator::{
    Coordinates, CreateDataset, CreateSensor, Provisioned, Provisioner,
};
pub use vault::Vault;

// ---

/// Connect the metadata and tenant pools from configuration.
///
/// The two DSNs may be identical; two pools are still created so the
/// stores can be split later without touching call sites.
pub async fn connect_pools(cfg: &Config) -> Result<(PgPool, PgPool)> {
    // ---
    tracing::info!(
        "Attempting to connect to metadata database: {}",
        config::mask_db_url(&cfg.meta_db_url)
    );

    let meta_pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.meta_db_url)
        .await?;

    let tenant_pool = if cfg.tenant_db_url == cfg.meta_db_url {
        meta_pool.clone()
    } else {
        PgPoolOptions::new()
            .max_connections(cfg.db_pool_max)
            .connect(&cfg.tenant_db_url)
            .await?
    };

    tracing::info!("Successfully connected to databases");
    Ok((meta_pool, tenant_pool))
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by `PROVISION_SPAN_EVENTS`:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `PROVISION_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
pub fn init_tracing() {
    // ---
    let span_events = match env::var("PROVISION_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to PROVISION_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("PROVISION_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
