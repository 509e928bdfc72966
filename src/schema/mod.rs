//! Tenant schema management: name resolution, sequence numbering and
//! structure cloning.
//!
//! Ensures the physical schema for a tenant exists and carries the same
//! table structure as the template schema before the external worker is
//! asked to materialize anything into it. All DDL is idempotent
//! (`IF NOT EXISTS`) so repeated provisioning calls are safe.
//!
//! Schema and table names cannot be bound as SQL parameters, so every
//! identifier that reaches a DDL string goes through [`quote_ident`],
//! which rejects anything outside `[a-z0-9_]`.

mod views;

pub use views::{check_views_exist, ensure_frost_views, frost_view_sql, FROST_VIEW_NAMES};

use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProvisionError, Result};
use crate::store::MetadataStore;

// ---

/// Resolves logical tenant names to physical schema names and clones the
/// template structure into new schemas.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    prefix: String,
}

impl SchemaRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.schema_prefix.clone())
    }

    /// Deterministic default schema name for a tenant slug.
    pub fn default_schema(&self, slug: &str) -> String {
        format!("{}_{}_1", self.prefix, slug)
    }

    /// Resolve a logical tenant name to a physical schema name.
    ///
    /// Lookup order:
    /// 1. exact tenant-name match in the metadata store,
    /// 2. exact match in the legacy store,
    /// 3. pattern match against existing physical schemas
    ///    `<prefix>_<slug>_*` (lowest sequence wins),
    /// 4. deterministic default `<prefix>_<slug>_1`.
    ///
    /// Idempotent: repeated calls with the same name return the same
    /// schema even before creation completes, because steps 3 and 4 are
    /// pure functions of the existing catalog state.
    pub async fn resolve_schema(
        &self,
        store: &MetadataStore,
        tenant_pool: &PgPool,
        tenant_name: &str,
    ) -> Result<String> {
        // ---
        resolve_schema_with(
            &self.prefix,
            tenant_name,
            || async move {
                Ok(store
                    .find_project_by_name(tenant_name)
                    .await?
                    .map(|project| project.database_schema))
            },
            || store.find_legacy_schema(tenant_name),
            |pattern| async move { list_schemas_like(tenant_pool, &pattern).await },
        )
        .await
    }

    /// Next free sequence number for schemas named `<prefix>_<slug>_<n>`.
    ///
    /// Returns `max + 1` over the existing numeric suffixes, tolerating
    /// gaps and ignoring non-numeric suffixes; `1` when none exist.
    pub async fn next_schema_sequence_number(&self, pool: &PgPool, slug: &str) -> Result<i32> {
        // ---
        let stem = format!("{}_{}_", self.prefix, slug);
        let names = list_schemas_like(pool, &format!("{stem}%")).await?;

        let max = names
            .iter()
            .filter_map(|name| trailing_sequence(name, &stem))
            .max();

        Ok(max.map_or(1, |n| n + 1))
    }
}

// ---

/// Schema resolution over its three lookup sources, in order: project
/// record, legacy store, catalog pattern match (lowest sequence wins),
/// then the deterministic default. Steps 3 and 4 are pure functions of
/// the catalog state, so repeated resolution of the same name is stable
/// even before creation completes.
async fn resolve_schema_with<P, PFut, L, LFut, C, CFut>(
    prefix: &str,
    tenant_name: &str,
    project_schema: P,
    legacy_schema: L,
    catalog_schemas: C,
) -> Result<String>
where
    P: FnOnce() -> PFut,
    PFut: std::future::Future<Output = Result<Option<String>>>,
    L: FnOnce() -> LFut,
    LFut: std::future::Future<Output = Result<Option<String>>>,
    C: FnOnce(String) -> CFut,
    CFut: std::future::Future<Output = Result<Vec<String>>>,
{
    // ---
    if let Some(schema) = project_schema().await? {
        debug!(tenant = tenant_name, schema = %schema, "schema from project record");
        return Ok(schema);
    }

    if let Some(schema) = legacy_schema().await? {
        debug!(tenant = tenant_name, schema = %schema, "schema from legacy store");
        return Ok(schema);
    }

    let slug = slugify(tenant_name);
    let stem = format!("{prefix}_{slug}_");

    let existing = catalog_schemas(format!("{stem}%")).await?;
    let matched = existing
        .iter()
        .filter_map(|name| trailing_sequence(name, &stem).map(|n| (n, name)))
        .min_by_key(|(n, _)| *n);

    if let Some((_, name)) = matched {
        debug!(tenant = tenant_name, schema = %name, "schema from catalog pattern match");
        return Ok(name.clone());
    }

    let schema = format!("{prefix}_{slug}_1");
    debug!(tenant = tenant_name, schema = %schema, "derived default schema");
    Ok(schema)
}

/// Clone the table structure of `source_schema` into `target_schema`.
///
/// Creates the target schema if absent, then creates each base table of
/// the source `LIKE ... INCLUDING ALL` (indexes, defaults, constraints)
/// with no data copied, and grants read access to the public role. A
/// source schema with zero tables is a warning, not an error.
pub async fn clone_schema_structure(
    pool: &PgPool,
    source_schema: &str,
    target_schema: &str,
) -> Result<()> {
    // ---
    let source = quote_ident(source_schema)?;
    let target = quote_ident(target_schema)?;

    let mut tx = pool.begin().await.map_err(schema_err)?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {target}"))
        .execute(&mut *tx)
        .await
        .map_err(schema_err)?;

    let tables: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT table_name FROM information_schema.tables
        WHERE table_schema = $1 AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#,
    )
    .bind(source_schema)
    .fetch_all(&mut *tx)
    .await
    .map_err(schema_err)?;

    if tables.is_empty() {
        warn!(
            source = source_schema,
            target = target_schema,
            "template schema has no tables, nothing to clone"
        );
        tx.commit().await.map_err(schema_err)?;
        return Ok(());
    }

    for table in &tables {
        sqlx::query(&clone_table_sql(source_schema, target_schema, table)?)
            .execute(&mut *tx)
            .await
            .map_err(schema_err)?;

        sqlx::query(&format!(
            "GRANT SELECT ON {target}.{} TO PUBLIC",
            quote_ident(table)?
        ))
        .execute(&mut *tx)
        .await
        .map_err(schema_err)?;
    }

    tx.commit().await.map_err(schema_err)?;

    info!(
        source = source_schema,
        target = target_schema,
        tables = tables.len(),
        "cloned schema structure"
    );
    Ok(())
}

/// DDL for cloning one table's structure (idempotent, no data).
fn clone_table_sql(source_schema: &str, target_schema: &str, table: &str) -> Result<String> {
    // ---
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (LIKE {}.{} INCLUDING ALL)",
        quote_ident(target_schema)?,
        quote_ident(table)?,
        quote_ident(source_schema)?,
        quote_ident(table)?,
    ))
}

async fn list_schemas_like(pool: &PgPool, pattern: &str) -> Result<Vec<String>> {
    // ---
    sqlx::query_scalar(
        "SELECT schema_name FROM information_schema.schemata WHERE schema_name LIKE $1",
    )
    .bind(pattern)
    .fetch_all(pool)
    .await
    .map_err(schema_err)
}

/// Map any DDL/catalog failure into the fatal `Schema` error class.
fn schema_err(e: sqlx::Error) -> ProvisionError {
    ProvisionError::Schema(e.to_string())
}

// ---

/// Derive a schema slug from a human tenant name: lowercase, runs of
/// non-alphanumerics collapse to single underscores.
pub fn slugify(name: &str) -> String {
    // ---
    let mut slug = String::with_capacity(name.len());
    let mut last_was_sep = true;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }

    slug.trim_end_matches('_').to_string()
}

/// Quote an identifier for use in DDL, rejecting anything that is not
/// strictly `[a-z0-9_]`. Identifiers cannot be bound as parameters, so
/// this is the single chokepoint keeping user input out of SQL text.
pub fn quote_ident(ident: &str) -> Result<String> {
    // ---
    if ident.is_empty()
        || !ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ProvisionError::Schema(format!(
            "invalid identifier: {ident:?}"
        )));
    }
    Ok(format!("\"{ident}\""))
}

/// Parse the numeric suffix of `<stem><n>`, ignoring non-numeric tails.
fn trailing_sequence(schema_name: &str, stem: &str) -> Option<i32> {
    schema_name.strip_prefix(stem)?.parse().ok()
}
