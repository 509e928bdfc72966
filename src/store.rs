//! Direct datastore access for the orchestrator.
//!
//! Two kinds of access live here: the [`MetadataStore`] repository over
//! the global metadata schema (projects, things, credentials, parsers,
//! the schema-thing mapping), and free functions that operate inside a
//! tenant schema (materialization probe, post-creation registration,
//! cascading delete). Tenant-schema functions take the tenant pool and a
//! schema name explicitly; metadata functions go through the store's own
//! pool. Each logical operation opens and releases its connection via the
//! pool; no connection state is shared across calls.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::models::{
    BrokerCredentials, BucketCredentials, DatabaseCredentials, IngestType, ParserConfig, Project,
    PropertySpec, Thing,
};
use crate::schema::quote_ident;

// ---

/// Create or update the metadata-store schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. The
/// `UNIQUE` constraint on `project.name` is what makes concurrent
/// first-time tenant creation safe (first writer wins, see
/// [`MetadataStore::insert_project_if_absent`]).
pub async fn create_metadata_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project (
            id              BIGSERIAL PRIMARY KEY,
            uuid            UUID        NOT NULL UNIQUE,
            name            TEXT        NOT NULL UNIQUE,
            database_schema TEXT        NOT NULL UNIQUE,
            created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Read-only view of tenants migrated from the previous system.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS legacy_projects (
            name            TEXT PRIMARY KEY,
            database_schema TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS database_credentials (
            id          BIGSERIAL PRIMARY KEY,
            schema      TEXT NOT NULL UNIQUE,
            username    TEXT NOT NULL,
            password    TEXT NOT NULL,
            ro_username TEXT NOT NULL,
            ro_password TEXT NOT NULL,
            url         TEXT NOT NULL,
            ro_url      TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mqtt_auth (
            id            BIGSERIAL PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            password      TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            topic         TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_data_storage (
            id               BIGSERIAL PRIMARY KEY,
            bucket_name      TEXT NOT NULL,
            username         TEXT NOT NULL,
            password         TEXT NOT NULL,
            filename_pattern TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parser (
            id         BIGSERIAL PRIMARY KEY,
            project_id BIGINT NOT NULL REFERENCES project (id),
            name       TEXT   NOT NULL,
            kind       TEXT   NOT NULL,
            settings   JSONB  NOT NULL,
            UNIQUE (project_id, name)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_parser_project_id
            ON parser (project_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thing (
            id                  BIGSERIAL PRIMARY KEY,
            uuid                UUID        NOT NULL UNIQUE,
            name                TEXT        NOT NULL,
            description         TEXT        NOT NULL DEFAULT '',
            project_id          BIGINT      NOT NULL REFERENCES project (id),
            ingest_type         TEXT        NOT NULL,
            properties          JSONB       NOT NULL DEFAULT '{}',
            mqtt_auth_id        BIGINT      REFERENCES mqtt_auth (id),
            raw_data_storage_id BIGINT      REFERENCES raw_data_storage (id),
            parser_id           BIGINT      REFERENCES parser (id),
            created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Authoritative pointer from a thing's identity to its physical schema.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_thing_mapping (
            thing_uuid UUID PRIMARY KEY,
            schema     TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// ---

/// Repository over the global metadata schema.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

/// Row shape for the `thing` table; `ingest_type` is validated on the
/// way out.
#[derive(sqlx::FromRow)]
struct ThingRow {
    id: i64,
    uuid: Uuid,
    name: String,
    description: String,
    project_id: i64,
    ingest_type: String,
    properties: serde_json::Value,
    mqtt_auth_id: Option<i64>,
    raw_data_storage_id: Option<i64>,
    parser_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl ThingRow {
    fn into_thing(self) -> Result<Thing> {
        // ---
        let ingest_type = IngestType::from_db(&self.ingest_type).ok_or_else(|| {
            ProvisionError::Schema(format!(
                "thing {} has unknown ingest_type {:?}",
                self.uuid, self.ingest_type
            ))
        })?;
        Ok(Thing {
            id: self.id,
            uuid: self.uuid,
            name: self.name,
            description: self.description,
            project_id: self.project_id,
            ingest_type,
            properties: self.properties,
            mqtt_auth_id: self.mqtt_auth_id,
            raw_data_storage_id: self.raw_data_storage_id,
            parser_id: self.parser_id,
            created_at: self.created_at,
        })
    }
}

/// Input for a new metadata thing record.
#[derive(Debug, Clone)]
pub struct NewThing {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub project_id: i64,
    pub ingest_type: IngestType,
    pub properties: serde_json::Value,
    pub mqtt_auth_id: Option<i64>,
    pub raw_data_storage_id: Option<i64>,
    pub parser_id: Option<i64>,
}

impl MetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- projects

    pub async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        // ---
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, uuid, name, database_schema, created_at FROM project WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    pub async fn find_project_by_uuid(&self, uuid: Uuid) -> Result<Option<Project>> {
        // ---
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, uuid, name, database_schema, created_at FROM project WHERE uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    pub async fn find_project_by_schema(&self, schema: &str) -> Result<Option<Project>> {
        // ---
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, uuid, name, database_schema, created_at FROM project \
             WHERE database_schema = $1",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await?;
        Ok(project)
    }

    /// Insert a project unless one with the same name already exists,
    /// then return the canonical row either way.
    ///
    /// `ON CONFLICT (name) DO NOTHING` plus re-select makes concurrent
    /// first-time creation of the same tenant name safe: the first
    /// writer wins and the loser adopts the winner's uuid and schema.
    pub async fn insert_project_if_absent(
        &self,
        name: &str,
        uuid: Uuid,
        database_schema: &str,
    ) -> Result<Project> {
        // ---
        sqlx::query(
            "INSERT INTO project (uuid, name, database_schema) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(uuid)
        .bind(name)
        .bind(database_schema)
        .execute(&self.pool)
        .await?;

        self.find_project_by_name(name)
            .await?
            .ok_or_else(|| ProvisionError::not_found("project", name))
    }

    /// Schema name from the legacy/secondary store, if migrated.
    pub async fn find_legacy_schema(&self, name: &str) -> Result<Option<String>> {
        // ---
        let schema =
            sqlx::query_scalar("SELECT database_schema FROM legacy_projects WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(schema)
    }

    // --- things

    /// Installation-wide uuid collision check.
    pub async fn thing_uuid_exists(&self, uuid: Uuid) -> Result<bool> {
        // ---
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM thing WHERE uuid = $1)")
            .bind(uuid)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    pub async fn insert_thing_record(&self, new: &NewThing) -> Result<i64> {
        // ---
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO thing (
                uuid, name, description, project_id, ingest_type,
                properties, mqtt_auth_id, raw_data_storage_id, parser_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(new.uuid)
        .bind(&new.name)
        .bind(&new.description)
        .bind(new.project_id)
        .bind(new.ingest_type.as_str())
        .bind(&new.properties)
        .bind(new.mqtt_auth_id)
        .bind(new.raw_data_storage_id)
        .bind(new.parser_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn find_thing_by_uuid(&self, uuid: Uuid) -> Result<Option<Thing>> {
        // ---
        let row = sqlx::query_as::<_, ThingRow>(
            r#"
            SELECT id, uuid, name, description, project_id, ingest_type,
                   properties, mqtt_auth_id, raw_data_storage_id, parser_id, created_at
            FROM thing WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ThingRow::into_thing).transpose()
    }

    // --- credentials

    /// Stored per-tenant database credentials, for reuse across things
    /// in the same schema. No new DB users are minted per sensor.
    pub async fn find_database_credentials(
        &self,
        schema: &str,
    ) -> Result<Option<DatabaseCredentials>> {
        // ---
        let creds = sqlx::query_as::<_, DatabaseCredentials>(
            r#"
            SELECT schema, username, password, ro_username, ro_password, url, ro_url
            FROM database_credentials WHERE schema = $1
            "#,
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await?;
        Ok(creds)
    }

    pub async fn store_database_credentials(&self, creds: &DatabaseCredentials) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO database_credentials (
                schema, username, password, ro_username, ro_password, url, ro_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (schema) DO NOTHING
            "#,
        )
        .bind(&creds.schema)
        .bind(&creds.username)
        .bind(&creds.password)
        .bind(&creds.ro_username)
        .bind(&creds.ro_password)
        .bind(&creds.url)
        .bind(&creds.ro_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_broker_credentials(&self, creds: &BrokerCredentials) -> Result<i64> {
        // ---
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO mqtt_auth (username, password, password_hash, topic)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&creds.username)
        .bind(&creds.password)
        .bind(&creds.password_hash)
        .bind(&creds.topic)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn insert_bucket_credentials(&self, creds: &BucketCredentials) -> Result<i64> {
        // ---
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO raw_data_storage (bucket_name, username, password, filename_pattern)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&creds.bucket_name)
        .bind(&creds.username)
        .bind(&creds.password)
        .bind(&creds.filename_pattern)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    // --- parsers

    pub async fn insert_parser(
        &self,
        project_id: i64,
        kind: &str,
        parser: &ParserConfig,
    ) -> Result<i64> {
        // ---
        let settings = serde_json::to_value(parser)
            .map_err(|e| ProvisionError::Schema(format!("parser settings: {e}")))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO parser (project_id, name, kind, settings)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id, name)
                DO UPDATE SET kind = EXCLUDED.kind, settings = EXCLUDED.settings
            RETURNING id
            "#,
        )
        .bind(project_id)
        .bind(&parser.name)
        .bind(kind)
        .bind(settings)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// All parsers of a tenant, an indexed lookup on `project_id`.
    pub async fn list_parsers_for_project(&self, project_id: i64) -> Result<Vec<ParserConfig>> {
        // ---
        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT settings FROM parser WHERE project_id = $1 ORDER BY name")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|settings| {
                serde_json::from_value(settings)
                    .map_err(|e| ProvisionError::Schema(format!("stored parser settings: {e}")))
            })
            .collect()
    }

    // --- schema-thing mapping

    pub async fn upsert_schema_mapping(&self, thing_uuid: Uuid, schema: &str) -> Result<()> {
        // ---
        sqlx::query(
            "INSERT INTO schema_thing_mapping (thing_uuid, schema) VALUES ($1, $2) \
             ON CONFLICT (thing_uuid) DO UPDATE SET schema = EXCLUDED.schema",
        )
        .bind(thing_uuid)
        .bind(schema)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Authoritative "which schema holds this thing's data" lookup.
    pub async fn find_schema_for_thing(&self, thing_uuid: Uuid) -> Result<Option<String>> {
        // ---
        let schema =
            sqlx::query_scalar("SELECT schema FROM schema_thing_mapping WHERE thing_uuid = $1")
                .bind(thing_uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(schema)
    }

    pub async fn delete_schema_mapping(&self, thing_uuid: Uuid) -> Result<()> {
        // ---
        sqlx::query("DELETE FROM schema_thing_mapping WHERE thing_uuid = $1")
            .bind(thing_uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reconcile mapping rows whose schema drifted from the owning
    /// project's `database_schema`. The project side wins; it is what
    /// credential reuse keys on. Returns the number of repaired rows.
    pub async fn repair_schema_mappings(&self) -> Result<u64> {
        // ---
        let repaired = sqlx::query(
            r#"
            UPDATE schema_thing_mapping m
            SET schema = p.database_schema
            FROM thing t
            JOIN project p ON p.id = t.project_id
            WHERE t.uuid = m.thing_uuid
              AND m.schema <> p.database_schema
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if repaired > 0 {
            warn!(repaired, "repaired drifted schema-thing mappings");
        }
        Ok(repaired)
    }

    // --- registration / deletion

    /// Attach the declared device properties to the metadata record so
    /// they are queryable before data arrives.
    pub async fn register_device_properties(
        &self,
        thing_id: i64,
        properties: &[PropertySpec],
    ) -> Result<()> {
        // ---
        let patch = serde_json::json!({ "properties": properties });
        sqlx::query("UPDATE thing SET properties = properties || $2 WHERE id = $1")
            .bind(thing_id)
            .bind(patch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write derived location fields back into the metadata record.
    pub async fn write_back_location(
        &self,
        thing_uuid: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> Result<()> {
        // ---
        sqlx::query("UPDATE thing SET properties = properties || $2 WHERE uuid = $1")
            .bind(thing_uuid)
            .bind(location_patch(latitude, longitude))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Metadata-store half of a thing deletion: one transaction deleting
    /// the broker credential, bucket and parser rows by id (looked up
    /// from the thing's own record) and finally the thing record.
    ///
    /// Runs strictly after the tenant-schema cascade; the tenant-schema
    /// delete is the one whose absence is externally visible.
    pub async fn delete_thing_metadata(&self, thing_uuid: Uuid) -> Result<()> {
        // ---
        let thing = self
            .find_thing_by_uuid(thing_uuid)
            .await?
            .ok_or_else(|| ProvisionError::not_found("thing", thing_uuid))?;

        let mut tx = self.pool.begin().await?;

        // Credential references must be cleared before their rows go.
        sqlx::query(
            "UPDATE thing SET mqtt_auth_id = NULL, raw_data_storage_id = NULL, \
             parser_id = NULL WHERE id = $1",
        )
        .bind(thing.id)
        .execute(&mut *tx)
        .await?;

        if let Some(id) = thing.mqtt_auth_id {
            sqlx::query("DELETE FROM mqtt_auth WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(id) = thing.raw_data_storage_id {
            sqlx::query("DELETE FROM raw_data_storage WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(id) = thing.parser_id {
            sqlx::query("DELETE FROM parser WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM thing WHERE id = $1")
            .bind(thing.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(%thing_uuid, "deleted thing metadata");
        Ok(())
    }
}

// --- tenant-schema operations

/// Physical id of a thing inside its tenant schema, if materialized.
///
/// The external worker creates the table and the row; before it has run,
/// the table itself may not exist yet; an undefined-table error is
/// therefore "not materialized", not a failure.
pub async fn physical_thing_id(pool: &PgPool, schema: &str, uuid: Uuid) -> Result<Option<i64>> {
    // ---
    let s = quote_ident(schema)?;
    let query = format!("SELECT id FROM {s}.thing WHERE uuid = $1");

    match sqlx::query_scalar::<_, i64>(&query)
        .bind(uuid)
        .fetch_optional(pool)
        .await
    {
        Ok(id) => Ok(id),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("42P01") => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Register datastream placeholders for every declared property so the
/// metadata is queryable before data physically arrives.
pub async fn register_datastreams(
    pool: &PgPool,
    schema: &str,
    thing_id: i64,
    properties: &[PropertySpec],
) -> Result<()> {
    // ---
    let s = quote_ident(schema)?;
    let query = format!(
        r#"
        INSERT INTO {s}.datastream (name, description, position, thing_id, properties)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT DO NOTHING
        "#
    );

    for (position, prop) in properties.iter().enumerate() {
        sqlx::query(&query)
            .bind(&prop.name)
            .bind(&prop.label)
            .bind(position as i32)
            .bind(thing_id)
            .bind(serde_json::json!({ "unit": prop.unit, "label": prop.label }))
            .execute(pool)
            .await?;
    }

    debug!(schema, thing_id, count = properties.len(), "registered datastream placeholders");
    Ok(())
}

/// Write derived latitude/longitude/GeoJSON location into the
/// materialized thing row's properties.
pub async fn write_back_location(
    pool: &PgPool,
    schema: &str,
    uuid: Uuid,
    latitude: f64,
    longitude: f64,
) -> Result<()> {
    // ---
    let s = quote_ident(schema)?;
    sqlx::query(&format!(
        "UPDATE {s}.thing SET properties = properties || $2 WHERE uuid = $1"
    ))
    .bind(uuid)
    .bind(location_patch(latitude, longitude))
    .execute(pool)
    .await?;
    Ok(())
}

/// GeoJSON-bearing property patch shared by both write-back targets.
fn location_patch(latitude: f64, longitude: f64) -> serde_json::Value {
    serde_json::json!({
        "latitude": latitude,
        "longitude": longitude,
        "location": {
            "type": "Point",
            "coordinates": [longitude, latitude],
        },
    })
}

/// Tenant-schema half of a thing deletion, in dependency order inside a
/// single transaction: observations (joined through datastreams), then
/// datastreams, then thing-location links, then journal rows (each of
/// those wrapped in a savepoint so a legitimately missing table rolls
/// back that step only), and finally the thing row itself, whose absence
/// is fatal.
pub async fn delete_thing_cascade(pool: &PgPool, schema: &str, uuid: Uuid) -> Result<()> {
    // ---
    let s = quote_ident(schema)?;
    let mut tx = pool.begin().await?;

    let thing_id: i64 = sqlx::query_scalar(&format!("SELECT id FROM {s}.thing WHERE uuid = $1"))
        .bind(uuid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ProvisionError::not_found("thing", uuid))?;

    run_soft_cascade(&mut tx, schema, uuid, thing_id, &soft_delete_steps(&s)).await?;

    sqlx::query(&format!("DELETE FROM {s}.thing WHERE id = $1"))
        .bind(thing_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(schema, %uuid, "deleted thing from tenant schema");
    Ok(())
}

/// Ordered soft-deletion steps for a thing, keyed by the quoted schema.
fn soft_delete_steps(s: &str) -> [(&'static str, String); 4] {
    // ---
    [
        (
            "observations",
            format!(
                "DELETE FROM {s}.observation o USING {s}.datastream d \
                 WHERE o.datastream_id = d.id AND d.thing_id = $1"
            ),
        ),
        (
            "datastreams",
            format!("DELETE FROM {s}.datastream WHERE thing_id = $1"),
        ),
        (
            "thing-location links",
            format!("DELETE FROM {s}.thing_location WHERE thing_id = $1"),
        ),
        (
            "journal rows",
            format!("DELETE FROM {s}.journal WHERE thing_id = $1"),
        ),
    ]
}

/// Statement execution seam for the soft cascade. `thing_id` is `None`
/// for savepoint control statements, which take no bind parameters.
trait CascadeExecutor {
    async fn execute(&mut self, sql: &str, thing_id: Option<i64>) -> sqlx::Result<u64>;
}

impl<'c> CascadeExecutor for sqlx::Transaction<'c, sqlx::Postgres> {
    async fn execute(&mut self, sql: &str, thing_id: Option<i64>) -> sqlx::Result<u64> {
        // ---
        match thing_id {
            Some(id) => sqlx::query(sql)
                .bind(id)
                .execute(&mut **self)
                .await
                .map(|done| done.rows_affected()),
            // Transaction-control statements bypass the prepared-statement
            // path.
            None => sqlx::raw_sql(sql)
                .execute(&mut **self)
                .await
                .map(|done| done.rows_affected()),
        }
    }
}

/// Run the soft half of the cascade: each step under its own savepoint,
/// so a failing step (a legitimately missing table) rolls back that step
/// only and the cascade keeps going.
async fn run_soft_cascade<E: CascadeExecutor>(
    exec: &mut E,
    schema: &str,
    uuid: Uuid,
    thing_id: i64,
    steps: &[(&str, String)],
) -> Result<()> {
    // ---
    for (label, query) in steps {
        exec.execute("SAVEPOINT soft_delete", None).await?;

        match exec.execute(query, Some(thing_id)).await {
            Ok(rows) => {
                exec.execute("RELEASE SAVEPOINT soft_delete", None).await?;
                debug!(schema, %uuid, step = label, rows, "cascade step");
            }
            Err(e) => {
                // Missing table or similar; step is optional, keep going.
                warn!(schema, %uuid, step = label, error = %e, "cascade step skipped");
                exec.execute("ROLLBACK TO SAVEPOINT soft_delete", None)
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn location_patch_is_geojson_point() {
        // ---
        let patch = location_patch(47.56, 7.59);
        assert_eq!(patch["latitude"], 47.56);
        assert_eq!(patch["longitude"], 7.59);
        assert_eq!(patch["location"]["type"], "Point");
        // GeoJSON order is [longitude, latitude].
        assert_eq!(
            patch["location"]["coordinates"],
            serde_json::json!([7.59, 47.56])
        );
    }

    struct ScriptedExecutor {
        log: Vec<String>,
        fail_on: &'static str,
    }

    impl CascadeExecutor for ScriptedExecutor {
        async fn execute(&mut self, sql: &str, _thing_id: Option<i64>) -> sqlx::Result<u64> {
            // ---
            self.log.push(sql.to_string());
            if !self.fail_on.is_empty() && sql.contains(self.fail_on) {
                Err(sqlx::Error::Protocol(format!(
                    "relation \"{}\" does not exist",
                    self.fail_on
                )))
            } else {
                Ok(1)
            }
        }
    }

    #[tokio::test]
    async fn soft_cascade_tolerates_a_missing_journal_table() {
        // ---
        let steps = soft_delete_steps("\"user_acme_1\"");
        let mut exec = ScriptedExecutor {
            log: Vec::new(),
            fail_on: "journal",
        };

        run_soft_cascade(&mut exec, "user_acme_1", Uuid::nil(), 7, &steps)
            .await
            .unwrap();

        // Only the journal step rolls back; the other three release.
        let rollbacks = exec
            .log
            .iter()
            .filter(|sql| sql.contains("ROLLBACK TO SAVEPOINT"))
            .count();
        let releases = exec
            .log
            .iter()
            .filter(|sql| sql.contains("RELEASE SAVEPOINT"))
            .count();
        assert_eq!(rollbacks, 1);
        assert_eq!(releases, 3);
    }

    #[tokio::test]
    async fn soft_cascade_continues_past_a_missing_table() {
        // ---
        let steps = soft_delete_steps("\"user_acme_1\"");
        let mut exec = ScriptedExecutor {
            log: Vec::new(),
            fail_on: "thing_location",
        };

        run_soft_cascade(&mut exec, "user_acme_1", Uuid::nil(), 7, &steps)
            .await
            .unwrap();

        // The journal step still runs after the failed step rolled back.
        let rollback = exec
            .log
            .iter()
            .position(|sql| sql.contains("ROLLBACK TO SAVEPOINT"))
            .unwrap();
        let journal = exec
            .log
            .iter()
            .position(|sql| sql.contains("journal"))
            .unwrap();
        assert!(journal > rollback);
    }

    #[tokio::test]
    async fn soft_cascade_runs_every_step_under_its_own_savepoint() {
        // ---
        let steps = soft_delete_steps("\"user_acme_1\"");
        let mut exec = ScriptedExecutor {
            log: Vec::new(),
            fail_on: "",
        };

        run_soft_cascade(&mut exec, "user_acme_1", Uuid::nil(), 7, &steps)
            .await
            .unwrap();

        let savepoints = exec
            .log
            .iter()
            .filter(|sql| sql.as_str() == "SAVEPOINT soft_delete")
            .count();
        let deletes = exec
            .log
            .iter()
            .filter(|sql| sql.starts_with("DELETE FROM"))
            .count();
        assert_eq!(savepoints, 4);
        assert_eq!(deletes, 4);
        assert!(!exec.log.iter().any(|sql| sql.contains("ROLLBACK")));
    }

    #[test]
    fn thing_row_rejects_unknown_ingest_type() {
        // ---
        let row = ThingRow {
            id: 1,
            uuid: Uuid::nil(),
            name: "Gauge-1".into(),
            description: String::new(),
            project_id: 1,
            ingest_type: "carrier-pigeon".into(),
            properties: serde_json::json!({}),
            mqtt_auth_id: None,
            raw_data_storage_id: None,
            parser_id: None,
            created_at: Utc::now(),
        };
        assert!(row.into_thing().is_err());
    }

    #[test]
    fn thing_row_converts_known_ingest_types() {
        let row = ThingRow {
            id: 1,
            uuid: Uuid::nil(),
            name: "Gauge-1".into(),
            description: String::new(),
            project_id: 1,
            ingest_type: "sftp".into(),
            properties: serde_json::json!({}),
            mqtt_auth_id: None,
            raw_data_storage_id: None,
            parser_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(row.into_thing().unwrap().ingest_type, IngestType::Sftp);
    }
}
