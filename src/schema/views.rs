//! FROST compatibility view synthesis.
//!
//! Exposes tenant tables under the fixed uppercase column contract the
//! external SensorThings-compatible query layer expects. The column set
//! and the unit/location extraction precedence are a compatibility
//! contract: external consumers depend on the exact shape, so none of it
//! may drift. The SQL builders are pure functions of the schema name and
//! unit-tested against the contract without a database.

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};

use super::quote_ident;

/// The fixed set of compatibility views, in creation order.
pub const FROST_VIEW_NAMES: [&str; 5] = [
    "THINGS",
    "LOCATIONS",
    "THINGS_LOCATIONS",
    "DATASTREAMS",
    "OBSERVATIONS",
];

// ---

/// True when all five compatibility views exist in the schema.
pub async fn check_views_exist(pool: &PgPool, schema: &str) -> Result<bool> {
    // ---
    let names: Vec<String> = FROST_VIEW_NAMES.iter().map(|s| s.to_string()).collect();

    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.views
        WHERE table_schema = $1 AND table_name = ANY($2)
        "#,
    )
    .bind(schema)
    .bind(&names)
    .fetch_one(pool)
    .await
    .map_err(|e| ProvisionError::Schema(e.to_string()))?;

    Ok(count == FROST_VIEW_NAMES.len() as i64)
}

/// Ensure the compatibility views exist, (re)creating all of them when
/// any is missing. Cheap no-op in the common case.
pub async fn ensure_frost_views(pool: &PgPool, schema: &str) -> Result<()> {
    // ---
    if check_views_exist(pool, schema).await? {
        debug!(schema, "FROST views already present");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| ProvisionError::Schema(e.to_string()))?;

    for statement in frost_view_sql(schema)? {
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| ProvisionError::Schema(format!("view synthesis failed: {e}")))?;
    }

    tx.commit()
        .await
        .map_err(|e| ProvisionError::Schema(e.to_string()))?;

    info!(schema, "created FROST compatibility views");
    Ok(())
}

/// All five `CREATE OR REPLACE VIEW` statements for a tenant schema.
pub fn frost_view_sql(schema: &str) -> Result<Vec<String>> {
    // ---
    let s = quote_ident(schema)?;
    Ok(vec![
        things_view(&s),
        locations_view(&s),
        things_locations_view(&s),
        datastreams_view(&s),
        observations_view(&s),
    ])
}

fn things_view(s: &str) -> String {
    // ---
    format!(
        r#"
        CREATE OR REPLACE VIEW {s}."THINGS" AS
        SELECT
            t.id          AS "ID",
            t.name        AS "NAME",
            t.description AS "DESCRIPTION",
            t.properties  AS "PROPERTIES"
        FROM {s}.thing t
        "#
    )
}

/// Locations are synthesized per thing from the JSON `location` property.
/// Missing or non-object locations fall back to the fixed empty geometry.
fn locations_view(s: &str) -> String {
    // ---
    format!(
        r#"
        CREATE OR REPLACE VIEW {s}."LOCATIONS" AS
        SELECT
            t.id                       AS "ID",
            t.name || ' Location'      AS "NAME",
            'Location of ' || t.name   AS "DESCRIPTION",
            'application/geo+json'     AS "ENCODING_TYPE",
            COALESCE((t.properties -> 'location')::text, '') AS "LOCATION",
            CASE
                WHEN jsonb_typeof(t.properties -> 'location') = 'object'
                THEN ST_GeomFromGeoJSON((t.properties -> 'location')::text)
                ELSE ST_GeomFromText('POINT EMPTY', 4326)
            END AS "GEOM"
        FROM {s}.thing t
        "#
    )
}

fn things_locations_view(s: &str) -> String {
    // ---
    format!(
        r#"
        CREATE OR REPLACE VIEW {s}."THINGS_LOCATIONS" AS
        SELECT
            t.id AS "THING_ID",
            t.id AS "LOCATION_ID"
        FROM {s}.thing t
        "#
    )
}

/// `UNIT_OF_MEASUREMENT` precedence, strictly in this order:
/// 1. a composite `unit_of_measurement` object on the datastream,
/// 2. a scalar `unit` on the datastream (promoted to name + symbol),
/// 3. the `unit` of the thing's property list at the datastream position,
/// 4. the all-null composite literal.
fn datastreams_view(s: &str) -> String {
    // ---
    format!(
        r#"
        CREATE OR REPLACE VIEW {s}."DATASTREAMS" AS
        SELECT
            ds.id          AS "ID",
            ds.name        AS "NAME",
            ds.description AS "DESCRIPTION",
            ds.thing_id    AS "THING_ID",
            ds.id          AS "SENSOR_ID",
            ds.id          AS "OBSERVED_PROPERTY_ID",
            'http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement'
                           AS "OBSERVATION_TYPE",
            COALESCE(
                ds.properties -> 'unit_of_measurement',
                CASE
                    WHEN ds.properties ->> 'unit' IS NOT NULL
                    THEN jsonb_build_object(
                        'name', ds.properties ->> 'unit',
                        'symbol', ds.properties ->> 'unit',
                        'definition', NULL)
                END,
                CASE
                    WHEN t.properties -> 'properties' -> ds.position ->> 'unit' IS NOT NULL
                    THEN jsonb_build_object(
                        'name', t.properties -> 'properties' -> ds.position ->> 'unit',
                        'symbol', t.properties -> 'properties' -> ds.position ->> 'unit',
                        'definition', NULL)
                END,
                '{{"name": null, "symbol": null, "definition": null}}'::jsonb
            ) AS "UNIT_OF_MEASUREMENT",
            agg.min_phenomenon_time AS "PHENOMENON_TIME_START",
            agg.max_phenomenon_time AS "PHENOMENON_TIME_END",
            agg.min_result_time     AS "RESULT_TIME_START",
            agg.max_result_time     AS "RESULT_TIME_END"
        FROM {s}.datastream ds
        JOIN {s}.thing t ON t.id = ds.thing_id
        LEFT JOIN (
            SELECT
                o.datastream_id,
                MIN(o.phenomenon_time_start) AS min_phenomenon_time,
                MAX(o.phenomenon_time_end)   AS max_phenomenon_time,
                MIN(o.result_time)           AS min_result_time,
                MAX(o.result_time)           AS max_result_time
            FROM {s}.observation o
            GROUP BY o.datastream_id
        ) agg ON agg.datastream_id = ds.id
        "#
    )
}

fn observations_view(s: &str) -> String {
    // ---
    format!(
        r#"
        CREATE OR REPLACE VIEW {s}."OBSERVATIONS" AS
        SELECT
            o.id                    AS "ID",
            o.phenomenon_time_start AS "PHENOMENON_TIME_START",
            o.phenomenon_time_end   AS "PHENOMENON_TIME_END",
            o.result_time           AS "RESULT_TIME",
            o.result_type           AS "RESULT_TYPE",
            o.result_number         AS "RESULT_NUMBER",
            o.result_string         AS "RESULT_STRING",
            o.result_json           AS "RESULT_JSON",
            o.result_boolean        AS "RESULT_BOOLEAN",
            o.result_quality        AS "RESULT_QUALITY",
            o.valid_time_start      AS "VALID_TIME_START",
            o.valid_time_end        AS "VALID_TIME_END",
            o.parameters            AS "PARAMETERS",
            o.datastream_id         AS "DATASTREAM_ID",
            o.datastream_id         AS "FEATURE_ID"
        FROM {s}.observation o
        "#
    )
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn five_views_in_fixed_order() {
        let statements = frost_view_sql("user_acme_1").unwrap();
        assert_eq!(statements.len(), 5);
        for (statement, name) in statements.iter().zip(FROST_VIEW_NAMES) {
            assert!(
                statement.contains(&format!("\"user_acme_1\".\"{name}\"")),
                "statement for {name} targets the wrong view"
            );
            assert!(statement.contains("CREATE OR REPLACE VIEW"));
        }
    }

    #[test]
    fn datastreams_view_keeps_unit_precedence_order() {
        // ---
        let sql = &frost_view_sql("user_acme_1").unwrap()[3];

        let composite = sql.find("ds.properties -> 'unit_of_measurement'").unwrap();
        let scalar = sql.find("ds.properties ->> 'unit'").unwrap();
        let thing_fallback = sql
            .find("t.properties -> 'properties' -> ds.position ->> 'unit'")
            .unwrap();
        let literal = sql
            .find(r#"{"name": null, "symbol": null, "definition": null}"#)
            .unwrap();

        assert!(composite < scalar);
        assert!(scalar < thing_fallback);
        assert!(thing_fallback < literal);
    }

    #[test]
    fn locations_view_defaults_to_empty_geometry() {
        let sql = &frost_view_sql("user_acme_1").unwrap()[1];
        assert!(sql.contains("ST_GeomFromGeoJSON"));
        assert!(sql.contains("ST_GeomFromText('POINT EMPTY', 4326)"));
        assert!(sql.contains("'application/geo+json'"));
    }

    #[test]
    fn observations_view_exposes_full_column_contract() {
        // ---
        let sql = &frost_view_sql("user_acme_1").unwrap()[4];
        for column in [
            "\"ID\"",
            "\"PHENOMENON_TIME_START\"",
            "\"PHENOMENON_TIME_END\"",
            "\"RESULT_TIME\"",
            "\"RESULT_TYPE\"",
            "\"RESULT_NUMBER\"",
            "\"RESULT_STRING\"",
            "\"RESULT_JSON\"",
            "\"RESULT_BOOLEAN\"",
            "\"RESULT_QUALITY\"",
            "\"VALID_TIME_START\"",
            "\"VALID_TIME_END\"",
            "\"PARAMETERS\"",
            "\"DATASTREAM_ID\"",
            "\"FEATURE_ID\"",
        ] {
            assert!(sql.contains(column), "missing column {column}");
        }
    }

    #[test]
    fn invalid_schema_name_is_rejected() {
        assert!(frost_view_sql("user_acme_1; DROP TABLE thing").is_err());
    }
}
