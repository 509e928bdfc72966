//! Data model for tenants, things, credentials and the provisioning wire
//! payload.
//!
//! Password-typed fields on these structs always hold the *encrypted*
//! form produced by [`crate::vault::Vault::encrypt`]; the only exception
//! is `BrokerCredentials::password_hash`, a one-way hash consumed by the
//! broker's own auth backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Wire format version of the provisioning payload.
pub const PAYLOAD_VERSION: u32 = 7;

// ---

/// A tenant: a logical workspace owning one database schema.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    // ---
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub database_schema: String,
    pub created_at: DateTime<Utc>,
}

/// How a thing ingests data: streaming sensor or batch dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestType {
    Mqtt,
    Sftp,
}

impl IngestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestType::Mqtt => "mqtt",
            IngestType::Sftp => "sftp",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "mqtt" => Some(IngestType::Mqtt),
            "sftp" => Some(IngestType::Sftp),
            _ => None,
        }
    }
}

/// A sensor or dataset as recorded in the metadata store.
///
/// The physical row inside the tenant schema is created by the external
/// worker, never by this crate; this record is the orchestrator's view.
#[derive(Debug, Clone)]
pub struct Thing {
    // ---
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub project_id: i64,
    pub ingest_type: IngestType,
    pub properties: serde_json::Value,
    pub mqtt_auth_id: Option<i64>,
    pub raw_data_storage_id: Option<i64>,
    pub parser_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Per-tenant database credentials, shared by all things in one schema.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DatabaseCredentials {
    // ---
    pub schema: String,
    pub username: String,
    pub password: String,
    pub ro_username: String,
    pub ro_password: String,
    pub url: String,
    pub ro_url: String,
}

/// Per-thing message-broker credentials.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerCredentials {
    // ---
    pub username: String,
    pub password: String,
    pub password_hash: String,
    pub topic: String,
}

/// Per-thing object-storage bucket credentials.
#[derive(Debug, Clone, Serialize)]
pub struct BucketCredentials {
    // ---
    pub bucket_name: String,
    pub username: String,
    pub password: String,
    pub filename_pattern: String,
}

/// A named, reusable file-parser configuration for dataset ingestion.
///
/// Stored with an explicit indexed `project_id` reference; listing a
/// tenant's parsers is an indexed lookup, not a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    // ---
    pub name: String,
    pub delimiter: String,
    pub header_skip: u32,
    pub footer_skip: u32,
    pub timestamp_columns: Vec<TimestampColumn>,
}

/// One timestamp column definition within a parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampColumn {
    pub column: u32,
    pub format: String,
}

impl ParserConfig {
    /// Parser settings as embedded in the provisioning payload.
    pub fn settings(&self) -> serde_json::Value {
        // ---
        serde_json::json!({
            "delimiter": self.delimiter,
            "header": self.header_skip,
            "footer": self.footer_skip,
            "timestamp_columns": self.timestamp_columns,
        })
    }
}

/// A datastream placeholder registered ahead of data arrival, so the
/// metadata is queryable before the first observation lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    // ---
    pub name: String,
    pub unit: String,
    pub label: String,
}

// ---

/// Orchestrator state machine per provisioning request.
///
/// There is no rollback state: failures leave already-created rows in
/// place and a repeat call is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Requested,
    Published,
    Materialized,
    MetadataRegistered,
    PublishFailed,
    MaterializedTimeout,
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisioningState::Requested => "REQUESTED",
            ProvisioningState::Published => "PUBLISHED",
            ProvisioningState::Materialized => "MATERIALIZED",
            ProvisioningState::MetadataRegistered => "METADATA_REGISTERED",
            ProvisioningState::PublishFailed => "PUBLISH_FAILED",
            ProvisioningState::MaterializedTimeout => "MATERIALIZED_TIMEOUT",
        };
        f.write_str(s)
    }
}

// ---

/// Tenant reference embedded in the provisioning payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectRef {
    pub name: String,
    pub uuid: Uuid,
}

/// One parser entry of the payload `parsers` section.
#[derive(Debug, Clone, Serialize)]
pub struct ParserEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub settings: serde_json::Value,
}

/// The payload `parsers` section.
#[derive(Debug, Clone, Serialize)]
pub struct ParsersSection {
    pub default: u32,
    pub parsers: Vec<ParserEntry>,
}

/// Versioned provisioning message published to the provisioning topic.
///
/// The external worker fleet consumes this to materialize the physical
/// tenant-schema rows. Field set and version are a fixed wire contract.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningPayload {
    // ---
    pub version: u32,
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub ingest_type: IngestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_device_type: Option<String>,
    pub project: ProjectRef,
    pub database: DatabaseCredentials,
    #[serde(serialize_with = "empty_object_when_none")]
    pub mqtt: Option<BrokerCredentials>,
    pub raw_data_storage: BucketCredentials,
    pub parsers: ParsersSection,
    pub external_sftp: serde_json::Value,
    pub external_api: serde_json::Value,
}

/// Serialize `None` as `{}`; absent sections are empty objects on the
/// wire, never `null`.
fn empty_object_when_none<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    match value {
        Some(inner) => inner.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn sample_payload(ingest_type: IngestType) -> ProvisioningPayload {
        // ---
        let mqtt = match ingest_type {
            IngestType::Mqtt => Some(BrokerCredentials {
                username: "mqtt_ab12cd34ef".into(),
                password: "enc:pw".into(),
                password_hash: "PBKDF2$sha512$100000$c2FsdA==$aGFzaA==".into(),
                topic: "mqtt_ingest/mqtt_ab12cd34ef/data".into(),
            }),
            IngestType::Sftp => None,
        };

        ProvisioningPayload {
            version: PAYLOAD_VERSION,
            uuid: Uuid::nil(),
            name: "Gauge-1".into(),
            description: "river gauge".into(),
            ingest_type,
            mqtt_device_type: matches!(ingest_type, IngestType::Mqtt)
                .then(|| "campbell_cr1000".to_string()),
            project: ProjectRef {
                name: "Acme".into(),
                uuid: Uuid::nil(),
            },
            database: DatabaseCredentials {
                schema: "user_acme_1".into(),
                username: "user_acme_1".into(),
                password: "enc:db".into(),
                ro_username: "user_acme_1_ro".into(),
                ro_password: "enc:db_ro".into(),
                url: "postgresql://user_acme_1@db/tenants".into(),
                ro_url: "postgresql://user_acme_1_ro@db/tenants".into(),
            },
            mqtt,
            raw_data_storage: BucketCredentials {
                bucket_name: "acme-gauge-1".into(),
                username: "bucket_user".into(),
                password: "enc:bucket".into(),
                filename_pattern: "*.csv".into(),
            },
            parsers: ParsersSection {
                default: 0,
                parsers: vec![],
            },
            external_sftp: serde_json::json!({}),
            external_api: serde_json::json!({}),
        }
    }

    #[test]
    fn payload_has_fixed_field_set() {
        // ---
        let json = serde_json::to_value(sample_payload(IngestType::Mqtt)).unwrap();
        let obj = json.as_object().unwrap();

        for field in [
            "version",
            "uuid",
            "name",
            "description",
            "ingest_type",
            "mqtt_device_type",
            "project",
            "database",
            "mqtt",
            "raw_data_storage",
            "parsers",
            "external_sftp",
            "external_api",
        ] {
            assert!(obj.contains_key(field), "missing payload field {field}");
        }

        assert_eq!(json["version"], 7);
        assert_eq!(json["ingest_type"], "mqtt");
        assert_eq!(json["mqtt"]["topic"], "mqtt_ingest/mqtt_ab12cd34ef/data");
    }

    #[test]
    fn sftp_payload_has_empty_mqtt_section() {
        // ---
        let json = serde_json::to_value(sample_payload(IngestType::Sftp)).unwrap();

        assert_eq!(json["ingest_type"], "sftp");
        assert_eq!(json["mqtt"], serde_json::json!({}));
        assert!(json.as_object().unwrap().get("mqtt_device_type").is_none());
        assert_eq!(json["external_sftp"], serde_json::json!({}));
        assert_eq!(json["external_api"], serde_json::json!({}));
    }

    #[test]
    fn parser_entry_serializes_type_key() {
        let entry = ParserEntry {
            kind: "csvparser".into(),
            name: "default".into(),
            settings: serde_json::json!({"delimiter": ","}),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "csvparser");
    }

    #[test]
    fn ingest_type_round_trips_through_db_strings() {
        for it in [IngestType::Mqtt, IngestType::Sftp] {
            assert_eq!(IngestType::from_db(it.as_str()), Some(it));
        }
        assert_eq!(IngestType::from_db("ftp"), None);
    }

    #[test]
    fn state_display_matches_protocol_names() {
        assert_eq!(ProvisioningState::Requested.to_string(), "REQUESTED");
        assert_eq!(
            ProvisioningState::MaterializedTimeout.to_string(),
            "MATERIALIZED_TIMEOUT"
        );
    }
}
