//! Corpus source reading the DEPHY performance tables from PostgreSQL.
//!
//! Every selected column is cast to text and handed to the regular cleaning
//! step, which owns numeric coercion.

use std::env;

use log::{debug, info};
use tokio::runtime::Builder;
use tokio_postgres::NoTls;

use crate::corpus::CorpusSource;
use crate::error::{IftError, Result};
use crate::record::Record;
use crate::schema::{FeatureSchema, SEQUENCE_FIELD, TARGET_FIELD};

/// Environment variable holding a full connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Performance table used when crop features are enabled.
const SYNTHETISE_PERF_TABLE: &str = "synthetise_perf_magasin_can";
/// Performance table used by the context-only deployment.
const REALISE_PERF_TABLE: &str = "sdc_realise_perf_magasin_can";

/// Connection settings for the corpus database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login role.
    pub user: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5433,
            user: "postgres".into(),
            password: "postgres".into(),
            database: "dephy".into(),
        }
    }
}

impl ConnectionSettings {
    /// Reads `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD` and `DB_DATABASE`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let port = match env::var("DB_PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| IftError::InvalidConfig(format!("DB_PORT `{raw}` is not a port number")))?,
            Err(_) => defaults.port,
        };
        Ok(Self {
            host: env::var("DB_HOST").unwrap_or(defaults.host),
            port,
            user: env::var("DB_USER").unwrap_or(defaults.user),
            password: env::var("DB_PASSWORD").unwrap_or(defaults.password),
            database: env::var("DB_DATABASE").unwrap_or(defaults.database),
        })
    }

    /// Key/value connection string understood by `tokio-postgres`.
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

/// Corpus source running one query against PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    connection: String,
    query: String,
}

impl PostgresSource {
    /// Builds a source for `schema` over an explicit connection string.
    #[must_use]
    pub fn new(connection: impl Into<String>, schema: &FeatureSchema) -> Self {
        Self {
            connection: connection.into(),
            query: training_query(schema),
        }
    }

    /// Uses `DATABASE_URL` when set, otherwise the `DB_*` variables.
    pub fn from_env(schema: &FeatureSchema) -> Result<Self> {
        let connection = match env::var(DATABASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => url,
            _ => ConnectionSettings::from_env()?.connection_string(),
        };
        Ok(Self::new(connection, schema))
    }

    /// SQL text this source runs.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    async fn fetch_async(&self) -> Result<Vec<Record>> {
        let (client, connection) = tokio_postgres::connect(&self.connection, NoTls)
            .await
            .map_err(|err| IftError::Source(format!("failed to connect to Postgres: {err}")))?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::error!("postgres connection error: {err}");
            }
        });
        debug!("running corpus query:\n{}", self.query);
        let rows = client
            .query(self.query.as_str(), &[])
            .await
            .map_err(|err| IftError::Source(format!("corpus query failed: {err}")))?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Record::new();
            for (index, column) in row.columns().iter().enumerate() {
                let value: Option<String> = row
                    .try_get(index)
                    .map_err(|err| IftError::Source(format!("column `{}`: {err}", column.name())))?;
                record.insert(column.name(), value.map_or(serde_json::Value::Null, Into::into));
            }
            records.push(record);
        }
        drop(client);
        driver.abort();
        Ok(records)
    }
}

impl CorpusSource for PostgresSource {
    fn describe(&self) -> String {
        "PostgreSQL DEPHY performance tables".into()
    }

    fn fetch(&self) -> Result<Vec<Record>> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| IftError::io(err, None))?;
        let records = runtime.block_on(self.fetch_async())?;
        info!("fetched {} rows from PostgreSQL", records.len());
        Ok(records)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_expression(name: &str) -> String {
    match name {
        "nb_cultures_rotation" => "r.nb_cultures_rotation".into(),
        "departement" => "domain.departement".into(),
        "sdc_type_agriculture" => "sdc.type_agriculture".into(),
        "sdc_filiere" => "sdc.filiere".into(),
        other if other == SEQUENCE_FIELD => "r.sequence_cultures".into(),
        other => format!("spmc.{}", quote_ident(other)),
    }
}

/// Builds the training query selecting the target and every schema column as text.
#[must_use]
pub fn training_query(schema: &FeatureSchema) -> String {
    let mut names = vec![TARGET_FIELD];
    names.extend(schema.required_fields());

    if !schema.crop_features {
        let columns = names
            .iter()
            .map(|name| format!("    {}::text AS {}", quote_ident(name), quote_ident(name)))
            .collect::<Vec<_>>()
            .join(",\n");
        return format!(
            "SELECT\n{columns}\nFROM {REALISE_PERF_TABLE}\nWHERE {TARGET_FIELD} IS NOT NULL"
        );
    }

    let columns = names
        .iter()
        .map(|name| format!("    {}::text AS {}", column_expression(name), quote_ident(name)))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "WITH rotation_cte AS (
    SELECT
        sdc.id,
        COUNT(DISTINCT sac.culture_nom) AS nb_cultures_rotation,
        STRING_AGG(DISTINCT sac.culture_nom, ' > ') AS sequence_cultures
    FROM sdc
    JOIN succession_assolee_synthetise_magasin_can sac
        ON sdc.id = sac.sdc_id
    GROUP BY sdc.id
)
SELECT
{columns}
FROM rotation_cte r
JOIN {SYNTHETISE_PERF_TABLE} spmc
    ON r.id = spmc.sdc_id
JOIN sdc
    ON sdc.id = r.id
JOIN dispositif
    ON dispositif.id = sdc.dispositif_id
JOIN domain
    ON domain.id = dispositif.domaine_id
WHERE spmc.{TARGET_FIELD} IS NOT NULL"
    )
}
