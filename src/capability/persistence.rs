use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::config::PostgresConfig;
use crate::error::{ConfigError, PersistenceError};

/// A change of the observed person count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountChangeEvent {
    pub current_count: i32,
    pub notes: String,
}

impl CountChangeEvent {
    pub fn between(previous: i32, current: i32) -> Self {
        let direction = if current > previous {
            "increase"
        } else {
            "decrease"
        };
        Self {
            current_count: current,
            notes: format!("Person count {direction}d from {previous} to {current}"),
        }
    }
}

/// An open connection that durably records events.
#[async_trait]
pub trait EventStore: Send {
    /// Inserts and commits one event.
    async fn append(&mut self, event: &CountChangeEvent) -> Result<(), PersistenceError>;
}

/// Opens event stores. Called once at setup and again after a failed write.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventStore>, PersistenceError>;

    fn describe(&self) -> String;
}

pub fn validate_table(table: &str) -> Result<(), ConfigError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid_start && valid_rest && !table.ends_with('.') {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "table",
            format!("'{table}' is not a plain SQL identifier"),
        ))
    }
}

pub struct PostgresConnector {
    config: PostgresConfig,
    table: String,
}

impl PostgresConnector {
    pub fn new(config: PostgresConfig, table: impl Into<String>) -> Result<Self, ConfigError> {
        let table = table.into();
        validate_table(&table)?;
        Ok(Self { config, table })
    }
}

#[async_trait]
impl StoreConnector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn EventStore>, PersistenceError> {
        let mut config = tokio_postgres::Config::new();
        config
            .user(&self.config.user)
            .password(&self.config.password)
            .host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.dbname)
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| PersistenceError::Connect(e.to_string()))?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Database connection error: {}", e);
            }
        });
        info!("Connected to {}", self.describe());

        Ok(Box::new(PostgresEventStore {
            client,
            insert: format!(
                "INSERT INTO {} (current_count, notes) VALUES ($1, $2)",
                self.table
            ),
            connection_task,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{} ({})",
            self.config.user, self.config.host, self.config.port, self.config.dbname, self.table
        )
    }
}

pub struct PostgresEventStore {
    client: Client,
    insert: String,
    connection_task: JoinHandle<()>,
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&mut self, event: &CountChangeEvent) -> Result<(), PersistenceError> {
        let transaction = self.client.transaction().await?;
        transaction
            .execute(self.insert.as_str(), &[&event.current_count, &event.notes])
            .await?;
        transaction.commit().await?;
        Ok(())
    }
}

impl Drop for PostgresEventStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_describe_the_direction() {
        assert_eq!(
            CountChangeEvent::between(0, 2),
            CountChangeEvent {
                current_count: 2,
                notes: "Person count increased from 0 to 2".to_string(),
            }
        );
        assert_eq!(
            CountChangeEvent::between(3, 1).notes,
            "Person count decreased from 3 to 1"
        );
    }

    #[test]
    fn table_names_are_plain_identifiers() {
        assert!(validate_table("person_count_events").is_ok());
        assert!(validate_table("analytics.person_count_events").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("1events").is_err());
        assert!(validate_table("events; DROP TABLE x").is_err());
        assert!(validate_table("events.").is_err());
    }

    #[tokio::test]
    async fn unreachable_database_fails_to_connect() {
        let config = PostgresConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_secs: 1,
            ..PostgresConfig::default()
        };
        let connector = PostgresConnector::new(config, "person_count_events").unwrap();
        assert!(matches!(
            connector.connect().await,
            Err(PersistenceError::Connect(_))
        ));
    }
}
