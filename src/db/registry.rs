//! Process-wide driver registry.
//!
//! Drivers are registered explicitly at startup, usually through
//! [`register_builtin_drivers`], and looked up by name or connection URL.

use crate::config::{DatabaseConfig, PoolOptions};
use crate::db::capability::{Capability, DriverConnection};
use crate::db::connection::ConnectionPromise;
use crate::db::dialect::{MySqlCapability, PostgresCapability, SqliteCapability};
use crate::db::pool::ConnectionPool;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::{debug, info, warn};

static REGISTRY: LazyLock<RwLock<HashMap<String, Driver>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// A named capability. Cheap to clone.
#[derive(Clone)]
pub struct Driver {
    name: Arc<str>,
    capability: Arc<dyn Capability>,
}

impl Driver {
    pub fn new(name: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        Self {
            name: Arc::from(name.into()),
            capability,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &Arc<dyn Capability> {
        &self.capability
    }

    /// Open a dedicated connection. Release and close both tear it down.
    pub fn connect(&self, connection_string: impl Into<String>) -> ConnectionPromise {
        let connection_string = connection_string.into();
        let capability = self.capability.clone();
        let resolution = async move { capability.connect(&connection_string).await };
        ConnectionPromise::new(
            self.clone(),
            resolution,
            close_action(self.capability.clone()),
            close_action(self.capability.clone()),
        )
    }

    /// Create a pool of connections to `connection_string`.
    pub fn pool(
        &self,
        connection_string: impl Into<String>,
        options: PoolOptions,
    ) -> DbResult<ConnectionPool> {
        ConnectionPool::new(self.clone(), connection_string, options)
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver").field("name", &self.name).finish()
    }
}

fn close_action(
    capability: Arc<dyn Capability>,
) -> impl FnOnce(Box<dyn DriverConnection>) + Send + 'static {
    move |conn| {
        tokio::spawn(async move {
            capability.close(conn).await;
        });
    }
}

/// Outcome of registering one builtin driver.
#[derive(Debug, Clone)]
pub struct DriverRegistration {
    pub name: &'static str,
    pub result: DbResult<()>,
}

impl DriverRegistration {
    /// True when the driver is available, including when it was registered
    /// by an earlier call.
    pub fn is_available(&self) -> bool {
        matches!(
            self.result,
            Ok(()) | Err(DbError::DriverAlreadyRegistered { .. })
        )
    }
}

/// Register `capability` under `name`. Names are unique.
pub fn register(name: impl Into<String>, capability: Arc<dyn Capability>) -> DbResult<()> {
    let name = name.into();
    let mut drivers = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if drivers.contains_key(&name) {
        return Err(DbError::driver_already_registered(name));
    }
    debug!(driver = %name, "Registering driver");
    drivers.insert(name.clone(), Driver::new(name, capability));
    Ok(())
}

pub fn get_driver(name: &str) -> Option<Driver> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

/// Names of every registered driver, sorted.
pub fn driver_names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Register the SQLite, PostgreSQL and MySQL drivers, reporting each result.
pub fn register_builtin_drivers() -> Vec<DriverRegistration> {
    DatabaseType::ALL
        .iter()
        .map(|db_type| {
            let name = db_type.driver_name();
            let capability: Arc<dyn Capability> = match db_type {
                DatabaseType::SQLite => Arc::new(SqliteCapability),
                DatabaseType::PostgreSQL => Arc::new(PostgresCapability),
                DatabaseType::MySQL => Arc::new(MySqlCapability),
            };
            let result = register(name, capability);
            match &result {
                Ok(()) => info!(driver = name, "Registered builtin driver"),
                Err(e) => warn!(driver = name, error = %e, "Builtin driver not registered"),
            }
            DriverRegistration { name, result }
        })
        .collect()
}

/// Find the registered driver for a connection URL's scheme.
pub fn driver_for_url(connection_string: &str) -> DbResult<Driver> {
    let db_type = DatabaseType::from_connection_string(connection_string).ok_or_else(|| {
        DbError::invalid_input(format!(
            "Unknown database type in connection string: {}",
            crate::models::connection::masked_connection_string(connection_string)
        ))
    })?;
    get_driver(db_type.driver_name())
        .ok_or_else(|| DbError::driver_not_found(db_type.driver_name()))
}

/// Open a dedicated connection for `[id=]url`. Pool options in the URL are
/// ignored.
pub fn connect(connection_string: &str) -> DbResult<ConnectionPromise> {
    let config = DatabaseConfig::parse(connection_string)?;
    let driver = driver_for_url(&config.connection_string)?;
    Ok(driver.connect(config.connection_string))
}

/// Create a pool for `[id=]url`, taking pool options from the URL.
pub fn pool(connection_string: &str) -> DbResult<ConnectionPool> {
    let config = DatabaseConfig::parse(connection_string)?;
    let driver = driver_for_url(&config.connection_string)?;
    driver.pool(config.connection_string, config.pool_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::ScriptedCapability;

    #[test]
    fn test_register_rejects_duplicates() {
        let cap: Arc<dyn Capability> = Arc::new(ScriptedCapability::new());
        register("registry-test-dup", cap.clone()).unwrap();
        let err = register("registry-test-dup", cap).unwrap_err();
        assert!(matches!(err, DbError::DriverAlreadyRegistered { .. }));
        assert!(get_driver("registry-test-dup").is_some());
        assert!(driver_names().contains(&"registry-test-dup".to_string()));
    }

    #[test]
    fn test_get_unknown_driver() {
        assert!(get_driver("registry-test-missing").is_none());
    }

    #[test]
    fn test_builtin_registration_reports_each_driver() {
        let first = register_builtin_drivers();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(DriverRegistration::is_available));

        // A second call reports duplicates instead of failing silently
        let second = register_builtin_drivers();
        assert!(second.iter().all(|r| r.result.is_err()));
        assert!(second.iter().all(DriverRegistration::is_available));
    }

    #[test]
    fn test_driver_for_url() {
        register_builtin_drivers();
        assert_eq!(driver_for_url("sqlite::memory:").unwrap().name(), "sqlite");
        assert_eq!(
            driver_for_url("postgresql://localhost/db").unwrap().name(),
            "postgres"
        );
        assert!(matches!(
            driver_for_url("oracle://localhost"),
            Err(DbError::InvalidInput { .. })
        ));
    }
}
