use anyhow::{Context, Result};
use caw_database::Store;
use tracing::info;

use crate::config::Config;

/// Open the store at the configured location and bring the schema up to
/// date. The parent directory is created when missing.
pub async fn create_store(config: &Config) -> Result<Store> {
    let database_path = config.database_path();
    info!("Opening store at: {}", database_path);

    ensure_database_directory(&database_path)?;
    let store = Store::connect(&database_path)
        .await
        .context("Failed to open the workflow store")?;
    store
        .migrate()
        .await
        .context("Failed to run database migrations")?;

    info!("Store ready");
    Ok(store)
}

/// Ensure the database directory exists
pub fn ensure_database_directory(database_path: &str) -> Result<()> {
    let path = database_path.strip_prefix("sqlite://").unwrap_or(database_path);
    if path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating database directory: {}", parent.display());
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DatabaseConfig};
    use tempfile::TempDir;

    #[test]
    fn test_ensure_database_directory() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("workflows.db");
        let result = ensure_database_directory(&db_path.to_string_lossy());
        assert!(result.is_ok());
        assert!(db_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_create_store_with_custom_path() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("workflows.db");

        let mut config = Config::default();
        config.database = DatabaseConfig {
            url: Some(db_path.to_string_lossy().into_owned()),
        };

        let store = create_store(&config).await;
        assert!(store.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_create_store_in_memory() {
        let mut config = Config::default();
        config.database = DatabaseConfig {
            url: Some(":memory:".to_string()),
        };
        assert!(create_store(&config).await.is_ok());
    }
}
