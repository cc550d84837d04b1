//! Warehouse credential resolution.
//!
//! Secrets are resolved from the process environment first, then from a
//! mounted secret-file tree laid out as `<root>/<kind>/<NAME>`. Some
//! adapters (BigQuery, Fabric) deliberately skip the environment and read
//! files only. Secret values are held in memory for the lifetime of the
//! owning adapter, never persisted, and never logged.

use crate::errors::{Result, StatsError};
use std::path::PathBuf;

/// Resolves named secrets for one warehouse kind.
#[derive(Debug, Clone)]
pub struct SecretStore {
    root: PathBuf,
    kind: &'static str,
}

impl SecretStore {
    pub fn new(root: impl Into<PathBuf>, kind: &'static str) -> Self {
        Self { root: root.into(), kind }
    }

    /// Environment first, secret file second.
    pub fn env_or_file(&self, name: &str) -> Result<String> {
        if let Ok(value) = std::env::var(name)
            && !value.trim().is_empty()
        {
            return Ok(value.trim().to_string());
        }
        self.file_only(name)
    }

    /// Secret file only; the environment is never consulted.
    pub fn file_only(&self, name: &str) -> Result<String> {
        let path = self.root.join(self.kind).join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    Err(self.missing(name))
                } else {
                    Ok(trimmed.to_string())
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(self.missing(name)),
            Err(err) => Err(StatsError::SecretRead { path, source: err }),
        }
    }

    /// Env-or-file lookup that treats absence as `None` rather than an error.
    pub fn optional(&self, name: &str) -> Option<String> {
        match self.env_or_file(name) {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    fn missing(&self, name: &str) -> StatsError {
        StatsError::MissingSecret {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn store_with_file(name: &str, value: &str) -> (tempfile::TempDir, SecretStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("redshift")).unwrap();
        fs::write(dir.path().join("redshift").join(name), value).unwrap();
        let store = SecretStore::new(dir.path(), "redshift");
        (dir, store)
    }

    #[test]
    #[serial]
    fn env_takes_precedence_over_file() {
        let (_dir, store) = store_with_file("REDSHIFT_HOST", "from-file");
        unsafe { std::env::set_var("REDSHIFT_HOST", "from-env") };
        let value = store.env_or_file("REDSHIFT_HOST").unwrap();
        unsafe { std::env::remove_var("REDSHIFT_HOST") };
        assert_eq!(value, "from-env");
    }

    #[test]
    #[serial]
    fn falls_back_to_trimmed_file_contents() {
        let (_dir, store) = store_with_file("REDSHIFT_PASSWORD", "  hunter2\n");
        unsafe { std::env::remove_var("REDSHIFT_PASSWORD") };
        assert_eq!(store.env_or_file("REDSHIFT_PASSWORD").unwrap(), "hunter2");
    }

    #[test]
    #[serial]
    fn missing_secret_names_kind_and_secret_without_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path(), "redshift");
        unsafe { std::env::remove_var("REDSHIFT_NOPE") };
        let err = store.env_or_file("REDSHIFT_NOPE").unwrap_err();
        match err {
            StatsError::MissingSecret { kind, name } => {
                assert_eq!(kind, "redshift");
                assert_eq!(name, "REDSHIFT_NOPE");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn file_only_ignores_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::new(dir.path(), "redshift");
        unsafe { std::env::set_var("REDSHIFT_ONLYFILE", "env-value") };
        let result = store.file_only("REDSHIFT_ONLYFILE");
        unsafe { std::env::remove_var("REDSHIFT_ONLYFILE") };
        assert!(matches!(result, Err(StatsError::MissingSecret { .. })));
    }

    #[test]
    #[serial]
    fn empty_file_counts_as_missing() {
        let (_dir, store) = store_with_file("REDSHIFT_EMPTY", "  \n");
        assert!(matches!(
            store.file_only("REDSHIFT_EMPTY"),
            Err(StatsError::MissingSecret { .. })
        ));
    }
}
