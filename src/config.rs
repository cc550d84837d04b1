//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `FASTBI_CONFIG`
//! environment variable. Nested fields use `__` in environment overrides
//! (e.g. `FASTBI_CACHE__TTL=1h`). The active warehouse kind is the same
//! `FASTBI_PLATFORM_DWH` variable the rest of the platform uses.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "FASTBI_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the scheduler.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration, loaded from YAML and environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Active warehouse kind: bigquery, snowflake, redshift or fabric.
    ///
    /// Kept as a plain string and parsed per refresh run so a bad value
    /// degrades to a logged error instead of preventing startup.
    pub platform_dwh: String,

    /// Root of the mounted secret-file tree.
    pub secrets_root: PathBuf,

    /// Default tracing directive when RUST_LOG is unset.
    pub log_level: String,

    pub cache: CacheConfig,
    pub refresh: RefreshConfig,
    pub bigquery: BigQueryConfig,
    pub snowflake: SnowflakeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform_dwh: "bigquery".to_string(),
            secrets_root: PathBuf::from("/fastbi/secrets"),
            log_level: "info".to_string(),
            cache: CacheConfig::default(),
            refresh: RefreshConfig::default(),
            bigquery: BigQueryConfig::default(),
            snowflake: SnowflakeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Lifetime of the published stats snapshot.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7200),
        }
    }
}

/// When the daily refresh fires (UTC wall clock). A refresh also runs once
/// at process start regardless of this schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    pub hour: u32,
    pub minute: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { hour: 0, minute: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BigQueryConfig {
    /// BigQuery REST API base. Overridable for tests.
    pub api_base: String,

    /// OAuth token endpoint. Overridable for tests.
    pub token_uri: String,

    /// IAM Credentials API base, used when impersonating. Overridable for tests.
    pub iam_api_base: String,

    /// Service account to impersonate, if any. Mirrors the
    /// GCP_SA_IMPERSONATE_EMAIL variable used elsewhere in the platform.
    pub impersonate_service_account: Option<String>,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            api_base: "https://bigquery.googleapis.com".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            iam_api_base: "https://iamcredentials.googleapis.com".to_string(),
            impersonate_service_account: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnowflakeConfig {
    /// SQL API base URL template; `{account}` is substituted with the
    /// account identifier from the secret store. Overridable for tests.
    pub api_base: String,

    /// Per-statement timeout passed to the SQL API, in seconds.
    pub statement_timeout_secs: u64,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://{account}.snowflakecomputing.com".to_string(),
            statement_timeout_secs: 60,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("FASTBI_").split("__"))
            // The impersonation target is exported platform-wide as a bare
            // variable, outside the FASTBI_ prefix.
            .merge(
                Env::raw()
                    .only(&["GCP_SA_IMPERSONATE_EMAIL"])
                    .map(|_| "bigquery.impersonate_service_account".into())
                    .split("."),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml")).expect("defaults should load");
            assert_eq!(config.platform_dwh, "bigquery");
            assert_eq!(config.secrets_root, PathBuf::from("/fastbi/secrets"));
            assert_eq!(config.cache.ttl, Duration::from_secs(7200));
            assert_eq!(config.refresh.hour, 0);
            assert_eq!(config.refresh.minute, 0);
            assert_eq!(config.bigquery.impersonate_service_account, None);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
platform_dwh: snowflake
secrets_root: /var/run/secrets
cache:
  ttl: 1h
refresh:
  hour: 3
  minute: 30
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.platform_dwh, "snowflake");
            assert_eq!(config.secrets_root, PathBuf::from("/var/run/secrets"));
            assert_eq!(config.cache.ttl, Duration::from_secs(3600));
            assert_eq!(config.refresh.hour, 3);
            assert_eq!(config.refresh.minute, 30);
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "platform_dwh: bigquery\n")?;

            jail.set_env("FASTBI_PLATFORM_DWH", "redshift");
            jail.set_env("FASTBI_CACHE__TTL", "30m");

            let config = Config::load(&args("test.yaml"))?;
            assert_eq!(config.platform_dwh, "redshift");
            assert_eq!(config.cache.ttl, Duration::from_secs(1800));
            Ok(())
        });
    }

    #[test]
    fn test_impersonation_email_from_environment() {
        Jail::expect_with(|jail| {
            jail.set_env("GCP_SA_IMPERSONATE_EMAIL", "dbt-deploy@platform.iam.gserviceaccount.com");

            let config = Config::load(&args("missing.yaml"))?;
            assert_eq!(
                config.bigquery.impersonate_service_account.as_deref(),
                Some("dbt-deploy@platform.iam.gserviceaccount.com"),
            );
            Ok(())
        });
    }

    #[test]
    fn test_unknown_field_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "platform_dhw: typo\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }
}
