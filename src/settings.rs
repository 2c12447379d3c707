use crate::error::AppError;
use crate::limits::PlanAllowance;
use crate::models::ActionCounts;
use crate::remote::RetryPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERVICE_NAME: &str = "recipe-quota";
const ENV_PREFIX: &str = "RECIPE_QUOTA";

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("RECIPE_QUOTA_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "recipefy", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".recipe-quota"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrialSettings {
    pub days: i64,
    pub grants: ActionCounts,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            days: 14,
            grants: ActionCounts::new(10, 10, 10, 100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub user_id: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub consume_timeout_secs: u64,
    pub upsert_retries: u32,
    pub upsert_retry_delay_ms: u64,
    pub plan_allowances: Vec<PlanAllowance>,
    pub backend: BackendSettings,
    pub trial: TrialSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_id: "local".into(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            consume_timeout_secs: 15,
            upsert_retries: 3,
            upsert_retry_delay_ms: 250,
            plan_allowances: vec![],
            backend: BackendSettings::default(),
            trial: TrialSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.upsert_retries.max(1),
            delay: Duration::from_millis(self.upsert_retry_delay_ms),
        }
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_secs(self.consume_timeout_secs.max(1))
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("ledger.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> Result<(), AppError> {
    config.user_id = config.user_id.trim().to_string();
    if config.user_id.is_empty() {
        return Err(AppError::Config("user_id must not be empty.".into()));
    }

    if config.trial.days < 0 {
        return Err(AppError::Config("trial.days must not be negative.".into()));
    }

    config.backend.base_url = config
        .backend
        .base_url
        .take()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());
    if config.backend.kind == BackendKind::Http {
        let Some(base) = config.backend.base_url.as_deref() else {
            return Err(AppError::Config(
                "backend.base_url is required for the http backend.".into(),
            ));
        };
        url::Url::parse(base)?;
    }

    // Later rows win when a tier is listed twice.
    let mut deduped: Vec<PlanAllowance> = Vec::new();
    for row in config.plan_allowances.drain(..).rev() {
        if !deduped.iter().any(|r| r.tier == row.tier) {
            deduped.push(row);
        }
    }
    deduped.reverse();
    config.plan_allowances = deduped;

    Ok(())
}

fn load_from(path: &Path) -> Result<AppConfig, AppError> {
    let raw = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut parsed: AppConfig = raw.try_deserialize()?;
    normalize_config(&mut parsed)?;
    Ok(parsed)
}

/// File settings layered under `RECIPE_QUOTA__*` environment overrides.
pub fn load_config() -> Result<AppConfig, AppError> {
    load_from(&config_path()?)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn token_entry() -> Result<keyring::Entry, AppError> {
    Ok(keyring::Entry::new(SERVICE_NAME, "api-token")?)
}

pub fn set_api_token(token: &str) -> Result<(), AppError> {
    token_entry()?.set_password(token)?;
    Ok(())
}

pub fn get_api_token() -> Result<String, AppError> {
    if let Ok(value) = token_entry()?.get_password() {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    if let Ok(value) = std::env::var("RECIPE_QUOTA_API_TOKEN") {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(
        "No API token found. Run `recipe-quota set-token` or set RECIPE_QUOTA_API_TOKEN.".into(),
    ))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanTier;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = load_from(&tmp.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg.user_id, "local");
        assert_eq!(cfg.trial, TrialSettings::default());
        assert_eq!(cfg.backend.kind, BackendKind::Local);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
user_id = "  chef-42 "

[trial]
days = 7

[[plan_allowances]]
tier = "premium"
monthly = { import = 1, translation = 2, optimization = 3, ai_message = 4 }
"#,
        )
        .expect("write config");

        let cfg = load_from(&path).expect("load");
        assert_eq!(cfg.user_id, "chef-42");
        assert_eq!(cfg.trial.days, 7);
        assert_eq!(cfg.trial.grants, ActionCounts::new(10, 10, 10, 100));
        assert_eq!(cfg.plan_allowances.len(), 1);
        assert_eq!(cfg.plan_allowances[0].tier, PlanTier::Premium);
        assert_eq!(cfg.consume_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn http_backend_requires_base_url() {
        let mut cfg = AppConfig::default();
        cfg.backend.kind = BackendKind::Http;
        cfg.backend.base_url = Some("   ".into());
        let err = normalize_config(&mut cfg).expect_err("missing url");
        assert!(err.to_string().contains("backend.base_url"));
    }

    #[test]
    fn duplicate_allowance_rows_keep_the_last() {
        let mut cfg = AppConfig {
            plan_allowances: vec![
                PlanAllowance {
                    tier: PlanTier::Base,
                    monthly: ActionCounts::new(1, 1, 1, 1),
                },
                PlanAllowance {
                    tier: PlanTier::Premium,
                    monthly: ActionCounts::new(9, 9, 9, 9),
                },
                PlanAllowance {
                    tier: PlanTier::Base,
                    monthly: ActionCounts::new(2, 2, 2, 2),
                },
            ],
            ..AppConfig::default()
        };
        normalize_config(&mut cfg).expect("normalize");
        assert_eq!(cfg.plan_allowances.len(), 2);
        assert_eq!(cfg.plan_allowances[0].tier, PlanTier::Premium);
        assert_eq!(cfg.plan_allowances[1].monthly, ActionCounts::new(2, 2, 2, 2));
    }

    #[test]
    fn default_config_survives_a_toml_round_trip() {
        let raw = toml::to_string_pretty(&AppConfig::default()).expect("encode");
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, raw).expect("write");
        let cfg = load_from(&path).expect("load");
        assert_eq!(cfg.upsert_retries, 3);
        assert_eq!(cfg.retry_policy().delay, Duration::from_millis(250));
    }
}
