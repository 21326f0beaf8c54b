//! Driver configuration, loaded from YAML with environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const ENV_REMOTE_ROOT: &str = "CFDFLOW_REMOTE_ROOT";
pub const ENV_INVOKE_TIMEOUT_S: &str = "CFDFLOW_INVOKE_TIMEOUT_S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Directory of case type definitions.
    pub case_types_dir: PathBuf,
    /// Root directory served by the local backend.
    pub remote_root: PathBuf,
    /// Job name to shell command, for the local backend.
    pub apps: BTreeMap<String, String>,
    /// Abandon an operation stuck in `AGAVE_INVOKE` after this long. No
    /// watchdog when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoke_timeout_s: Option<f64>,
    pub poll_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            case_types_dir: PathBuf::from("case_types"),
            remote_root: PathBuf::from("remote"),
            apps: BTreeMap::new(),
            invoke_timeout_s: None,
            poll_interval_ms: 100,
        }
    }
}

impl DriverConfig {
    /// Load from a YAML file. Relative directories are taken relative to the
    /// file; environment overrides are applied last.
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&contents)?;
        if let Some(base) = path.parent() {
            config.resolve_relative(base);
        }
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> AppResult<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn resolve_relative(&mut self, base: &Path) {
        for dir in [&mut self.case_types_dir, &mut self.remote_root] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    pub fn apply_env_overrides(&mut self) -> AppResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<()> {
        if let Some(root) = lookup(ENV_REMOTE_ROOT).filter(|v| !v.is_empty()) {
            self.remote_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup(ENV_INVOKE_TIMEOUT_S) {
            let raw = raw.trim();
            self.invoke_timeout_s = if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
                None
            } else {
                Some(raw.parse::<f64>().map_err(|_| {
                    AppError::Config(format!("{ENV_INVOKE_TIMEOUT_S} is not a number: {raw}"))
                })?)
            };
        }
        self.validate()
    }

    fn validate(&self) -> AppResult<()> {
        if let Some(t) = self.invoke_timeout_s
            && let Err(e) = Duration::try_from_secs_f64(t)
        {
            return Err(AppError::Config(format!(
                "invoke_timeout_s must be a non-negative number of seconds, got {t}: {e}"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Out-of-range values that skipped validation saturate.
    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout_s
            .map(|t| Duration::try_from_secs_f64(t.max(0.0)).unwrap_or(Duration::MAX))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = DriverConfig::from_yaml_str("remote_root: /srv/cases\n").unwrap();
        assert_eq!(config.remote_root, PathBuf::from("/srv/cases"));
        assert_eq!(config.case_types_dir, PathBuf::from("case_types"));
        assert_eq!(config.invoke_timeout(), None);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn apps_and_timeout_parse() {
        let yaml = "apps:\n  mesh: ./mesh.sh\n  solve: ./solve.sh\ninvoke_timeout_s: 2.5\n";
        let config = DriverConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.apps.get("mesh").map(String::as_str), Some("./mesh.sh"));
        assert_eq!(config.invoke_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        assert!(matches!(
            DriverConfig::from_yaml_str("invoke_timeout_s: -1\n"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            DriverConfig::from_yaml_str("poll_interval_ms: 0\n"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        for raw in ["1e20", ".inf", ".nan"] {
            assert!(matches!(
                DriverConfig::from_yaml_str(&format!("invoke_timeout_s: {raw}\n")),
                Err(AppError::Config(_))
            ));
        }
        let mut config = DriverConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_INVOKE_TIMEOUT_S).then(|| "1e300".to_string()))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        config.invoke_timeout_s = Some(1e20);
        assert_eq!(config.invoke_timeout(), Some(Duration::MAX));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = DriverConfig::from_yaml_str("invoke_timeout_s: 30\n").unwrap();
        config
            .apply_overrides(|key| match key {
                ENV_REMOTE_ROOT => Some("/tmp/other".to_string()),
                ENV_INVOKE_TIMEOUT_S => Some("none".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.remote_root, PathBuf::from("/tmp/other"));
        assert_eq!(config.invoke_timeout_s, None);

        let err = config
            .apply_overrides(|key| (key == ENV_INVOKE_TIMEOUT_S).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_INVOKE_TIMEOUT_S));
    }

    #[test]
    fn relative_dirs_follow_config_file() {
        let mut config = DriverConfig::default();
        config.remote_root = PathBuf::from("/abs/root");
        config.resolve_relative(Path::new("/etc/cfdflow"));
        assert_eq!(config.case_types_dir, PathBuf::from("/etc/cfdflow/case_types"));
        assert_eq!(config.remote_root, PathBuf::from("/abs/root"));
    }

    #[test]
    fn yaml_round_trip_keeps_apps() {
        let mut config = DriverConfig::default();
        config.apps.insert("post".into(), "echo post".into());
        let text = config.to_yaml_string().unwrap();
        assert_eq!(DriverConfig::from_yaml_str(&text).unwrap(), config);
    }
}
