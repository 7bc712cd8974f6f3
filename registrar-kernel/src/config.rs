use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub listen: String,
    pub cycle_interval_secs: u64,
    pub state_file: PathBuf,
    pub bootstrap_file: Option<PathBuf>,
    pub backend: BackendConf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConf {
    pub endpoint: String,
    pub api_version: String,
    pub timeout_secs: u64,
    pub keystone: Option<KeystoneConf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoneConf {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain_name: String,
    /// Project used to check API users, falls back to `project_name`.
    pub admin_project_name: Option<String>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".into(),
            cycle_interval_secs: 30,
            state_file: PathBuf::from("./data/registrar-state.json"),
            bootstrap_file: None,
            backend: BackendConf::default(),
        }
    }
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:6385/".into(),
            api_version: "1.22".into(),
            timeout_secs: 30,
            keystone: None,
        }
    }
}

impl RegistrarConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }

    /// The usual `OS_*` variables take precedence over the file. Keystone is
    /// only configured when `OS_AUTH_URL` is present.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let Some(auth_url) = lookup("OS_AUTH_URL").filter(|v| !v.is_empty()) else {
            return;
        };
        let get = |key: &str| lookup(key).unwrap_or_default();
        self.backend.keystone = Some(KeystoneConf {
            auth_url,
            username: get("OS_USERNAME"),
            password: get("OS_PASSWORD"),
            project_name: get("OS_PROJECT_NAME"),
            user_domain_name: get("OS_USER_DOMAIN_NAME"),
            admin_project_name: lookup("OS_ADMIN_PROJECT_NAME").filter(|v| !v.is_empty()),
        });
    }
}

pub async fn load_config() -> RegistrarConfig {
    let path = std::env::var("REGISTRAR_CONFIG").unwrap_or_else(|_| "registrar.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        RegistrarConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
            error!(%path, error = %e, "invalid configuration, using defaults");
            RegistrarConfig::default()
        })
    } else {
        warn!(%path, "no configuration file, using defaults");
        RegistrarConfig::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    cfg
}
