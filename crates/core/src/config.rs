use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Model settings
    #[serde(default)]
    pub models: ModelsConfig,

    /// Inference settings
    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Admit one generation at a time across all requests
    #[serde(default = "default_serialize_generation")]
    pub serialize_generation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Directory for files pulled from the hub (default: ~/.config/faceforge/models/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// HuggingFace token for gated repositories
    #[serde(default)]
    pub hf_token: Option<String>,

    /// Hub repository of the SDXL base pipeline
    #[serde(default = "default_base_model")]
    pub base_model: String,

    /// Local directory holding the ControlNet config and weights
    #[serde(default = "default_controlnet_path")]
    pub controlnet_path: PathBuf,

    /// InsightFace model pack name
    #[serde(default = "default_face_model")]
    pub face_model: String,

    /// Directory containing InsightFace model packs (default: ~/.insightface/models/)
    #[serde(default = "default_face_model_root")]
    pub face_model_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_true")]
    pub use_gpu: bool,

    /// Run the UNet and ControlNet in half precision on accelerators
    #[serde(default = "default_true")]
    pub use_f16: bool,

    /// Keep text encoders off the device between requests
    #[serde(default = "default_true")]
    pub cpu_offload: bool,

    /// Square input resolution of the face detector
    #[serde(default = "default_det_size")]
    pub det_size: u32,

    /// Timeout for downloading request images
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_serialize_generation() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/faceforge/models"))
}

fn default_base_model() -> String {
    "stabilityai/stable-diffusion-xl-base-1.0".to_string()
}

fn default_controlnet_path() -> PathBuf {
    PathBuf::from("/opt/ml/model/ControlNetModel")
}

fn default_face_model() -> String {
    "buffalo_l".to_string()
}

fn default_face_model_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".insightface")
        .join("models")
}

fn default_true() -> bool {
    true
}

fn default_det_size() -> u32 {
    640
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            serialize_generation: default_serialize_generation(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            hf_token: None,
            base_model: default_base_model(),
            controlnet_path: default_controlnet_path(),
            face_model: default_face_model(),
            face_model_root: default_face_model_root(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            use_gpu: true,
            use_f16: true,
            cpu_offload: true,
            det_size: default_det_size(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/faceforge/
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("faceforge"))
    }

    /// Load config from ~/.config/faceforge/config.toml
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save config to ~/.config/faceforge/config.toml
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Load config from an explicit path, falling back to defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config {:?}", path))?;
        Ok(())
    }

    /// Get the config file path: ~/.config/faceforge/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Get the models directory from config
    pub fn models_dir(&self) -> PathBuf {
        self.models.storage_path.clone()
    }

    /// Directory of the configured face model pack, e.g. ~/.insightface/models/buffalo_l
    pub fn face_model_dir(&self) -> PathBuf {
        self.models.face_model_root.join(&self.models.face_model)
    }

    /// Address the daemon binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.daemon.host, self.daemon.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.models.base_model, "stabilityai/stable-diffusion-xl-base-1.0");
        assert_eq!(
            config.models.controlnet_path,
            PathBuf::from("/opt/ml/model/ControlNetModel")
        );
        assert_eq!(config.models.face_model, "buffalo_l");
        assert_eq!(config.inference.det_size, 640);
        assert_eq!(config.inference.fetch_timeout_secs, 10);
        assert!(config.face_model_dir().ends_with(".insightface/models/buffalo_l"));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            port = 9090

            [inference]
            use_gpu = false
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.port, 9090);
        assert_eq!(config.daemon.host, "0.0.0.0");
        assert!(config.daemon.serialize_generation);
        assert!(!config.inference.use_gpu);
        assert!(config.inference.use_f16);
        assert_eq!(config.models.face_model, "buffalo_l");
    }

    #[test]
    fn default_location_is_under_config_dir() {
        let path = Config::config_path().unwrap();
        assert!(path.ends_with(".config/faceforge/config.toml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("faceforge-config-does-not-exist.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.daemon.port, 8080);
    }

    #[test]
    fn saved_file_loads_back() {
        let path = std::env::temp_dir()
            .join(format!("faceforge-config-{}", std::process::id()))
            .join("config.toml");

        let mut config = Config::default();
        config.daemon.serialize_generation = false;
        config.models.hf_token = Some("hf_test".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(!loaded.daemon.serialize_generation);
        assert_eq!(loaded.models.hf_token.as_deref(), Some("hf_test"));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
