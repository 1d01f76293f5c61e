use anyhow::Result;
use faceforge_core::Config;
use std::path::Path;

pub async fn execute(config_path: Option<&Path>, key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = super::load_config(config_path)?;

    match (key, value) {
        // Show all config
        (None, None) => {
            let shown = match config_path {
                Some(path) => path.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("Configuration file: {:?}\n", shown);
            println!("[daemon]");
            println!("  host = \"{}\"", config.daemon.host);
            println!("  port = {}", config.daemon.port);
            println!(
                "  serialize_generation = {}",
                config.daemon.serialize_generation
            );
            println!();
            println!("[models]");
            println!("  storage_path = {:?}", config.models.storage_path);
            println!(
                "  hf_token = {}",
                config.models.hf_token.as_ref().map(|_| "***").unwrap_or("(not set)")
            );
            println!("  base_model = \"{}\"", config.models.base_model);
            println!("  controlnet_path = {:?}", config.models.controlnet_path);
            println!("  face_model = \"{}\"", config.models.face_model);
            println!("  face_model_root = {:?}", config.models.face_model_root);
            println!();
            println!("[inference]");
            println!("  use_gpu = {}", config.inference.use_gpu);
            println!("  use_f16 = {}", config.inference.use_f16);
            println!("  cpu_offload = {}", config.inference.cpu_offload);
            println!("  det_size = {}", config.inference.det_size);
            println!(
                "  fetch_timeout_secs = {}",
                config.inference.fetch_timeout_secs
            );
        }

        // Get a specific key
        (Some(key), None) => {
            let value = get_config_value(&config, key)?;
            println!("{}", value);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            set_config_value(&mut config, key, value)?;
            match config_path {
                Some(path) => config.save_to(path)?,
                None => config.save()?,
            }
            println!("Set {} = {}", key, value);
        }

        _ => unreachable!(),
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Result<String> {
    match key {
        "daemon.host" => Ok(config.daemon.host.clone()),
        "daemon.port" => Ok(config.daemon.port.to_string()),
        "daemon.serialize_generation" => Ok(config.daemon.serialize_generation.to_string()),
        "models.storage_path" => Ok(config.models.storage_path.display().to_string()),
        "models.hf_token" => Ok(config
            .models
            .hf_token
            .as_ref()
            .map(|_| "***".to_string())
            .unwrap_or_default()),
        "models.base_model" => Ok(config.models.base_model.clone()),
        "models.controlnet_path" => Ok(config.models.controlnet_path.display().to_string()),
        "models.face_model" => Ok(config.models.face_model.clone()),
        "models.face_model_root" => Ok(config.models.face_model_root.display().to_string()),
        "inference.use_gpu" => Ok(config.inference.use_gpu.to_string()),
        "inference.use_f16" => Ok(config.inference.use_f16.to_string()),
        "inference.cpu_offload" => Ok(config.inference.cpu_offload.to_string()),
        "inference.det_size" => Ok(config.inference.det_size.to_string()),
        "inference.fetch_timeout_secs" => Ok(config.inference.fetch_timeout_secs.to_string()),
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "daemon.host" => config.daemon.host = value.to_string(),
        "daemon.port" => config.daemon.port = value.parse()?,
        "daemon.serialize_generation" => config.daemon.serialize_generation = value.parse()?,
        "models.storage_path" => config.models.storage_path = value.into(),
        "models.hf_token" => {
            config.models.hf_token = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        "models.base_model" => config.models.base_model = value.to_string(),
        "models.controlnet_path" => config.models.controlnet_path = value.into(),
        "models.face_model" => config.models.face_model = value.to_string(),
        "models.face_model_root" => config.models.face_model_root = value.into(),
        "inference.use_gpu" => config.inference.use_gpu = value.parse()?,
        "inference.use_f16" => config.inference.use_f16 = value.parse()?,
        "inference.cpu_offload" => config.inference.cpu_offload = value.parse()?,
        "inference.det_size" => config.inference.det_size = value.parse()?,
        "inference.fetch_timeout_secs" => config.inference.fetch_timeout_secs = value.parse()?,
        _ => anyhow::bail!("Unknown config key: {}", key),
    }
    Ok(())
}
