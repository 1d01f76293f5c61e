use anyhow::Result;
use std::path::Path;

pub async fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    println!("Pulling model files for: {}", config.models.base_model);

    let files = faceforge_daemon::loader::fetch_pipeline_files(&config).await?;

    println!("\nModel files ready in {:?}", config.models_dir());
    println!("  UNet: {:?}", files.unet);
    println!("  VAE:  {:?}", files.vae);

    let controlnet = &config.models.controlnet_path;
    if !controlnet.exists() {
        println!("\nNote: ControlNet directory {:?} does not exist yet", controlnet);
    }
    let faces = config.face_model_dir();
    if !faces.exists() {
        println!("Note: face model pack {:?} does not exist yet", faces);
    }

    Ok(())
}
