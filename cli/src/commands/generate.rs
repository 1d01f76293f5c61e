//! One-shot generation command

use anyhow::{Context, Result};
use chrono::Local;
use faceforge_daemon::GenerationInputs;
use std::path::{Path, PathBuf};

pub async fn execute(
    config_path: Option<&Path>,
    person_image: &str,
    prompt: &str,
    output: &str,
    cpu: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if cpu {
        println!("Using CPU (this will be slow)");
        config.inference.use_gpu = false;
    }

    println!("Portrait Generation");
    println!("===================");
    println!("Person image: {}", person_image);
    println!("Prompt: {}", prompt);
    println!();

    let state = faceforge_daemon::load_models(&config).await?;
    let params = state.generator.params();
    println!(
        "Size: {}x{}, steps: {}, guidance: {}, seed: {}",
        params.width, params.height, params.steps, params.guidance_scale, params.seed
    );

    println!("\nGenerating image...");
    let start = std::time::Instant::now();
    let image = state
        .generator
        .generate(&GenerationInputs {
            person_image: person_image.to_string(),
            clothing_images: Vec::new(),
            place_image: None,
            prompt: prompt.to_string(),
        })
        .await?;
    println!(
        "Generation completed in {:.2}s",
        start.elapsed().as_secs_f64()
    );

    let output_path = resolve_output_path(output)?;
    println!("\nSaving to: {}", output_path.display());
    image
        .save(&output_path)
        .with_context(|| format!("Failed to save {:?}", output_path))?;

    println!("\nDone!");
    Ok(())
}

/// Resolve output path, defaulting to ~/Documents/faceforge/
fn resolve_output_path(output: &str) -> Result<PathBuf> {
    let path = PathBuf::from(output);

    if path.is_absolute() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return Ok(path);
    }

    let output_dir = dirs::document_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("faceforge");
    std::fs::create_dir_all(&output_dir)?;

    // The default name gets a timestamp so runs never overwrite each other
    if output == "output.jpg" {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        Ok(output_dir.join(format!("portrait_{}.jpg", timestamp)))
    } else {
        Ok(output_dir.join(output))
    }
}
