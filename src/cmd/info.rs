use anyhow::Result;

use livegrab::{Config, Pipeline, PipelineOptions};

pub async fn cmd_info(url: &str, config: &Config, force_cpu: bool) -> Result<()> {
    let options = PipelineOptions {
        prefer_hardware: !force_cpu,
        ..PipelineOptions::from_config(config)
    };
    let pipeline = Pipeline::from_config(config, options)?;

    let manifest = pipeline.resolve(url).await?;
    let best = manifest.best_index();

    println!("📺 {}", manifest.url());
    println!("   Renditions: {}", manifest.renditions().len());
    for (idx, rendition) in manifest.renditions().iter().enumerate() {
        let marker = if idx == best { "▶" } else { " " };
        println!("   {marker} {rendition}");
        println!("       {}", rendition.uri);
        if let Some(codecs) = &rendition.codecs {
            println!("       codecs: {codecs}");
        }
    }

    let backend = pipeline.select_backend().await;
    println!("   Decode backend: {backend}");

    Ok(())
}
