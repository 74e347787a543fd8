use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_store::{object, Config, ImageStore, StoreFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "image-store starting");

    let files: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if files.is_empty() {
        anyhow::bail!("usage: image-store <file>...");
    }

    // A bad store entry aborts startup before anything is written.
    let config = Config::load()?;
    let store_count = config.stores.len();
    let factory = StoreFactory::new(config);
    let stores = factory.build_store_set()?;
    info!("Configured {} store(s)", store_count);

    let stores: Arc<dyn ImageStore> = Arc::new(stores);
    let generator = factory.new_identifier_generator(Arc::clone(&stores));

    for path in &files {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        let name = generator.next().await?;
        let object = factory.new_store_object(&name, &mime_type, object::ORIGINAL);
        let url = stores
            .save(&object, Bytes::from(data))
            .await
            .with_context(|| format!("Failed to store {}", path.display()))?;

        info!(name = %name, mime_type = %mime_type, "Stored {}", path.display());
        println!("{}\t{name}\t{url}", path.display());
    }

    generator.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
