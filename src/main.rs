use tracing::error;
use tracing_subscriber::EnvFilter;
use video_downloader::{Config, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("video_downloader=info,tower_http=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server::run(config).await {
        error!("server error: {err}");
        std::process::exit(1);
    }
}
