//! Utility functions
//!
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<std::path::Path>,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    let mut file = File::create(filepath)?;
    let mut chunks = resp.bytes_stream().boxed();
    while let Some(chunk) = chunks.next().await {
        file.write_all(&chunk?)?;
    }

    Ok(())
}

/// Location of a downloaded model in the user's cache directory.
pub fn cached_model_path(url: &str) -> Result<PathBuf> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .with_context(|| format!("no file name in {url}"))?;
    let cache_dir = dirs::cache_dir().context("no cache directory")?;

    Ok(cache_dir.join("rockugv").join(file_name))
}

/// Download `url` to `target` unless it already exists.
pub async fn fetch_if_missing(url: &str, target: &Path) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    log::info!("Downloading {} to {}", url, target.display());
    // Interrupted downloads only leave the `.part` file behind
    let partial = target.with_extension("part");
    download_file(&Client::new(), url, &partial).await?;
    if std::fs::metadata(&partial)?.len() == 0 {
        std::fs::remove_file(&partial).ok();
        bail!("downloaded empty file from {url}");
    }
    std::fs::rename(&partial, target)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use axum::{routing::get, Router};

    use super::*;

    async fn serve(router: Router) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = axum::Server::from_tcp(listener)?.serve(router.into_make_service());
        tokio::spawn(server);
        Ok(addr)
    }

    #[test]
    fn test_cached_model_path() -> Result<()> {
        let path = cached_model_path("https://example.com/models/yolov8n.onnx")?;
        assert!(path.ends_with("rockugv/yolov8n.onnx"));
        assert!(cached_model_path("https://example.com/models/").is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_if_missing() -> Result<()> {
        let addr = serve(Router::new().route("/model.onnx", get(|| async { "weights" }))).await?;
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("nested").join("model.onnx");

        fetch_if_missing(&format!("http://{addr}/model.onnx"), &target).await?;
        assert_eq!(std::fs::read_to_string(&target)?, "weights");

        // Existing files are not downloaded again
        fetch_if_missing(&format!("http://{addr}/missing.onnx"), &target).await?;
        assert_eq!(std::fs::read_to_string(&target)?, "weights");

        Ok(())
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() -> Result<()> {
        let addr = serve(Router::new()).await?;
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("model.onnx");

        let result = fetch_if_missing(&format!("http://{addr}/model.onnx"), &target).await;
        assert!(result.is_err());
        assert!(!target.exists());

        Ok(())
    }
}
