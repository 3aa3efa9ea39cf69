//! Networking-related utility functions

use std::path::Path;
use std::time::Duration;

use reqwest::Client;

use crate::{log_error, log_info, Error, Result};

/// Creates a Reqwest Client using indicated timeout value
pub(crate) fn get_client(timeout: Duration) -> Result<Client> {
    match Client::builder()
        .timeout(timeout)
        .use_rustls_tls()
        .build()
    {
        Ok(client) => Ok(client),
        Err(e) => {
            log_error(&format!("Failed to create HTTP Client: {:?}", e));
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Downloads `url` to `dest`, following redirects. The whole transfer is bounded by `timeout`.
pub(crate) async fn download_to_file(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    let client = get_client(timeout)?;
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            log_error(&format!("Failed to get response from {url}: {:?}", e));
            return Err(Error::Network(e.to_string()));
        }
    };

    if !response.status().is_success() {
        log_error(&format!(
            "Request to {url} failed with {:?}",
            response.status()
        ));
        return Err(Error::Network(format!("{url} returned {}", response.status())));
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            log_error(&format!("Failed to read response from {url}: {:?}", e));
            return Err(Error::Network(e.to_string()));
        }
    };

    tokio::fs::write(dest, &bytes).await?;
    log_info(&format!(
        "Downloaded {} bytes from {url} to {}",
        bytes.len(),
        dest.display()
    ));
    Ok(())
}
