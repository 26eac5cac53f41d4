use std::time::Duration;

use thiserror::Error;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CoverError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("remote returned {0}")]
    Status(reqwest::StatusCode),
}

/// Resolves a cover-art URL to image bytes.
pub trait CoverFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, CoverError>;
}

pub struct HttpCoverFetcher {
    client: reqwest::blocking::Client,
}

impl HttpCoverFetcher {
    pub fn new() -> Result<Self, CoverError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

impl CoverFetcher for HttpCoverFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, CoverError> {
        let response = self.client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoverError::Status(status));
        }

        Ok(response.bytes()?.to_vec())
    }
}
