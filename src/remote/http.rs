//! HTTP blob source

use super::{BlobSource, BlobStream};
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Streams media blobs with plain HTTP GET requests
#[derive(Debug, Clone)]
pub struct HttpBlobSource {
    client: reqwest::Client,
}

impl HttpBlobSource {
    pub fn new(config: &MediaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobSource for HttpBlobSource {
    async fn resolve_media_blob(&self, url: &str) -> Result<BlobStream> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Remote(format!("GET {} returned {}", url, status)));
        }

        tracing::debug!(
            url,
            content_length = response.content_length(),
            "Streaming media blob"
        );

        let url = url.to_string();
        let mut body = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut total: u64 = 0;
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        total += bytes.len() as u64;
                        yield Ok(bytes);
                    }
                    Err(e) => {
                        tracing::warn!(url = %url, received = total, error = %e, "Media blob body failed");
                        yield Err(Error::from(e));
                        return;
                    }
                }
            }
            tracing::debug!(url = %url, bytes = total, "Media blob body complete");
        };
        Ok(stream.boxed())
    }
}
