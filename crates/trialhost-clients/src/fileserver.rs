//! Metadata documents on a plain HTTP file server.
//!
//! Documents are uploaded with `PUT {base}{upload_path}/metadata-<hostname>.json`
//! and served to instances from `{base}{public_path}/metadata-<hostname>.json`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use trialhost_common::types::metadata_file_name;
use trialhost_common::{MetadataConfig, MetadataDocument, ProvisionError};
use trialhost_core::MetadataStore;

use crate::error::ApiError;
use crate::http::{build_client, join_url, read_json, read_text};

/// [`MetadataStore`] backed by an HTTP file server.
#[derive(Debug, Clone)]
pub struct FileServerStore {
    client: Client,
    base_url: String,
    upload_path: String,
    public_path: String,
}

impl FileServerStore {
    pub fn new(config: &MetadataConfig) -> Result<Self, ApiError> {
        url::Url::parse(&config.base_url)
            .map_err(|e| ApiError::config(format!("invalid metadata.base_url: {e}")))?;

        Ok(Self {
            client: build_client(Duration::from_secs(config.request_timeout_secs), false)?,
            base_url: config.base_url.clone(),
            upload_path: config.upload_path.clone(),
            public_path: config.public_path.clone(),
        })
    }

    fn upload_url(&self, hostname: &str) -> String {
        join_url(
            &join_url(&self.base_url, &self.upload_path),
            &metadata_file_name(hostname),
        )
    }
}

#[async_trait]
impl MetadataStore for FileServerStore {
    #[instrument(skip(self, document))]
    async fn publish(
        &self,
        hostname: &str,
        document: &MetadataDocument,
    ) -> Result<(), ProvisionError> {
        let url = self.upload_url(hostname);
        let result: Result<(), ApiError> = async {
            let response = self
                .client
                .put(&url)
                .json(document)
                .send()
                .await
                .map_err(|e| ApiError::from_reqwest(&url, e))?;
            let (status, body) = read_text(&url, response).await?;
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(ApiError::status(&url, status, &body))
            }
        }
        .await;

        result.map_err(|e| ProvisionError::metadata_publish_failed(e.to_string()))?;
        debug!(url = %url, "Metadata uploaded");
        Ok(())
    }

    async fn fetch(&self, hostname: &str) -> Result<Option<MetadataDocument>, ProvisionError> {
        let url = self.document_url(hostname);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| {
                ProvisionError::metadata_publish_failed(ApiError::from_reqwest(&url, e).to_string())
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(&url, response)
            .await
            .map(Some)
            .map_err(|e| ProvisionError::metadata_publish_failed(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn unpublish(&self, hostname: &str) -> Result<(), ProvisionError> {
        let url = self.upload_url(hostname);
        let teardown = |e: ApiError| {
            ProvisionError::teardown_failed(format!("metadata {hostname}"), e.to_string())
        };

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| teardown(ApiError::from_reqwest(&url, e)))?;
        let (status, body) = read_text(&url, response).await.map_err(teardown)?;

        match status {
            200..=299 | 404 => Ok(()),
            _ => Err(teardown(ApiError::status(&url, status, &body))),
        }
    }

    fn document_url(&self, hostname: &str) -> String {
        join_url(
            &join_url(&self.base_url, &self.public_path),
            &metadata_file_name(hostname),
        )
    }
}
