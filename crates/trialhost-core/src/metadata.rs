//! Metadata publishing.
//!
//! The booting instance learns its tunnel credential only from the metadata
//! document, so a publish counts as done once the document reads back
//! unchanged from the store.

use async_trait::async_trait;
use tracing::{debug, instrument};

use trialhost_common::{MetadataDocument, ProvisionError};

use crate::retry::RetryPolicy;

/// Storage for per-instance metadata documents, keyed by instance hostname.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Upload `document` under the name derived from `hostname`.
    async fn publish(
        &self,
        hostname: &str,
        document: &MetadataDocument,
    ) -> Result<(), ProvisionError>;

    /// Read the document back from the location instances fetch it from.
    async fn fetch(&self, hostname: &str) -> Result<Option<MetadataDocument>, ProvisionError>;

    /// Remove the document. A missing document is not an error.
    async fn unpublish(&self, hostname: &str) -> Result<(), ProvisionError>;

    /// URL the instance fetches its document from.
    fn document_url(&self, hostname: &str) -> String;
}

/// Publish `document` and wait until it is retrievable unchanged.
///
/// Both the upload and the read-back are retried under `retry`.
#[instrument(skip(store, document, retry), fields(vmid = %document.vmid))]
pub async fn publish_confirmed(
    store: &dyn MetadataStore,
    hostname: &str,
    document: &MetadataDocument,
    retry: &RetryPolicy,
) -> Result<(), ProvisionError> {
    retry
        .run("publish_metadata", move || async move {
            store.publish(hostname, document).await?;
            match store.fetch(hostname).await? {
                Some(stored) if &stored == document => Ok(()),
                Some(_) => Err(ProvisionError::metadata_publish_failed(format!(
                    "document at {} differs from the one uploaded",
                    store.document_url(hostname)
                ))),
                None => Err(ProvisionError::metadata_publish_failed(format!(
                    "document not retrievable at {}",
                    store.document_url(hostname)
                ))),
            }
        })
        .await?;

    debug!(url = %store.document_url(hostname), "Metadata confirmed");
    Ok(())
}
