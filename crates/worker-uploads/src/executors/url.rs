//! URL executor: nothing is downloaded. The URL stays on the dataset
//! record so the platform can serve or follow it later; the transfer is
//! complete the moment it starts.

use async_trait::async_trait;
use datastage_core::PipelineError;
use datastage_core::model::{Dataset, SourceDescriptor};
use tracing::info;

use super::{ProgressSink, TransferExecutor, TransferOutcome};

pub struct UrlExecutor;

impl UrlExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UrlExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferExecutor for UrlExecutor {
    async fn execute(
        &self,
        dataset: &Dataset,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, PipelineError> {
        let SourceDescriptor::Url { url } = &dataset.source else {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "url executor invoked for {} source",
                dataset.source.source_type().as_str()
            )));
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(PipelineError::Validation(format!(
                "url source must be http(s), got {url:?}"
            )));
        }
        info!(dataset = %dataset.uuid, url = %url, "Recorded url source, no bytes transferred");
        progress.flush(0, 0).await?;
        Ok(TransferOutcome { bytes_transferred: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::NullProgress;
    use crate::test_support::dataset_with_source;

    #[tokio::test]
    async fn url_transfer_is_instantly_complete() {
        let dataset = dataset_with_source(
            SourceDescriptor::Url { url: "https://example.org/ds.nc".into() },
            "/data/upload/unused".into(),
        );
        let outcome = UrlExecutor::new().execute(&dataset, &NullProgress).await.unwrap();
        assert_eq!(outcome.bytes_transferred, 0);
        // Re-running leaves the stored url untouched and still downloads
        // nothing.
        let again = UrlExecutor::new().execute(&dataset, &NullProgress).await.unwrap();
        assert_eq!(again.bytes_transferred, 0);
        assert_eq!(
            dataset.source,
            SourceDescriptor::Url { url: "https://example.org/ds.nc".into() }
        );
    }

    #[tokio::test]
    async fn non_http_urls_are_rejected() {
        let dataset = dataset_with_source(
            SourceDescriptor::Url { url: "file:///etc/passwd".into() },
            "/data/upload/unused".into(),
        );
        let err = UrlExecutor::new().execute(&dataset, &NullProgress).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
