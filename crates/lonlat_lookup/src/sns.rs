use std::sync::Arc;

use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client;
use lonlat::{Notifier, NotifyError};
use tokio::runtime::Runtime;
use tracing::debug;

/// Publishes progress reports to an SNS topic.
pub struct SnsNotifier {
    rt: Arc<Runtime>,
    client: Client,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(rt: Arc<Runtime>, client: Client, topic_arn: impl Into<String>) -> Self {
        Self {
            rt,
            client,
            topic_arn: topic_arn.into(),
        }
    }
}

impl Notifier for SnsNotifier {
    fn publish(&mut self, subject: &str, message: &str) -> Result<(), NotifyError> {
        let request = self
            .client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(subject)
            .message(message)
            .send();

        let output = self
            .rt
            .block_on(request)
            .map_err(|e| NotifyError(DisplayErrorContext(&e).to_string()))?;

        debug!(
            topic = %self.topic_arn,
            message_id = output.message_id().unwrap_or_default(),
            "Published progress notification"
        );
        Ok(())
    }
}
