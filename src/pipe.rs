//! Downstream sinks.
//!
//! [`Store`] is the forwarding seam the connection handler writes observer
//! batches through; the production implementation publishes to the message
//! broker. [`HttpPipe`] is the separate REST surface used for device
//! settings delivery and task completion.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::observer::ObserverPacket;

/// Outcome of one forwarding call. `send` is deterministic per call: every
/// packet of the batch either went through or the batch failed as a whole.
#[derive(Debug, Clone, Default)]
pub struct StoreResult {
    pub errors: Vec<String>,
}

impl StoreResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { errors: vec![error.into()] }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub trait Store: Send + Sync + 'static {
    fn send(&self, packets: &[ObserverPacket]) -> impl Future<Output = StoreResult> + Send;
}

/// Forwards observer batches to the AMQP bus with worker-sharded routing.
#[derive(Clone)]
pub struct BrokerStore {
    broker: Arc<Broker>,
}

impl BrokerStore {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

impl Store for BrokerStore {
    async fn send(&self, packets: &[ObserverPacket]) -> StoreResult {
        match self.broker.publish_packets(packets).await {
            Ok(()) => StoreResult::success(),
            Err(e) => StoreResult::failure(e.to_string()),
        }
    }
}

/// Form-urlencoded REST client for the observer pipe endpoints.
#[derive(Debug, Clone)]
pub struct HttpPipe {
    client: reqwest::Client,
    set_url: String,
    finish_url: String,
}

impl HttpPipe {
    pub fn new(set_url: impl Into<String>, finish_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            set_url: set_url.into(),
            finish_url: finish_url.into(),
        }
    }

    async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<()> {
        let response = self.client.post(url).form(form).send().await?;
        if !response.status().is_success() {
            return Err(Error::DownstreamUnavailable(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Delivers translated device settings (`pipeSetUrl`).
    pub async fn send_settings(&self, task_id: &str, config: &serde_json::Value) -> Result<()> {
        debug!(task_id, "sending device settings to pipe");
        let form = [
            ("config", config.to_string()),
            ("id_action", task_id.to_string()),
        ];
        self.post_form(&self.set_url, &form).await
    }

    /// Closes a task (`pipeFinishUrl`), optionally attaching result data.
    pub async fn close_task(&self, task_id: &str, data: Option<serde_json::Value>) -> Result<()> {
        debug!(task_id, "closing task via pipe");
        let mut form = vec![("id_action", task_id.to_string())];
        if let Some(data) = data {
            let content = if data.is_string() {
                serde_json::json!([{ "message": data }])
            } else {
                data
            };
            form.push(("data", content.to_string()));
        }
        self.post_form(&self.finish_url, &form).await
    }
}
