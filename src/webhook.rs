//! Webhook worker: delivers queued webhook calls
//!
//! Calls are fire and forget. Each queued row is POSTed once and removed
//! whatever the response.

use crate::config::{Config, WEBHOOK_NAME};
use crate::daemon::{Control, Daemon, DaemonSpec};
use crate::error::{Error, Result};
use crate::store::{Store, WebhookQuery};
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// POST one queued call
pub async fn post(client: &reqwest::Client, query: &WebhookQuery) -> Result<()> {
    client
        .post(&query.url)
        .header(CONTENT_TYPE, "application/json")
        .body(query.body.clone())
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub struct WebhookWorker {
    config: Config,
    runtime: Option<Runtime>,
    client: Option<reqwest::Client>,
    store: Option<Store>,
}

impl WebhookWorker {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            runtime: None,
            client: None,
            store: None,
        }
    }

    pub fn spec(&self) -> DaemonSpec {
        DaemonSpec::new(WEBHOOK_NAME, &self.config.pid_dir).unique()
    }

    /// Send one batch of queued calls. Returns how many succeeded.
    pub fn flush(&mut self) -> Result<usize> {
        let (runtime, client, store) = match (&self.runtime, &self.client, &self.store) {
            (Some(runtime), Some(client), Some(store)) => (runtime, client, store),
            _ => return Err(Error::Daemon("webhook worker used before on_start".to_string())),
        };

        let mut delivered = 0;
        for query in store.webhook_queries(self.config.webhook_batch)? {
            match runtime.block_on(post(client, &query)) {
                Ok(()) => {
                    debug!(id = query.id, url = %query.url, "Webhook delivered");
                    delivered += 1;
                }
                Err(e) => warn!(id = query.id, url = %query.url, "Webhook call failed: {}", e),
            }
            store.delete_webhook_query(query.id)?;
        }
        Ok(delivered)
    }
}

impl Daemon for WebhookWorker {
    fn on_start(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(self.config.webhook_timeout())
            .build()?;

        self.runtime = Some(runtime);
        self.client = Some(client);
        self.store = Some(Store::open(&self.config.database)?);
        info!("Webhook worker started");
        Ok(())
    }

    fn run(&mut self, _control: &Control) -> Result<()> {
        let delivered = self.flush()?;
        if delivered > 0 {
            info!(delivered, "Webhooks delivered");
        }
        std::thread::sleep(self.config.webhook_interval());
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.store = None;
        self.client = None;
        self.runtime = None;
        info!("Webhook worker stopped");
        Ok(())
    }
}
