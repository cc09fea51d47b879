use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error};

use crate::events::Event;
use crate::github::{ClientPool, Forge};
use crate::handlers;

/// Fans decoded deliveries out to per-kind handlers. Each delivery runs on
/// its own task so the webhook receiver can acknowledge immediately.
pub struct Dispatcher {
    pool: Arc<ClientPool>,
    run_delay: Duration,
    max_retry_attempts: u32,
}

impl Dispatcher {
    pub fn new(pool: Arc<ClientPool>, run_delay: Duration, max_retry_attempts: u32) -> Self {
        Self {
            pool,
            run_delay,
            max_retry_attempts,
        }
    }

    /// Decode a delivery and schedule it. Decode errors are returned to the
    /// receiver; handler errors surface through the task's error log with
    /// the event type and delivery id attached.
    pub fn dispatch(&self, event_type: &str, delivery_id: &str, payload: &[u8]) -> Result<()> {
        let Some(event) = Event::decode(event_type, payload)? else {
            debug!(event_type, delivery_id, "ignoring unhandled event kind");
            return Ok(());
        };

        let pool = Arc::clone(&self.pool);
        let run_delay = self.run_delay;
        let max_retry_attempts = self.max_retry_attempts;
        let event_type = event_type.to_string();
        let delivery_id = delivery_id.to_string();

        tokio::spawn(async move {
            if let Err(err) = run_delivery(pool, event, run_delay, max_retry_attempts).await {
                error!(
                    event_type = %event_type,
                    delivery_id = %delivery_id,
                    "error processing webhook asynchronously: {err:#}"
                );
            }
        });
        Ok(())
    }
}

async fn run_delivery(
    pool: Arc<ClientPool>,
    event: Event,
    run_delay: Duration,
    max_retry_attempts: u32,
) -> Result<()> {
    let forge: Arc<dyn Forge> = pool.installation_client(event.installation_id()).await?;
    match event {
        Event::IssueComment(event) => {
            handlers::handle_issue_comment(forge, &event, run_delay, max_retry_attempts).await
        }
        Event::PullRequest(event) => {
            handlers::handle_pull_request(forge, &event, run_delay, max_retry_attempts).await
        }
        Event::WorkflowRun(event) => {
            handlers::handle_workflow_run(forge, &event, run_delay).await
        }
        Event::MergeGroup(event) => handlers::handle_merge_group(forge, &event).await,
    }
}
