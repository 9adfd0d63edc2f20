//! Single and fan-out publishing over the current session
//!
//! Publishing never reconnects. A failed send is reported to the caller and
//! left for the health monitor to notice on its next tick.

use crate::context::ClientContext;
use crate::error::PublishError;
use crate::transport::{PublishFrame, Qos};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Stream multiplexing limit most brokers handle comfortably
pub const DEFAULT_MAX_FANOUT: usize = 4;

/// One unit of work for [`Publisher::parallel_publish`]
#[derive(Debug)]
pub struct PublishTask {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    /// Filled once the task has run
    pub result: Option<Result<(), PublishError>>,
}

impl PublishTask {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            result: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.result, Some(Ok(())))
    }

    fn frame(&self) -> PublishFrame {
        PublishFrame {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
        }
    }
}

/// Expand `{device_id}` in a topic template
pub fn render_topic(template: &str, device_id: &str) -> String {
    template.replace("{device_id}", device_id)
}

#[derive(Debug, Clone)]
pub struct Publisher {
    context: Arc<ClientContext>,
    max_fanout: usize,
}

impl Publisher {
    pub fn new(context: Arc<ClientContext>) -> Self {
        Self {
            context,
            max_fanout: DEFAULT_MAX_FANOUT,
        }
    }

    pub fn with_max_fanout(mut self, max_fanout: usize) -> Self {
        self.max_fanout = max_fanout.max(1);
        self
    }

    pub fn max_fanout(&self) -> usize {
        self.max_fanout
    }

    /// Send one frame; requires a Connected context
    pub async fn single_publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: Qos,
    ) -> Result<(), PublishError> {
        let frame = PublishFrame {
            topic: topic.to_string(),
            payload,
            qos,
        };
        send(&self.context, frame).await
    }

    /// Publish every task and return how many succeeded.
    ///
    /// At most `max_fanout` sends are in flight at once. Further tasks are
    /// queued and dispatched in the next batch once the current batch has
    /// fully completed. Failures are recorded per task and never cancel
    /// siblings.
    pub async fn parallel_publish(&self, tasks: &mut [PublishTask]) -> usize {
        for batch in tasks.chunks_mut(self.max_fanout) {
            let mut in_flight = JoinSet::new();
            for (index, task) in batch.iter().enumerate() {
                let context = Arc::clone(&self.context);
                let frame = task.frame();
                in_flight.spawn(async move { (index, send(&context, frame).await) });
            }

            while let Some(joined) = in_flight.join_next().await {
                match joined {
                    Ok((index, result)) => batch[index].result = Some(result),
                    Err(e) => error!(error = %e, "Publish task did not complete"),
                }
            }
        }

        let succeeded = tasks.iter().filter(|task| task.succeeded()).count();
        debug!(total = tasks.len(), succeeded, "Parallel publish finished");
        succeeded
    }
}

async fn send(context: &ClientContext, frame: PublishFrame) -> Result<(), PublishError> {
    let started = Instant::now();
    let (session, transport) = context
        .session()
        .map_err(|state| PublishError::NotConnected { state })?;

    match session.publish(&frame).await {
        Ok(()) => {
            let stats = context.stats();
            stats.update_latency_duration(started.elapsed());
            stats.record_publish(frame.payload.len());
            debug!(
                transport = %transport,
                topic = %frame.topic,
                bytes = frame.payload.len(),
                "Published"
            );
            Ok(())
        }
        Err(source) => {
            warn!(
                transport = %transport,
                topic = %frame.topic,
                error = %source,
                "Publish failed"
            );
            Err(PublishError::SendFailure { transport, source })
        }
    }
}
