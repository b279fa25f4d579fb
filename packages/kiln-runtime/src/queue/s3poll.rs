//! S3-compatible polling queue backing
//!
//! Covers SQS-style brokers where the worker long-polls for messages and
//! keeps them invisible while a handler runs. The concrete SDK sits behind
//! `PollBrokerLink`; the runtime owns subscription naming
//! (`<region>:<queue-name>`), the visibility-extension loop, and settle
//! semantics (delete on success, let visibility lapse on failure).

use super::{subscription_matches, QueueTask, TaskHandler, TaskQueue};
use crate::envelope;
use crate::error::{Result, WorkerError};
use crate::request::Resource;
use async_trait::async_trait;
use kiln_events::Report;
use regex::Regex;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long a received message stays invisible to other workers
const VISIBILITY: Duration = Duration::from_secs(30);
/// Long-poll wait on each receive
const LONG_POLL: Duration = Duration::from_secs(5);
/// Floor for the extender's halving backoff
const EXTEND_FLOOR: Duration = Duration::from_secs(1);

/// One received message awaiting settle
#[derive(Debug, Clone)]
pub struct PolledMessage {
    pub handle: String,
    pub body: Vec<u8>,
}

/// Contract the polling-broker SDK must satisfy
#[async_trait]
pub trait PollBrokerLink: Send + Sync {
    async fn list_queues(&self, region: &str) -> Result<Vec<String>>;

    /// Approximate ready-message depth, from queue attributes
    async fn approximate_depth(&self, region: &str, queue: &str) -> Result<u64>;

    /// One receive with a visibility timeout and long-poll wait;
    /// `None` when the queue is idle
    async fn receive(
        &self,
        region: &str,
        queue: &str,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<PolledMessage>>;

    async fn extend_visibility(
        &self,
        region: &str,
        queue: &str,
        handle: &str,
        visibility: Duration,
    ) -> Result<()>;

    async fn delete(&self, region: &str, queue: &str, handle: &str) -> Result<()>;

    async fn send(&self, region: &str, queue: &str, body: &[u8]) -> Result<()>;
}

pub struct PollQueue {
    link: Arc<dyn PollBrokerLink>,
    regions: Vec<String>,
    project: String,
    credentials: String,
    visibility: Duration,
    long_poll: Duration,
}

impl PollQueue {
    /// `home` locates the shared-credentials file pair the SDK reads
    pub fn new(
        link: Arc<dyn PollBrokerLink>,
        regions: Vec<String>,
        project: impl Into<String>,
        home: impl Into<PathBuf>,
    ) -> Self {
        let home = home.into();
        let credentials = format!(
            "{},{}",
            home.join(".aws/config").display(),
            home.join(".aws/credentials").display()
        );
        PollQueue {
            link,
            regions,
            project: project.into(),
            credentials,
            visibility: VISIBILITY,
            long_poll: LONG_POLL,
        }
    }

    /// Shrink the polling windows, for tests
    #[cfg(test)]
    fn with_timing(mut self, visibility: Duration, long_poll: Duration) -> Self {
        self.visibility = visibility;
        self.long_poll = long_poll;
        self
    }
}

fn split_subscription(subscription: &str) -> Result<(String, String)> {
    let (region, queue) = subscription.split_once(':').ok_or_else(|| {
        WorkerError::malformed("subscription is not region:queue").with("id", subscription)
    })?;
    Ok((region.to_string(), queue.to_string()))
}

#[async_trait]
impl TaskQueue for PollQueue {
    async fn refresh(
        &self,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        for region in &self.regions {
            for queue in self.link.list_queues(region).await? {
                // Filters see the queue name; the region prefix is ours
                if subscription_matches(&queue, matcher, mismatcher) {
                    found.insert(format!("{}:{}", region, queue), self.credentials.clone());
                }
            }
        }
        Ok(found)
    }

    async fn exists(&self, subscription: &str) -> Result<bool> {
        let (region, queue) = split_subscription(subscription)?;
        Ok(self.link.list_queues(&region).await?.contains(&queue))
    }

    async fn has_work(&self, subscription: &str) -> Result<bool> {
        let (region, queue) = split_subscription(subscription)?;
        Ok(self.link.approximate_depth(&region, &queue).await? > 0)
    }

    async fn work(
        &self,
        subscription: &str,
        handler: &TaskHandler,
    ) -> Result<(bool, Option<Resource>)> {
        let (region, queue) = split_subscription(subscription)?;

        let Some(message) = self
            .link
            .receive(&region, &queue, self.visibility, self.long_poll)
            .await?
        else {
            return Ok((false, None));
        };

        // Keep the message invisible for as long as the handler runs
        let (stop_tx, stop_rx) = watch::channel(false);
        let extender = tokio::spawn(extend_loop(
            self.link.clone(),
            region.clone(),
            queue.clone(),
            message.handle.clone(),
            self.visibility,
            stop_rx,
        ));

        let task = QueueTask {
            project: self.project.clone(),
            queue_type: "sqs",
            subscription: subscription.to_string(),
            short_queue_name: queue.clone(),
            credentials: self.credentials.clone(),
            msg: message.body,
            response_queue: Some(format!("{}_response", queue)),
        };

        let outcome = handler(task).await;
        let _ = stop_tx.send(true);
        let _ = extender.await;

        match outcome {
            Ok(resource) => {
                self.link.delete(&region, &queue, &message.handle).await?;
                Ok((true, resource))
            }
            // No delete: visibility lapses and the broker redelivers
            Err(e) => Err(e),
        }
    }

    fn responder(
        &self,
        subscription: &str,
        seal_key: Option<RsaPublicKey>,
    ) -> Result<mpsc::Sender<Report>> {
        let (region, queue) = split_subscription(subscription)?;
        let response_queue = format!("{}_response", queue);
        let link = self.link.clone();

        let (tx, mut rx) = mpsc::channel::<Report>(64);
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                let wire = match report.to_wire() {
                    Ok(wire) => wire,
                    Err(e) => {
                        log::error!("report encode failed: {}", e);
                        continue;
                    }
                };
                let body = match seal_key {
                    Some(ref key) => match envelope::hybrid_seal(wire.as_bytes(), key) {
                        Ok(sealed) => sealed.into_bytes(),
                        Err(e) => {
                            log::error!("report seal failed: {}", e);
                            continue;
                        }
                    },
                    None => wire.into_bytes(),
                };
                if let Err(e) = link.send(&region, &response_queue, &body).await {
                    log::warn!("response send to {} failed: {}", response_queue, e);
                }
            }
        });
        Ok(tx)
    }
}

/// Extend visibility at half-timeout intervals while the handler runs,
/// halving the wait (down to a floor) after each failed extension
async fn extend_loop(
    link: Arc<dyn PollBrokerLink>,
    region: String,
    queue: String,
    handle: String,
    visibility: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let base = visibility / 2;
    let mut wait = base;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.changed() => return,
        }

        match link
            .extend_visibility(&region, &queue, &handle, visibility)
            .await
        {
            Ok(()) => wait = base,
            Err(e) => {
                wait = (wait / 2).max(EXTEND_FLOOR.min(base));
                log::warn!(
                    "visibility extension failed for {}:{} (retrying in {:?}): {}",
                    region,
                    queue,
                    wait,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakePollBroker {
        queues: Vec<String>,
        messages: Mutex<VecDeque<PolledMessage>>,
        extended: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail_extends: bool,
    }

    #[async_trait]
    impl PollBrokerLink for FakePollBroker {
        async fn list_queues(&self, _region: &str) -> Result<Vec<String>> {
            Ok(self.queues.clone())
        }

        async fn approximate_depth(&self, _region: &str, _queue: &str) -> Result<u64> {
            Ok(self.messages.lock().len() as u64)
        }

        async fn receive(
            &self,
            _region: &str,
            _queue: &str,
            _visibility: Duration,
            _wait: Duration,
        ) -> Result<Option<PolledMessage>> {
            Ok(self.messages.lock().pop_front())
        }

        async fn extend_visibility(
            &self,
            _region: &str,
            _queue: &str,
            handle: &str,
            _visibility: Duration,
        ) -> Result<()> {
            if self.fail_extends {
                return Err(WorkerError::io("broker refused extension"));
            }
            self.extended.lock().push(handle.to_string());
            Ok(())
        }

        async fn delete(&self, _region: &str, _queue: &str, handle: &str) -> Result<()> {
            self.deleted.lock().push(handle.to_string());
            Ok(())
        }

        async fn send(&self, _region: &str, queue: &str, body: &[u8]) -> Result<()> {
            self.sent.lock().push((queue.to_string(), body.to_vec()));
            Ok(())
        }
    }

    fn seeded_broker() -> Arc<FakePollBroker> {
        let broker = Arc::new(FakePollBroker {
            queues: vec!["sqs_train".to_string(), "sqs_eval".to_string()],
            ..Default::default()
        });
        broker.messages.lock().push_back(PolledMessage {
            handle: "h-1".to_string(),
            body: b"payload".to_vec(),
        });
        broker
    }

    #[tokio::test]
    async fn test_refresh_builds_region_ids_with_credentials() {
        let broker = seeded_broker();
        let queue = PollQueue::new(broker, vec!["us-west-2".to_string()], "proj", "/home/kiln");

        let found = queue.refresh(None, None).await.unwrap();
        let mut ids: Vec<_> = found.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["us-west-2:sqs_eval", "us-west-2:sqs_train"]);
        let creds = &found["us-west-2:sqs_train"];
        assert!(creds.contains(".aws/config") && creds.contains(".aws/credentials"));

        assert!(queue.exists("us-west-2:sqs_train").await.unwrap());
        assert!(!queue.exists("us-west-2:sqs_gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_work_deletes_on_success() {
        let broker = seeded_broker();
        let queue = PollQueue::new(
            broker.clone(),
            vec!["us-west-2".to_string()],
            "proj",
            "/home/kiln",
        );

        let handler: TaskHandler = Arc::new(|task: QueueTask| {
            async move {
                assert_eq!(task.queue_type, "sqs");
                assert_eq!(task.response_queue.as_deref(), Some("sqs_train_response"));
                Ok(None)
            }
            .boxed()
        });

        let (processed, _) = queue.work("us-west-2:sqs_train", &handler).await.unwrap();
        assert!(processed);
        assert_eq!(*broker.deleted.lock(), vec!["h-1"]);
    }

    #[tokio::test]
    async fn test_work_leaves_message_on_failure() {
        let broker = seeded_broker();
        let queue = PollQueue::new(
            broker.clone(),
            vec!["us-west-2".to_string()],
            "proj",
            "/home/kiln",
        );

        let handler: TaskHandler =
            Arc::new(|_| async { Err(WorkerError::exhausted("no gpu fits")) }.boxed());
        let err = queue.work("us-west-2:sqs_train", &handler).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exhausted);
        assert!(broker.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_extender_runs_while_handler_blocks() {
        let broker = seeded_broker();
        let queue = PollQueue::new(
            broker.clone(),
            vec!["us-west-2".to_string()],
            "proj",
            "/home/kiln",
        )
        .with_timing(Duration::from_millis(100), Duration::from_millis(10));

        let handler: TaskHandler = Arc::new(|_| {
            async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(None)
            }
            .boxed()
        });

        queue.work("us-west-2:sqs_train", &handler).await.unwrap();
        assert!(
            !broker.extended.lock().is_empty(),
            "visibility was never extended during a slow handler"
        );
    }

    #[tokio::test]
    async fn test_idle_receive() {
        let broker = Arc::new(FakePollBroker {
            queues: vec!["sqs_train".to_string()],
            ..Default::default()
        });
        let queue = PollQueue::new(broker, vec!["us-west-2".to_string()], "proj", "/home/kiln");

        let handler: TaskHandler = Arc::new(|_| async { Ok(None) }.boxed());
        let (processed, resource) = queue.work("us-west-2:sqs_train", &handler).await.unwrap();
        assert!(!processed);
        assert!(resource.is_none());
        assert!(!queue.has_work("us-west-2:sqs_train").await.unwrap());
    }
}
