//! AMQP topic-exchange queue backing
//!
//! The concrete AMQP client stays outside the runtime: the daemon wires in
//! a `BrokerLink`, and everything here is subscription bookkeeping on top
//! of it. Subscriptions are `<uri-escaped-vhost>?<uri-escaped-queue>`,
//! discovered from bindings on the well-known topic exchange whose routing
//! keys carry the project prefix.

use super::{subscription_matches, uri_escape, uri_unescape, QueueTask, TaskHandler, TaskQueue};
use crate::envelope;
use crate::error::{Result, WorkerError};
use crate::request::Resource;
use async_trait::async_trait;
use kiln_events::Report;
use regex::Regex;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Exchange the worker watches for experiment traffic
pub const EXCHANGE: &str = "StudioML.topic";
/// Routing keys must begin with this prefix to be worker traffic
pub const ROUTING_PREFIX: &str = "StudioML.";

/// One binding on the topic exchange
#[derive(Debug, Clone)]
pub struct Binding {
    pub vhost: String,
    pub queue: String,
    pub routing_key: String,
}

/// One delivered message awaiting ack or nack
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Contract the AMQP client library must satisfy
///
/// `get` performs a single basic.get with auto-ack disabled; the caller
/// settles every delivery exactly once via `ack` or `nack`.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn list_bindings(&self, exchange: &str) -> Result<Vec<Binding>>;

    /// Approximate ready-message depth of a queue, from broker metadata
    async fn depth(&self, vhost: &str, queue: &str) -> Result<u64>;

    async fn get(&self, vhost: &str, queue: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, vhost: &str, tag: u64) -> Result<()>;

    /// Negative-ack with redelivery
    async fn nack(&self, vhost: &str, tag: u64) -> Result<()>;

    async fn publish(&self, vhost: &str, routing_key: &str, body: &[u8]) -> Result<()>;
}

pub struct AmqpQueue {
    link: Arc<dyn BrokerLink>,
    project: String,
}

/// Split a subscription id back into `(vhost, queue)`
fn split_subscription(subscription: &str) -> Result<(String, String)> {
    let (vhost, queue) = subscription.split_once('?').ok_or_else(|| {
        WorkerError::malformed("subscription is not vhost?queue").with("id", subscription)
    })?;
    Ok((uri_unescape(vhost), uri_unescape(queue)))
}

impl AmqpQueue {
    pub fn new(link: Arc<dyn BrokerLink>, project: impl Into<String>) -> Self {
        AmqpQueue {
            link,
            project: project.into(),
        }
    }

    async fn bindings(&self) -> Result<Vec<Binding>> {
        let bindings = self.link.list_bindings(EXCHANGE).await?;
        Ok(bindings
            .into_iter()
            .filter(|b| b.routing_key.starts_with(ROUTING_PREFIX))
            .collect())
    }
}

#[async_trait]
impl TaskQueue for AmqpQueue {
    async fn refresh(
        &self,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<HashMap<String, String>> {
        let mut found = HashMap::new();
        for binding in self.bindings().await? {
            let id = format!("{}?{}", uri_escape(&binding.vhost), uri_escape(&binding.queue));
            if subscription_matches(&id, matcher, mismatcher) {
                found.insert(id, binding.routing_key);
            }
        }
        Ok(found)
    }

    async fn exists(&self, subscription: &str) -> Result<bool> {
        let (vhost, queue) = split_subscription(subscription)?;
        Ok(self
            .bindings()
            .await?
            .iter()
            .any(|b| b.vhost == vhost && b.queue == queue))
    }

    async fn has_work(&self, subscription: &str) -> Result<bool> {
        let (vhost, queue) = split_subscription(subscription)?;
        Ok(self.link.depth(&vhost, &queue).await? > 0)
    }

    async fn work(
        &self,
        subscription: &str,
        handler: &TaskHandler,
    ) -> Result<(bool, Option<Resource>)> {
        let (vhost, queue) = split_subscription(subscription)?;

        let Some(delivery) = self.link.get(&vhost, &queue).await? else {
            return Ok((false, None));
        };

        let task = QueueTask {
            project: self.project.clone(),
            queue_type: "rmq",
            subscription: subscription.to_string(),
            short_queue_name: queue.clone(),
            credentials: vhost.clone(),
            msg: delivery.body,
            response_queue: Some(format!("{}{}.responses", ROUTING_PREFIX, queue)),
        };

        match handler(task).await {
            Ok(resource) => {
                self.link.ack(&vhost, delivery.tag).await?;
                Ok((true, resource))
            }
            Err(e) => {
                if let Err(nack_err) = self.link.nack(&vhost, delivery.tag).await {
                    log::error!("nack failed on {}: {}", subscription, nack_err);
                }
                Err(e)
            }
        }
    }

    fn responder(
        &self,
        subscription: &str,
        seal_key: Option<RsaPublicKey>,
    ) -> Result<mpsc::Sender<Report>> {
        let (vhost, queue) = split_subscription(subscription)?;
        let routing_key = format!("{}{}.responses", ROUTING_PREFIX, queue);
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
                if let Err(e) = link.publish(&vhost, &routing_key, &body).await {
                    log::warn!("response publish to {} failed: {}", routing_key, e);
                }
            }
        });
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// In-memory broker for tests
    #[derive(Default)]
    struct FakeBroker {
        bindings: Vec<Binding>,
        messages: Mutex<VecDeque<Delivery>>,
        acked: Mutex<Vec<u64>>,
        nacked: Mutex<Vec<u64>>,
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl BrokerLink for FakeBroker {
        async fn list_bindings(&self, _exchange: &str) -> Result<Vec<Binding>> {
            Ok(self.bindings.clone())
        }

        async fn depth(&self, _vhost: &str, _queue: &str) -> Result<u64> {
            Ok(self.messages.lock().len() as u64)
        }

        async fn get(&self, _vhost: &str, _queue: &str) -> Result<Option<Delivery>> {
            Ok(self.messages.lock().pop_front())
        }

        async fn ack(&self, _vhost: &str, tag: u64) -> Result<()> {
            self.acked.lock().push(tag);
            Ok(())
        }

        async fn nack(&self, _vhost: &str, tag: u64) -> Result<()> {
            self.nacked.lock().push(tag);
            Ok(())
        }

        async fn publish(&self, _vhost: &str, routing_key: &str, body: &[u8]) -> Result<()> {
            self.published
                .lock()
                .push((routing_key.to_string(), body.to_vec()));
            Ok(())
        }
    }

    fn binding(vhost: &str, queue: &str, routing_key: &str) -> Binding {
        Binding {
            vhost: vhost.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_refresh_escapes_and_filters() {
        let broker = Arc::new(FakeBroker {
            bindings: vec![
                binding("team/a", "rmq_train jobs", "StudioML.train"),
                binding("team/a", "rmq_eval", "StudioML.eval"),
                binding("team/a", "other", "NotOurs.x"),
            ],
            ..Default::default()
        });
        let queue = AmqpQueue::new(broker, "proj");

        let matcher = Regex::new(r"^.*rmq_.*$").unwrap();
        let found = queue.refresh(Some(&matcher), None).await.unwrap();
        let mut ids: Vec<_> = found.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["team%2Fa?rmq_eval", "team%2Fa?rmq_train%20jobs"]);

        assert!(queue.exists("team%2Fa?rmq_eval").await.unwrap());
        assert!(!queue.exists("team%2Fa?rmq_gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_work_acks_on_success() {
        let broker = Arc::new(FakeBroker::default());
        broker.messages.lock().push_back(Delivery {
            tag: 7,
            body: b"payload".to_vec(),
        });
        let queue = AmqpQueue::new(broker.clone(), "proj");

        let handler: TaskHandler = Arc::new(|task: QueueTask| {
            async move {
                assert_eq!(task.queue_type, "rmq");
                assert_eq!(task.short_queue_name, "rmq_train");
                Ok(Some(Resource {
                    cpus: 1,
                    ..Default::default()
                }))
            }
            .boxed()
        });

        let (processed, resource) = queue
            .work("team%2Fa?rmq_train", &handler)
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(resource.unwrap().cpus, 1);
        assert_eq!(*broker.acked.lock(), vec![7]);
        assert!(broker.nacked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_work_nacks_on_handler_error() {
        let broker = Arc::new(FakeBroker::default());
        broker.messages.lock().push_back(Delivery {
            tag: 9,
            body: b"payload".to_vec(),
        });
        let queue = AmqpQueue::new(broker.clone(), "proj");

        let handler: TaskHandler =
            Arc::new(|_| async { Err(WorkerError::io("no resources")) }.boxed());
        let err = queue.work("team%2Fa?rmq_train", &handler).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert_eq!(*broker.nacked.lock(), vec![9]);
        assert!(broker.acked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_queue_returns_unprocessed() {
        let broker = Arc::new(FakeBroker::default());
        let queue = AmqpQueue::new(broker, "proj");
        let handler: TaskHandler = Arc::new(|_| async { Ok(None) }.boxed());

        let (processed, resource) = queue.work("v?q", &handler).await.unwrap();
        assert!(!processed);
        assert!(resource.is_none());
        assert!(!queue.has_work("v?q").await.unwrap());
    }

    #[tokio::test]
    async fn test_responder_publishes_sealed_reports() {
        let broker = Arc::new(FakeBroker::default());
        let queue = AmqpQueue::new(broker.clone(), "proj");

        let private = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let tx = queue
            .responder("team%2Fa?rmq_train", Some(private.to_public_key()))
            .unwrap();

        tx.send(Report::logging(
            "worker-1",
            "run-1",
            "expt-1",
            kiln_events::Severity::Info,
            "starting",
        ))
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let published = broker.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "StudioML.rmq_train.responses");

        // Body is sealed, not clear JSON, and unseals back to the report
        let body = String::from_utf8(published[0].1.clone()).unwrap();
        assert!(!body.contains("starting"));
        let plain = envelope::hybrid_unseal(&body, &private).unwrap();
        assert!(String::from_utf8(plain).unwrap().contains("starting"));
    }
}
