//! Queue-polling scheduler
//!
//! The integration point: every refresh cycle it re-reads the runtime
//! configuration, discovers subscriptions on each broker client, and keeps
//! exactly one worker loop per live subscription. Workers honour the
//! backoff registry, feed the execution-time EMA, and convert broker
//! failures into bounded-exponential backoffs. Drain state stops new
//! workers while in-flight runs finish.

use crate::backoff::Backoff;
use crate::config::{RuntimeConfig, WorkerState};
use crate::dispatch::Dispatch;
use crate::ema::ExecAvg;
use crate::error::WorkerError;
use crate::keys::ResponseKeys;
use crate::queue::{uri_unescape, TaskHandler, TaskQueue};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use kiln_events::{EventEmitter, WorkerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Ceiling for the broker-error backoff
const MAX_BROKER_BACKOFF: Duration = Duration::from_secs(60);

pub struct Scheduler {
    clients: Vec<Arc<dyn TaskQueue>>,
    dispatch: Arc<dyn Dispatch>,
    config: RuntimeConfig,
    backoff: Arc<Backoff>,
    exec_avg: Arc<ExecAvg>,
    response_keys: Option<ResponseKeys>,
    emitter: Option<EventEmitter>,
    active: DashMap<String, ()>,
    failures: DashMap<String, u32>,
    refresh_period: Duration,
    idle_backoff: Duration,
}

impl Scheduler {
    pub fn new(
        clients: Vec<Arc<dyn TaskQueue>>,
        dispatch: Arc<dyn Dispatch>,
        config: RuntimeConfig,
        backoff: Arc<Backoff>,
    ) -> Self {
        Scheduler {
            clients,
            dispatch,
            config,
            backoff,
            exec_avg: Arc::new(ExecAvg::standard()),
            response_keys: None,
            emitter: None,
            active: DashMap::new(),
            failures: DashMap::new(),
            refresh_period: Duration::from_secs(15),
            idle_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_response_keys(mut self, keys: ResponseKeys) -> Self {
        self.response_keys = Some(keys);
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_periods(mut self, refresh: Duration, idle_backoff: Duration) -> Self {
        self.refresh_period = refresh;
        self.idle_backoff = idle_backoff;
        self
    }

    /// Execution-time averages, for status reporting
    pub fn exec_avg(&self) -> Arc<ExecAvg> {
        self.exec_avg.clone()
    }

    /// Poll until `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "scheduler polling {} client(s) every {:?}",
            self.clients.len(),
            self.refresh_period
        );

        loop {
            match self.config.state() {
                WorkerState::Running => self.spawn_cycle(&shutdown).await,
                state => {
                    log::debug!("state {:?}: holding back new subscription workers", state)
                }
            }
            self.backoff.sweep();

            tokio::select! {
                _ = tokio::time::sleep(self.refresh_period) => {}
                _ = shutdown.changed() => {
                    log::info!("scheduler stopping");
                    return;
                }
            }
        }
    }

    async fn spawn_cycle(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) {
        let matcher = self.config.matcher();
        let mismatcher = self.config.mismatcher();

        for client in &self.clients {
            let found = match client.refresh(matcher.as_ref(), mismatcher.as_ref()).await {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("subscription refresh failed: {}", e);
                    continue;
                }
            };

            for (subscription, _credentials) in found {
                if self.backoff.blocked(&subscription) {
                    continue;
                }
                // One worker per subscription; the map entry is the claim
                if self.active.insert(subscription.clone(), ()).is_some() {
                    continue;
                }
                let scheduler = self.clone();
                let client = client.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    scheduler
                        .subscription_worker(client, subscription, shutdown)
                        .await;
                });
            }
        }
    }

    async fn subscription_worker(
        self: Arc<Self>,
        client: Arc<dyn TaskQueue>,
        subscription: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let short_name = short_queue_name(&subscription);
        let seal_key = self
            .response_keys
            .as_ref()
            .and_then(|keys| keys.select(&short_name).ok());
        let responder = match client.responder(&subscription, seal_key) {
            Ok(responder) => Some(responder),
            Err(e) => {
                log::warn!("responder for {} unavailable: {}", subscription, e);
                None
            }
        };

        let dispatch = self.dispatch.clone();
        let handler: TaskHandler = Arc::new(move |task| {
            let dispatch = dispatch.clone();
            let responder = responder.clone();
            async move { dispatch.handle(task, responder).await }.boxed()
        });

        loop {
            if *shutdown.borrow() || self.backoff.blocked(&subscription) {
                break;
            }

            let started = Instant::now();
            let result = tokio::select! {
                result = client.work(&subscription, &handler) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok((true, _resource)) => {
                    self.exec_avg.observe(started.elapsed());
                    self.failures.remove(&subscription);
                }
                Ok((false, _)) => {
                    // Idle: come back after a short pause
                    self.backoff.set(&subscription, self.idle_backoff);
                    break;
                }
                Err(e) => {
                    self.note_failure(&subscription, e);
                    break;
                }
            }
        }

        self.active.remove(&subscription);
    }

    fn note_failure(&self, subscription: &str, error: WorkerError) {
        let consecutive = {
            let mut entry = self.failures.entry(subscription.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = broker_backoff(consecutive);
        self.backoff.set(subscription, delay);
        log::warn!(
            "{} failed ({} in a row), backing off {:?}: {}",
            subscription,
            consecutive,
            delay,
            error
        );

        if let Some(ref emitter) = self.emitter {
            emitter.emit(WorkerEvent::QueueError {
                subscription: subscription.to_string(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
            emitter.emit(WorkerEvent::SubscriptionBackoff {
                subscription: subscription.to_string(),
                backoff_secs: delay.as_secs(),
                consecutive_failures: consecutive,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Bounded exponential: 1s, 2s, 4s, ... capped at one minute
fn broker_backoff(consecutive_failures: u32) -> Duration {
    let shift = consecutive_failures.saturating_sub(1).min(6);
    let secs = 1u64 << shift;
    Duration::from_secs(secs).min(MAX_BROKER_BACKOFF)
}

/// Human queue name inside a subscription id
fn short_queue_name(subscription: &str) -> String {
    if let Some((_vhost, queue)) = subscription.split_once('?') {
        uri_unescape(queue)
    } else if let Some((_region, queue)) = subscription.split_once(':') {
        queue.to_string()
    } else {
        subscription.to_string()
    }
}
