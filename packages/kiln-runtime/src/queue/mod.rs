//! Task-queue abstraction
//!
//! One uniform surface over heterogeneous brokers: AMQP topic exchanges,
//! S3-compatible polling queues, and plain local directories. The scheduler
//! only ever sees subscriptions (opaque ids), `work` pulls, and responder
//! channels; everything broker-specific stays behind these modules.

pub mod amqp;
pub mod local;
pub mod s3poll;

pub use amqp::{AmqpQueue, Binding, BrokerLink, Delivery};
pub use local::LocalQueue;
pub use s3poll::{PollBrokerLink, PollQueue, PolledMessage};

use crate::error::Result;
use crate::request::Resource;
use async_trait::async_trait;
use futures::future::BoxFuture;
use kiln_events::Report;
use regex::Regex;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One pulled message plus the context a handler needs to run it
#[derive(Debug, Clone)]
pub struct QueueTask {
    pub project: String,
    pub queue_type: &'static str,
    pub subscription: String,
    pub short_queue_name: String,
    pub credentials: String,
    pub msg: Vec<u8>,
    pub response_queue: Option<String>,
}

/// Message handler invoked by `TaskQueue::work`
///
/// A successful handle acks the message; an error nacks (or lets visibility
/// lapse) so the broker redelivers. The returned resource block, when the
/// handler could parse one, feeds scheduler accounting.
pub type TaskHandler =
    Arc<dyn Fn(QueueTask) -> BoxFuture<'static, Result<Option<Resource>>> + Send + Sync>;

/// Uniform broker client surface consumed by the scheduler
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Discover current subscriptions, filtered by the include/exclude
    /// regexes; returns subscription id to opaque credentials
    async fn refresh(
        &self,
        matcher: Option<&Regex>,
        mismatcher: Option<&Regex>,
    ) -> Result<HashMap<String, String>>;

    async fn exists(&self, subscription: &str) -> Result<bool>;

    /// Best-effort cheap idle check; must not block on broker round trips
    /// beyond a metadata peek
    async fn has_work(&self, subscription: &str) -> Result<bool>;

    /// Pull and handle at most one message; `(processed, resource)`
    async fn work(
        &self,
        subscription: &str,
        handler: &TaskHandler,
    ) -> Result<(bool, Option<Resource>)>;

    /// Send-only report channel for the subscription's response queue;
    /// reports are sealed when a public key is supplied
    fn responder(
        &self,
        subscription: &str,
        seal_key: Option<RsaPublicKey>,
    ) -> Result<mpsc::Sender<Report>>;
}

/// Keep a subscription when it passes the include filter (if any) and is
/// not caught by the exclude filter
pub fn subscription_matches(
    id: &str,
    matcher: Option<&Regex>,
    mismatcher: Option<&Regex>,
) -> bool {
    if let Some(matcher) = matcher {
        if !matcher.is_match(id) {
            return false;
        }
    }
    if let Some(mismatcher) = mismatcher {
        if mismatcher.is_match(id) {
            return false;
        }
    }
    true
}

const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Percent-encode everything outside the RFC 3986 unreserved set
pub fn uri_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Invert `uri_escape`; malformed escapes pass through untouched
pub fn uri_unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &input[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
