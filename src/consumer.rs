//! Consumer Runtime (§4.5): one background poll loop per (consumer, topic)
//! pair, concurrent per-batch handler dispatch with a barrier, and a bounded
//! error channel.
//!
//! Grounded on the teacher's dispatcher-task idiom
//! (`server/src/data/topics/mod.rs::start_dispatcher`): a `tokio::spawn`'d
//! loop driven by `tokio::select!` against a shutdown signal, and on its
//! `DEFAULT_BROADCAST_CAPACITY`-style bounded channel convention for the
//! error channel. The per-topic running-flag map uses `dashmap::DashMap`,
//! the concurrent-map primitive Design Notes call for (teacher already
//! depends on `dashmap` for its cache and registry structures).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RediMqError;
use crate::grouped_topic::GroupedTopic;
use crate::message::Message;
use crate::topic::UnorderedTopic;

/// Bounded capacity of a consumer's error channel; once full, further errors
/// are dropped rather than blocking the poll loop (§4.5, §7).
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Bounded capacity of the fallback message channel used when no handler is
/// registered (restored from `original_source/consumer.go`'s `Messages`
/// field).
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

/// A per-message handler. Errors are the handler's business: the runtime
/// does not acknowledge on its behalf (§7).
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), RediMqError>> + Send + Sync>;

enum Dispatch {
    Handler(Handler),
    Channel(mpsc::Sender<Message>),
}

/// One named consumer in a consumer group, capable of running poll loops
/// against any number of topics concurrently.
pub struct Consumer {
    pub group: String,
    pub name: String,
    dispatch: Dispatch,
    running: DashMap<String, Arc<AtomicBool>>,
    tasks: DashMap<String, (JoinHandle<()>, CancellationToken)>,
    error_tx: mpsc::Sender<RediMqError>,
    error_rx: parking_lot::Mutex<Option<mpsc::Receiver<RediMqError>>>,
}

impl Consumer {
    /// Build a consumer that dispatches received messages to `handler`.
    pub(crate) fn with_handler(group: String, name: String, handler: Handler) -> Arc<Self> {
        Self::build(group, name, Dispatch::Handler(handler))
    }

    /// Build a consumer with no handler: received messages are delivered
    /// through the returned stream instead (original Go `Consumer.Messages`
    /// channel behaviour, restored from `original_source/consumer.go`).
    pub(crate) fn with_channel(group: String, name: String) -> (Arc<Self>, impl Stream<Item = Message>) {
        let (tx, mut rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let consumer = Self::build(group, name, Dispatch::Channel(tx));
        let stream = async_stream::stream! {
            while let Some(m) = rx.recv().await {
                yield m;
            }
        };
        (consumer, stream)
    }

    fn build(group: String, name: String, dispatch: Dispatch) -> Arc<Self> {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Arc::new(Consumer {
            group,
            name,
            dispatch,
            running: DashMap::new(),
            tasks: DashMap::new(),
            error_tx,
            error_rx: parking_lot::Mutex::new(Some(error_rx)),
        })
    }

    /// Take the error receiver. Returns `None` if already taken — there is
    /// only ever one.
    pub fn errors(&self) -> Option<mpsc::Receiver<RediMqError>> {
        self.error_rx.lock().take()
    }

    async fn dispatch_batch(&self, messages: Vec<Message>) {
        match &self.dispatch {
            Dispatch::Handler(handler) => {
                let futures = messages.into_iter().map(|m| {
                    let handler = Arc::clone(handler);
                    async move {
                        if let Err(e) = handler(m).await {
                            tracing::warn!(error = %e, "handler returned an error");
                        }
                    }
                });
                join_all(futures).await;
            }
            Dispatch::Channel(tx) => {
                for m in messages {
                    if tx.send(m).await.is_err() {
                        tracing::debug!("message channel receiver dropped");
                        break;
                    }
                }
            }
        }
    }

    fn send_error(&self, err: RediMqError) {
        if self.error_tx.try_send(err).is_err() {
            tracing::debug!("error channel full or has no receiver, dropping");
        }
    }

    /// Start the poll loop for `topic`. Idempotent-erroring: a second call
    /// for the same topic name returns `AlreadyRunning` (§4.5).
    #[tracing::instrument(skip(self, topic), fields(consumer = %self.name, topic = %topic.name))]
    pub async fn start_topic(self: &Arc<Self>, topic: Arc<UnorderedTopic>, count: usize) -> Result<(), RediMqError> {
        let key = format!("topic:{}", topic.name);
        self.start_loop(key, move |this, running, cancel| {
            let topic = Arc::clone(&topic);
            let group = this.group.clone();
            let consumer = this.name.clone();
            Box::pin(async move {
                loop {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = topic.consume(&group, &consumer, count) => {
                            match result {
                                Ok(messages) if !messages.is_empty() => this.dispatch_batch(messages).await,
                                Ok(_) => {}
                                Err(e) => this.send_error(e),
                            }
                        }
                    }
                }
            })
        })
        .await
    }

    /// Stop a previously-started topic's poll loop. A no-op if not running.
    pub fn stop_topic(&self, topic_name: &str) {
        self.stop_loop(&format!("topic:{topic_name}"));
    }

    /// As [`Self::start_topic`], polling a grouped topic's single-message
    /// `consume` instead.
    #[tracing::instrument(skip(self, topic), fields(consumer = %self.name, topic = %topic.name))]
    pub async fn start_grouped_topic(self: &Arc<Self>, topic: Arc<GroupedTopic>) -> Result<(), RediMqError> {
        let key = format!("grouped:{}", topic.name);
        self.start_loop(key, move |this, running, cancel| {
            let topic = Arc::clone(&topic);
            let group = this.group.clone();
            let consumer = this.name.clone();
            Box::pin(async move {
                loop {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = topic.consume(&group, &consumer) => {
                            match result {
                                Ok(messages) if !messages.is_empty() => this.dispatch_batch(messages).await,
                                Ok(_) => {}
                                Err(e) => this.send_error(e),
                            }
                        }
                    }
                }
            })
        })
        .await
    }

    /// Stop a previously-started grouped topic's poll loop. A no-op if not running.
    pub fn stop_grouped_topic(&self, topic_name: &str) {
        self.stop_loop(&format!("grouped:{topic_name}"));
    }

    async fn start_loop<F>(self: &Arc<Self>, key: String, make_loop: F) -> Result<(), RediMqError>
    where
        F: FnOnce(Arc<Self>, Arc<AtomicBool>, CancellationToken) -> BoxFuture<'static, ()>,
    {
        if self.tasks.contains_key(&key) {
            return Err(RediMqError::AlreadyRunning { topic: key });
        }

        let running = Arc::new(AtomicBool::new(true));
        self.running.insert(key.clone(), Arc::clone(&running));

        let cancel = CancellationToken::new();
        let loop_future = make_loop(Arc::clone(self), running, cancel.clone());
        let handle = tokio::spawn(loop_future);

        if self.tasks.insert(key, (handle, cancel)).is_some() {
            tracing::warn!("race on consumer task registration; second start wins");
        }
        Ok(())
    }

    fn stop_loop(&self, key: &str) {
        if let Some(flag) = self.running.get(key) {
            flag.store(false, Ordering::Relaxed);
        }
        if let Some((_, (_, cancel))) = self.tasks.remove(key) {
            cancel.cancel();
        }
        self.running.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicOptions;
    use crate::driver::mock::MockDriver;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn start_topic_twice_returns_already_running() {
        let driver = Arc::new(MockDriver::new());
        let topic = Arc::new(UnorderedTopic::new(driver, "orders".to_string(), TopicOptions::default()));
        let handler: Handler = Arc::new(|_m: Message| Box::pin(async { Ok::<(), RediMqError>(()) }));
        let consumer = Consumer::with_handler("g".to_string(), "c1".to_string(), handler);

        consumer.start_topic(Arc::clone(&topic), 1).await.unwrap();
        let err = consumer.start_topic(Arc::clone(&topic), 1).await.unwrap_err();
        assert!(matches!(err, RediMqError::AlreadyRunning { .. }));

        consumer.stop_topic(&topic.name);
    }

    #[tokio::test]
    async fn handler_is_invoked_for_published_messages() {
        let driver = Arc::new(MockDriver::new());
        let topic = Arc::new(UnorderedTopic::new(driver, "orders".to_string(), TopicOptions::default()));
        topic.publish(Default::default()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |_m: Message| {
            let seen = Arc::clone(&seen_clone);
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<(), RediMqError>(())
            })
        });
        let consumer = Consumer::with_handler("g".to_string(), "c1".to_string(), handler);

        consumer.start_topic(Arc::clone(&topic), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop_topic(&topic.name);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
