//! Cluster discovery: watch streams feeding the topology cache.
//!
//! Each resource kind gets its own [`Reconciler`]. A reconciler subscribes to
//! a [`Subscribe`] source, applies every event to the cache and, when the
//! stream fails to open or ends, sleeps a fixed backoff and subscribes again.
//! It only stops when the shutdown token fires.

pub mod cache;
pub mod k8s;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use self::cache::{EndpointRecord, Record, ServicePort, ServiceRecord, TopologyCache};

/// One change to a watched resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// A resource appeared.
    Added(T),
    /// A resource changed.
    Modified(T),
    /// A resource was removed.
    Deleted(T),
    /// The full current set, sent first on every (re)subscription. It
    /// replaces everything previously known for the kind.
    Restarted(Vec<T>),
}

/// Why a watch stream stopped delivering events. Always handled internally.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The subscription could not be opened.
    #[error("failed to open watch: {0}")]
    Open(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The stream reported an error.
    #[error("watch stream failed: {0}")]
    Api(String),
}

/// A stream of events for one resource kind.
pub type EventStream<T> = BoxStream<'static, Result<Event<T>, WatchError>>;

/// A source of watch subscriptions.
#[async_trait::async_trait]
pub trait Subscribe: Send + Sync {
    /// The record type the events carry.
    type Record: Send + 'static;

    /// Opens a new subscription. The stream starts with a
    /// [`Event::Restarted`] listing.
    async fn subscribe(&self) -> Result<EventStream<Self::Record>, WatchError>;
}

/// A store that can absorb watch events.
pub trait Apply<T> {
    /// Apply one event.
    fn apply(&self, event: Event<T>);
}

/// Keeps one resource kind of a cache in sync with its watch source.
#[derive(Debug)]
pub struct Reconciler<S, C> {
    kind: &'static str,
    source: S,
    cache: Arc<C>,
    backoff: Duration,
}

impl<S, C> Reconciler<S, C>
where
    S: Subscribe,
    C: Apply<S::Record> + Send + Sync + 'static,
{
    /// Creates a reconciler for `kind` that waits `backoff` between subscriptions.
    pub fn new(kind: &'static str, source: S, cache: Arc<C>, backoff: Duration) -> Self {
        Self {
            kind,
            source,
            cache,
            backoff,
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let span = tracing::info_span!("watch", kind = self.kind);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, shutdown: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscribed = self.source.subscribe() => subscribed,
            };

            match subscribed {
                Ok(mut events) => {
                    tracing::info!("Watch opened");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.cancelled() => {
                                tracing::debug!("Watch stopped");
                                return;
                            }
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => self.cache.apply(event),
                            Some(Err(error)) => {
                                tracing::warn!(%error, "Watch interrupted");
                                break;
                            }
                            None => {
                                tracing::warn!("Watch stream closed");
                                break;
                            }
                        }
                    }
                }
                Err(error) => tracing::warn!(%error, "Failed to open watch"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
            tracing::info!("Restarting watch");
        }
        tracing::debug!("Watch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as events;
    use tokio::sync::{mpsc, Mutex};

    type Session = Result<events::UnboundedReceiver<Result<Event<EndpointRecord>, WatchError>>, WatchError>;

    /// A source whose subscriptions are handed out one at a time by the test.
    struct ChannelSource {
        sessions: Mutex<mpsc::UnboundedReceiver<Session>>,
    }

    impl ChannelSource {
        fn new() -> (mpsc::UnboundedSender<Session>, Self) {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Self { sessions: Mutex::new(rx) })
        }
    }

    #[async_trait::async_trait]
    impl Subscribe for ChannelSource {
        type Record = EndpointRecord;

        async fn subscribe(&self) -> Result<EventStream<EndpointRecord>, WatchError> {
            match self.sessions.lock().await.recv().await {
                Some(Ok(rx)) => Ok(rx.boxed()),
                Some(Err(error)) => Err(error),
                None => futures::future::pending().await,
            }
        }
    }

    fn endpoints(name: &str, ip: &str) -> EndpointRecord {
        EndpointRecord::new("default", name, vec![ip.to_string()], vec![80])
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn spawn(source: ChannelSource, cache: Arc<TopologyCache>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let shutdown = CancellationToken::new();
        let reconciler = Reconciler::new("endpoints", source, cache, Duration::from_millis(10));
        let task = tokio::spawn(reconciler.run(shutdown.clone()));
        (shutdown, task)
    }

    #[tokio::test]
    async fn resumes_after_stream_closes() {
        let (sessions, source) = ChannelSource::new();
        let cache = Arc::new(TopologyCache::new());
        let (shutdown, task) = spawn(source, cache.clone());

        let (tx, rx) = events::unbounded();
        sessions.send(Ok(rx)).unwrap();
        tx.unbounded_send(Ok(Event::Added(endpoints("app", "10.0.0.1")))).unwrap();
        eventually(|| cache.endpoints_for("default", "app").is_some()).await;

        // Closing the stream simulates a dropped watch connection.
        drop(tx);

        let (tx, rx) = events::unbounded();
        sessions.send(Ok(rx)).unwrap();
        tx.unbounded_send(Ok(Event::Added(endpoints("web", "10.0.0.2")))).unwrap();
        eventually(|| cache.endpoints_for("default", "web").is_some()).await;
        assert!(cache.endpoints_for("default", "app").is_some());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn retries_failed_subscriptions_and_stream_errors() {
        let (sessions, source) = ChannelSource::new();
        let cache = Arc::new(TopologyCache::new());
        let (shutdown, task) = spawn(source, cache.clone());

        sessions.send(Err(WatchError::Api("connection refused".into()))).unwrap();

        let (tx, rx) = events::unbounded();
        sessions.send(Ok(rx)).unwrap();
        tx.unbounded_send(Err(WatchError::Api("410 gone".into()))).unwrap();

        let (tx, rx) = events::unbounded();
        sessions.send(Ok(rx)).unwrap();
        tx.unbounded_send(Ok(Event::Restarted(vec![endpoints("app", "10.0.0.1")]))).unwrap();
        eventually(|| cache.endpoints().len() == 1).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_shutdown_while_waiting() {
        let (_sessions, source) = ChannelSource::new();
        let (shutdown, task) = spawn(source, Arc::new(TopologyCache::new()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
