//! Polling framework for game-server status queries
//!
//! A [`QueryClient`] owns one protocol codec and a map of listeners keyed by
//! query kind (`"info"`, `"players"`, `"status"`, ...). Once started it runs a
//! single tokio task that, every period, asks the codec for each registered
//! kind and hands any resulting [`QueryResultBundle`] to that kind's listener.
//!
//! Codecs never surface errors to the loop. Timeouts are silent, malformed
//! replies are logged and dropped, and the next tick simply tries again.

pub mod gamespy;
pub mod idtech4;
pub mod quake3;
pub mod source_engine;
pub mod transport;

use crate::error::QueryError;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use shared::QueryResultBundle;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub use gamespy::GameSpyCodec;
pub use idtech4::{IdTech4Codec, ScoreMode};
pub use quake3::Quake3Codec;
pub use source_engine::SourceEngineCodec;
pub use transport::UdpTransport;

/// Delay between two polling rounds
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(250);

/// One wire protocol able to answer named queries
pub trait QueryCodec: Send + 'static {
    /// Runs one request/response exchange for `kind`.
    ///
    /// `None` means nothing usable came back this time.
    fn query(&mut self, kind: &str) -> impl Future<Output = Option<QueryResultBundle>> + Send;
}

/// Receives the bundle produced for one query kind
pub trait QueryListener: Send + Sync {
    fn on_result(&self, kind: &str, bundle: &QueryResultBundle);
}

impl<F> QueryListener for F
where
    F: Fn(&str, &QueryResultBundle) + Send + Sync,
{
    fn on_result(&self, kind: &str, bundle: &QueryResultBundle) {
        self(kind, bundle)
    }
}

type ListenerMap = Arc<RwLock<HashMap<String, Arc<dyn QueryListener>>>>;

/// Turns a codec's fallible exchange into the loop's "bundle or nothing".
pub(crate) fn settle(
    protocol: &str,
    kind: &str,
    result: Result<Option<QueryResultBundle>, QueryError>,
) -> Option<QueryResultBundle> {
    match result {
        Ok(Some(bundle)) => Some(bundle),
        Ok(None) => {
            debug!("{} {} query got no reply", protocol, kind);
            None
        }
        Err(e) if e.is_protocol_violation() => {
            warn!("Discarding {} {} response: {}", protocol, kind, e);
            None
        }
        Err(e) => {
            error!("{} {} query failed: {}", protocol, kind, e);
            None
        }
    }
}

/// Periodically polls one game server through a codec
pub struct QueryClient<C: QueryCodec> {
    codec: Arc<Mutex<C>>,
    listeners: ListenerMap,
    period: Duration,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<C: QueryCodec> QueryClient<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(Mutex::new(codec)),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            period: DEFAULT_PERIOD,
            shutdown: None,
            task: None,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Registers `listener` for `kind`, replacing any previous one.
    ///
    /// Safe to call while the client is polling; the change applies from the
    /// next polling round.
    pub fn register_listener(&self, kind: &str, listener: impl QueryListener + 'static) {
        self.listeners
            .write()
            .insert(kind.to_string(), Arc::new(listener));
    }

    pub fn unregister_listener(&self, kind: &str) -> bool {
        self.listeners.write().remove(kind).is_some()
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.listeners.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Spawns the polling task. Does nothing when already running.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("Query client already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let codec = Arc::clone(&self.codec);
        let listeners = Arc::clone(&self.listeners);
        let period = self.period;

        self.task = Some(tokio::spawn(async move {
            poll_loop(codec, listeners, period, shutdown_rx).await;
        }));
        self.shutdown = Some(shutdown_tx);
        info!("Query client started with {:?} period", period);
    }

    /// Signals the polling task to stop after its current round.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.task = None;
    }

    /// Stops polling and waits until the task has exited.
    ///
    /// Bounded by the codec's receive deadline, since an in-flight exchange is
    /// allowed to finish.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Query task ended abnormally: {}", e);
            }
        }
    }

    /// Runs a single polling round on the caller's task.
    pub async fn poll_once(&self) {
        poll_kinds(&self.codec, &self.listeners).await;
    }
}

impl<C: QueryCodec> Drop for QueryClient<C> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

async fn poll_kinds<C: QueryCodec>(codec: &Mutex<C>, listeners: &ListenerMap) {
    let kinds: Vec<String> = listeners.read().keys().cloned().collect();
    let mut codec = codec.lock().await;

    for kind in kinds {
        if let Some(bundle) = codec.query(&kind).await {
            // Re-read so an unregister during the exchange is honoured
            let listener = listeners.read().get(&kind).cloned();
            if let Some(listener) = listener {
                listener.on_result(&kind, &bundle);
            }
        }
    }
}

async fn poll_loop<C: QueryCodec>(
    codec: Arc<Mutex<C>>,
    listeners: ListenerMap,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        poll_kinds(&codec, &listeners).await;

        tokio::select! {
            _ = tokio::time::sleep(period) => {},
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Query loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Alias, ServerMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Codec answering every kind with a bundle naming the kind
    struct EchoCodec {
        calls: Arc<AtomicUsize>,
    }

    impl QueryCodec for EchoCodec {
        async fn query(&mut self, kind: &str) -> Option<QueryResultBundle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if kind == "silent" {
                return None;
            }
            let mut metadata = ServerMetadata::default();
            metadata.server_name = Some(kind.to_string());
            Some(QueryResultBundle {
                server_metadata: Some(metadata),
                players: vec![Alias::named("echo")],
                ..QueryResultBundle::default()
            })
        }
    }

    fn echo_client() -> (QueryClient<EchoCodec>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = QueryClient::new(EchoCodec {
            calls: Arc::clone(&calls),
        })
        .with_period(Duration::from_millis(10));
        (client, calls)
    }

    #[tokio::test]
    async fn test_poll_once_delivers_to_matching_listener() {
        let (client, calls) = echo_client();
        let seen = Arc::new(RwLock::new(Vec::new()));

        let sink = Arc::clone(&seen);
        client.register_listener("info", move |kind: &str, bundle: &QueryResultBundle| {
            let name = bundle
                .server_metadata
                .as_ref()
                .and_then(|m| m.server_name.clone());
            sink.write().push((kind.to_string(), name));
        });
        client.register_listener("silent", |_: &str, _: &QueryResultBundle| {
            panic!("no bundle expected for silent kind");
        });

        client.poll_once().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let seen = seen.read();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("info".to_string(), Some("info".to_string())));
    }

    #[tokio::test]
    async fn test_unregister_listener() {
        let (client, calls) = echo_client();
        client.register_listener("info", |_: &str, _: &QueryResultBundle| {});
        assert_eq!(client.registered_kinds(), vec!["info".to_string()]);

        assert!(client.unregister_listener("info"));
        assert!(!client.unregister_listener("info"));

        client.poll_once().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_halts_polling() {
        let (mut client, calls) = echo_client();
        client.register_listener("info", |_: &str, _: &QueryResultBundle| {});

        client.start();
        client.start();
        assert!(client.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.shutdown().await;
        assert!(!client.is_running());

        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop >= 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (mut client, calls) = echo_client();
        client.register_listener("info", |_: &str, _: &QueryResultBundle| {});

        client.start();
        client.stop();
        assert!(!client.is_running());

        client.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_running());
        client.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_settle_swallows_errors() {
        assert!(settle("test", "info", Ok(None)).is_none());
        assert!(settle("test", "info", Err(QueryError::BadHeader)).is_none());
        let bundle = settle("test", "info", Ok(Some(QueryResultBundle::default())));
        assert!(bundle.is_some());
    }
}
