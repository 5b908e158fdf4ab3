//! Destinations for normalized update messages
//!
//! The data manager calls [`UpdateSink::send_update`] while holding its state
//! lock, so implementations must return quickly. Network sinks hand messages
//! to a channel drained by a background task instead of sending inline.
//!
//! Sinks are chosen at startup by name through a [`SinkRegistry`]:
//!
//! | name      | setup string            | behaviour                              |
//! |-----------|-------------------------|----------------------------------------|
//! | `null`    | ignored                 | drops every message                    |
//! | `log`     | ignored                 | logs each message as JSON at info      |
//! | `capture` | ignored                 | keeps messages in memory               |
//! | `udp`     | `host:port` destination | sends bincode-encoded datagrams        |

use crate::error::SinkError;
use log::{debug, error, info};
use parking_lot::Mutex;
use shared::UpdateMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub trait UpdateSink: Send + Sync {
    fn send_update(&self, message: UpdateMessage);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl UpdateSink for NullSink {
    fn send_update(&self, message: UpdateMessage) {
        debug!("Dropping {} update", message.kind());
    }
}

#[derive(Debug, Default)]
pub struct LogSink;

impl UpdateSink for LogSink {
    fn send_update(&self, message: UpdateMessage) {
        match serde_json::to_string(&message) {
            Ok(json) => info!("{}", json),
            Err(e) => error!("Failed to encode {} update: {}", message.kind(), e),
        }
    }
}

/// Keeps every message in memory, in emission order
#[derive(Debug, Default)]
pub struct CaptureSink {
    messages: Mutex<Vec<UpdateMessage>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<UpdateMessage> {
        self.messages.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn last(&self) -> Option<UpdateMessage> {
        self.messages.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl UpdateSink for CaptureSink {
    fn send_update(&self, message: UpdateMessage) {
        self.messages.lock().push(message);
    }
}

/// Forwards bincode-encoded messages to a UDP listener
pub struct UdpSink {
    target: SocketAddr,
    tx: mpsc::UnboundedSender<UpdateMessage>,
}

impl UdpSink {
    /// Spawns the sender task on the current tokio runtime.
    pub fn new(target: SocketAddr) -> Result<Self, SinkError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SinkError::NoRuntime)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<UpdateMessage>();

        runtime.spawn(async move {
            let bind_addr = if target.is_ipv4() {
                "0.0.0.0:0"
            } else {
                "[::]:0"
            };
            let socket = match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    error!("Failed to bind update socket: {}", e);
                    return;
                }
            };

            while let Some(message) = rx.recv().await {
                let data = match message.to_bytes() {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Failed to encode {} update: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = socket.send_to(&data, target).await {
                    error!("Failed to send update to {}: {}", target, e);
                }
            }
            debug!("Update sender for {} stopped", target);
        });

        Ok(Self { target, tx })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl UpdateSink for UdpSink {
    fn send_update(&self, message: UpdateMessage) {
        if let Err(e) = self.tx.send(message) {
            error!("Failed to queue update for {}: {}", self.target, e);
        }
    }
}

pub type SinkFactory = Box<dyn Fn(&str) -> Result<Arc<dyn UpdateSink>, SinkError> + Send + Sync>;

/// Builds sinks from a configured name and setup string
pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `null`, `log`, `capture` and `udp` sinks.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("null", |_| Ok(Arc::new(NullSink)));
        registry.register("log", |_| Ok(Arc::new(LogSink)));
        registry.register("capture", |_| Ok(Arc::new(CaptureSink::new())));
        registry.register("udp", |setup| {
            let target = setup.parse::<SocketAddr>().map_err(|e| SinkError::BadSetup {
                setup: setup.to_string(),
                message: e.to_string(),
            })?;
            Ok(Arc::new(UdpSink::new(target)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn UpdateSink>, SinkError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, name: &str, setup: &str) -> Result<Arc<dyn UpdateSink>, SinkError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SinkError::UnknownSink(name.to_string()))?;
        factory(setup)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
