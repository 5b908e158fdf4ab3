//! # Game Server Scraper Library
//!
//! This library collects live state from running game servers and republishes
//! it as a stream of normalized change events. It speaks several incompatible
//! server protocols, reconciles everything they report into one canonical
//! scoreboard, and only emits an update when something actually changed.
//!
//! ## Core Responsibilities
//!
//! ### Protocol Decoding
//! Each supported server family has its own codec turning raw datagrams into a
//! [`shared::QueryResultBundle`]:
//! - Quake3-style text status replies
//! - Source-engine binary info, rules and player replies with challenge handshake
//! - GameSpy key/value replies split over several out-of-order datagrams
//! - idTech4 binary replies bound to a caller-chosen challenge
//!
//! ### Polling
//! A query client drives one codec on a fixed period and hands every result to
//! the listener registered for that query kind.
//!
//! ### Remote Console
//! The RCON client keeps an authenticated TCP session to servers that expose
//! richer data through console commands, reconnecting transparently after any
//! failure.
//!
//! ### State Reconciliation
//! The data manager merges partial and repeated records for players, teams,
//! rounds, games and scores, namespacing player identities per round, and
//! emits the minimal set of change messages to an update sink.
//!
//! ## Module Organization
//!
//! ### Query Module (`query`)
//! - `QueryClient` poll loop with cooperative cancellation
//! - `UdpTransport` request/response helper with receive deadlines
//! - One submodule per protocol codec
//!
//! ### RCON Module (`rcon`)
//! - XOR-obfuscated login handshake
//! - Length-prefixed command framing
//!
//! ### Data Manager Module (`data_manager`)
//! - Merge-and-diff for every record type under a single lock
//! - Round-scoped player namespaces
//!
//! ### Sink Module (`sink`)
//! - `UpdateSink` trait and built-in destinations
//! - `SinkRegistry` resolving a sink from configuration
//!
//! ### Tailer Module (`tailer`)
//! - Follows server log files line by line for external parsers
//!
//! ## Failure Model
//!
//! Nothing here is fatal to the process. Timeouts produce no result for that
//! cycle, malformed replies are logged and dropped, and records that cannot be
//! attributed to a player are rejected without touching stored state.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use scraper::data_manager::DataManager;
//! use scraper::query::{QueryClient, Quake3Codec};
//! use scraper::sink::LogSink;
//! use shared::QueryResultBundle;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Arc::new(DataManager::new(Arc::new(LogSink)));
//!
//!     let codec = Quake3Codec::connect("127.0.0.1:27960").await?;
//!     let mut client = QueryClient::new(codec);
//!
//!     let target = Arc::clone(&manager);
//!     client.register_listener("status", move |_: &str, bundle: &QueryResultBundle| {
//!         target.apply_bundle(bundle);
//!     });
//!     client.start();
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod data_manager;
pub mod error;
pub mod query;
pub mod rcon;
pub mod sink;
pub mod tailer;
