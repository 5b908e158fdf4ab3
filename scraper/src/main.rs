use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use scraper::data_manager::{DataManager, DataManagerConfig};
use scraper::query::transport::DEFAULT_FOLLOW_UP_TIMEOUT;
use scraper::query::{
    GameSpyCodec, IdTech4Codec, QueryClient, QueryCodec, Quake3Codec, ScoreMode,
    SourceEngineCodec, UdpTransport,
};
use scraper::rcon::RconClient;
use scraper::sink::SinkRegistry;
use scraper::tailer::LineTailer;
use shared::QueryResultBundle;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Quake3,
    Source,
    Gamespy,
    Idtech4,
}

impl Protocol {
    fn default_kinds(self) -> &'static [&'static str] {
        match self {
            Protocol::Quake3 => &["status"],
            Protocol::Source => &["info", "rules", "players"],
            Protocol::Gamespy => &["info"],
            Protocol::Idtech4 => &["infoEx"],
        }
    }
}

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server protocol
    #[clap(short = 'P', long, value_enum)]
    protocol: Protocol,
    /// Game server host
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Game server query port
    #[clap(short, long)]
    port: u16,
    /// Query kinds to poll, comma separated (protocol default when omitted)
    #[clap(short, long, value_delimiter = ',')]
    kinds: Vec<String>,
    /// Delay between polling rounds in milliseconds
    #[clap(long, default_value = "250")]
    period_ms: u64,
    /// Receive deadline for query replies in milliseconds
    #[clap(long, default_value = "1000")]
    timeout_ms: u64,
    /// Update sink name (null, log, capture, udp)
    #[clap(short, long, default_value = "log")]
    sink: String,
    /// Sink-specific setup string, e.g. host:port for udp
    #[clap(long, default_value = "")]
    sink_setup: String,
    /// Score statistic for idTech4 extended info
    #[clap(long, value_enum, default_value = "kills")]
    score_mode: ScoreMode,
    /// Carry players over into new rounds instead of wiping them
    #[clap(long)]
    keep_players: bool,
    /// RCON port; enables the remote console poller
    #[clap(long)]
    rcon_port: Option<u16>,
    #[clap(long, default_value = "admin")]
    rcon_user: String,
    #[clap(long, default_value = "")]
    rcon_password: String,
    /// Console command sent on every RCON poll
    #[clap(long, default_value = "game.listPlayers")]
    rcon_command: String,
    /// Seconds between RCON polls
    #[clap(long, default_value = "5")]
    rcon_interval: u64,
    /// Server log file to follow
    #[clap(long)]
    log_file: Option<PathBuf>,
}

/// Main-method of the scraper.
/// Wires one protocol codec, the optional RCON and log followers, and the data manager.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info to see emitted updates");
    }

    let sink = SinkRegistry::with_defaults().create(&args.sink, &args.sink_setup)?;
    let manager = Arc::new(DataManager::with_config(
        sink,
        DataManagerConfig {
            wipe_players_on_new_round: !args.keep_players,
        },
    ));

    let address = format!("{}:{}", args.host, args.port);
    let transport = UdpTransport::connect(&address)
        .await?
        .with_timeouts(Duration::from_millis(args.timeout_ms), DEFAULT_FOLLOW_UP_TIMEOUT);

    let kinds: Vec<String> = if args.kinds.is_empty() {
        args.protocol
            .default_kinds()
            .iter()
            .map(|k| k.to_string())
            .collect()
    } else {
        args.kinds.clone()
    };
    info!("Polling {} for {:?}", address, kinds);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(port) = args.rcon_port {
        let rcon = RconClient::new(
            &format!("{}:{}", args.host, port),
            &args.rcon_user,
            &args.rcon_password,
        )
        .with_timeout(Duration::from_secs(5));
        tokio::spawn(run_rcon(
            rcon,
            args.rcon_command.clone(),
            Duration::from_secs(args.rcon_interval.max(1)),
            shutdown_rx.clone(),
        ));
    }

    if let Some(path) = &args.log_file {
        let mut tailer = LineTailer::open(path, true).await?;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut handler = |line: &str| debug!("log: {}", line);
            tailer.run(&mut handler, shutdown).await;
        });
    }

    let period = Duration::from_millis(args.period_ms);
    match args.protocol {
        Protocol::Quake3 => run_queries(Quake3Codec::new(transport), &kinds, period, manager).await,
        Protocol::Source => {
            run_queries(SourceEngineCodec::new(transport), &kinds, period, manager).await
        }
        Protocol::Gamespy => run_queries(GameSpyCodec::new(transport), &kinds, period, manager).await,
        Protocol::Idtech4 => {
            let codec = IdTech4Codec::new(transport).with_score_mode(args.score_mode);
            run_queries(codec, &kinds, period, manager).await
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Polls until Ctrl+C, forwarding every result into the data manager.
async fn run_queries<C: QueryCodec>(
    codec: C,
    kinds: &[String],
    period: Duration,
    manager: Arc<DataManager>,
) {
    let mut client = QueryClient::new(codec).with_period(period);
    for kind in kinds {
        let target = Arc::clone(&manager);
        client.register_listener(kind, move |_: &str, bundle: &QueryResultBundle| {
            target.apply_bundle(bundle);
        });
    }
    client.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");
    client.shutdown().await;
}

async fn run_rcon(
    mut rcon: RconClient,
    command: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(response) = rcon.send_command(&command).await {
                    info!("RCON {} -> {} bytes", command, response.len());
                    debug!("{}", response);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    rcon.disconnect().await;
}
