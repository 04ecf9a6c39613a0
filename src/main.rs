//! Relay Presence - Main Entry Point
//!
//! Monitors a relay controller over MQTT, issues gated relay commands,
//! measures round-trip latency to the device, and can stand in for the
//! device itself when no hardware is at hand.

use clap::{Parser, Subcommand};
use relay_presence::config::{validate_channel_id, RelayConfig};
use relay_presence::error::RelayError;
use relay_presence::observability::init_default_logging;
use relay_presence::protocol::{
    InboundMessage, PayloadCase, RelayCommand, RelayState, TopicLayout, OFFLINE_PAYLOAD,
    ONLINE_PAYLOAD,
};
use relay_presence::session::{PresenceSession, SessionConfig, SessionEvent, SessionHandle};
use relay_presence::transport::mqtt::{
    generate_client_id, ConnectionState, LastWillSpec, MqttTransport,
};
use relay_presence::transport::Transport;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, Instant, Interval, MissedTickBehavior};
use tokio::signal;
use tracing::{debug, error, info, warn};

/// Presence tracking and gated relay control over MQTT
#[derive(Parser)]
#[command(name = "relay-presence")]
#[command(about = "Presence tracking and gated relay control over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch device presence and channel status
    Monitor {
        /// Print a JSON snapshot every N seconds
        #[arg(long, value_name = "N")]
        snapshot_secs: Option<u64>,
    },
    /// Send one relay command once the device is online and the channel known
    Command {
        /// Channel id, e.g. lampu1
        channel: String,
        #[arg(value_enum)]
        state: RelayCommand,
        /// How long to wait for connection, presence and channel sync
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Measure round-trip latency through the device's ping echo
    Ping {
        /// Number of pings, one per second
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// How long to wait for the connection and for each echo
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },
    /// Act as the relay controller
    Simulate,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting relay-presence v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Monitor { snapshot_secs } => run_monitor(config, snapshot_secs).await,
        Commands::Command {
            channel,
            state,
            wait_secs,
        } => run_command(config, channel, state, wait_secs).await,
        Commands::Ping {
            count,
            timeout_secs,
        } => run_ping(config, count, timeout_secs).await,
        Commands::Simulate => run_simulator(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(RelayConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["relay.toml", "config/relay.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(RelayConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create relay.toml".into())
        }
    }
}

/// Resolve on SIGINT or SIGTERM, returning the signal name
async fn shutdown_signal() -> Result<&'static str, std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

async fn start_session(
    config: &RelayConfig,
) -> Result<(MqttTransport, SessionHandle), Box<dyn std::error::Error>> {
    let client_id = generate_client_id(&config.mqtt.client_id_prefix);
    let (transport, inbound) = MqttTransport::start(&client_id, &config.mqtt, None)?;
    let session = PresenceSession::spawn(
        transport.clone(),
        inbound,
        SessionConfig::from_relay_config(config).with_ping_sender(&client_id),
    )
    .await?;
    Ok((transport, session))
}

async fn run_monitor(
    config: RelayConfig,
    snapshot_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (transport, session) = start_session(&config).await?;
    let mut events = session.events();
    let mut connection = transport.state_receiver();
    let mut snapshots = snapshot_secs
        .filter(|secs| *secs > 0)
        .map(|secs| interval(Duration::from_secs(secs)));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(
        presence_topic = %config.topics.presence,
        "Monitoring device presence and channel status..."
    );

    loop {
        tokio::select! {
            reason = &mut shutdown => {
                info!("Received {}, shutting down gracefully...", reason?);
                break;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                println!("connection: {}", state.label());
                if let ConnectionState::PermanentlyDisconnected(reason) = state {
                    error!(reason = %reason, "MQTT connection permanently lost");
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&config, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = next_tick(&mut snapshots) => print_snapshot(&session).await?,
        }
    }

    print_snapshot(&session).await?;
    session.shutdown().await;
    transport.disconnect().await?;
    Ok(())
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_event(config: &RelayConfig, event: &SessionEvent) {
    match event {
        SessionEvent::Presence(transition) => match &transition.reason {
            Some(reason) => println!(
                "presence: {} -> {} ({})",
                transition.previous, transition.current, reason
            ),
            None => println!("presence: {} -> {}", transition.previous, transition.current),
        },
        SessionEvent::ChannelStatus {
            channel_id,
            previous,
            current,
        } => println!(
            "{}: {} -> {}",
            config.channel_name(channel_id),
            previous,
            current
        ),
        SessionEvent::CommandIssued {
            channel_id,
            command,
        } => println!("{}: command {}", config.channel_name(channel_id), command),
    }
}

async fn print_snapshot(session: &SessionHandle) -> Result<(), Box<dyn std::error::Error>> {
    match session.snapshot().await {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => warn!("Presence session already stopped; no snapshot"),
    }
    Ok(())
}

async fn run_command(
    config: RelayConfig,
    channel: String,
    command: RelayCommand,
    wait_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_channel_id(&channel)?;

    let (transport, session) = start_session(&config).await?;
    let deadline = Instant::now() + Duration::from_secs(wait_secs);

    let result = async {
        transport
            .wait_until_connected(deadline.saturating_duration_since(Instant::now()))
            .await?;
        session
            .wait_until_command_ready(&channel, deadline.saturating_duration_since(Instant::now()))
            .await?;
        session.issue_command(&channel, command).await?;
        Ok::<(), RelayError>(())
    }
    .await;

    session.shutdown().await;
    // Disconnect flushes the command before DISCONNECT is sent
    let disconnected = transport.disconnect().await;
    result?;
    disconnected?;

    info!(
        channel = %channel,
        name = %config.channel_name(&channel),
        command = %command,
        "Relay command sent"
    );
    Ok(())
}

async fn run_ping(
    config: RelayConfig,
    count: u32,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_secs(timeout_secs.max(1));
    let (transport, session) = start_session(&config).await?;

    let mut answered = 0;
    let mut pinged = async {
        transport.wait_until_connected(timeout).await?;
        let mut pacing = interval(Duration::from_secs(1));
        for _ in 0..count.max(1) {
            pacing.tick().await;
            match session.ping(timeout).await {
                Ok(report) => {
                    answered += 1;
                    println!("echo {}: {:.1} ms", report.id, report.latency_ms);
                }
                Err(e) => println!("ping failed: {e}"),
            }
        }
        Ok::<(), RelayError>(())
    }
    .await;

    if pinged.is_ok() && answered == 0 {
        pinged = Err(RelayError::Transport("no ping was echoed".to_string()));
    }

    session.shutdown().await;
    transport.disconnect().await?;
    pinged?;
    info!(answered, topic = %config.topics.ping, "Ping finished");
    Ok(())
}

async fn run_simulator(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let layout = config.layout();
    let presence_topic = layout.presence_topic().to_string();
    let case = config.topics.payload_case;

    let client_id = generate_client_id(&config.simulator.client_id_prefix);
    let last_will = LastWillSpec {
        topic: presence_topic.clone(),
        payload: OFFLINE_PAYLOAD.to_string(),
        retain: true,
    };
    let (transport, mut inbound) = MqttTransport::start(&client_id, &config.mqtt, Some(last_will))?;
    transport.subscribe(&layout.command_filter()).await?;
    transport.subscribe(layout.ping_topic()).await?;

    let mut relays: BTreeMap<String, RelayState> = config
        .channels
        .iter()
        .map(|channel| (channel.id.clone(), RelayState::Off))
        .collect();

    let mut connection = transport.state_receiver();
    let mut heartbeat = interval(config.presence.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(client_id = %client_id, channels = relays.len(), "Simulating relay controller");

    if connection.borrow_and_update().is_connected() {
        announce(&transport, &layout, &relays, case).await?;
    }

    loop {
        tokio::select! {
            reason = &mut shutdown => {
                info!("Received {}, shutting down gracefully...", reason?);
                break;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => announce(&transport, &layout, &relays, case).await?,
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(format!("MQTT connection permanently lost: {reason}").into());
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if transport.is_connected() {
                    transport
                        .publish(&presence_topic, config.simulator.heartbeat_payload.clone().into_bytes(), false)
                        .await?;
                    debug!("Heartbeat sent");
                }
            }
            message = inbound.recv() => match message {
                Some(message) if message.topic == layout.ping_topic() => {
                    // Echo verbatim; the sender matches replies by id
                    transport
                        .publish(&layout.ping_echo_topic(), message.payload.to_vec(), false)
                        .await?;
                    debug!(payload = %message.payload_str(), "Ping echoed");
                }
                Some(message) => {
                    if let Some((channel_id, state)) = apply_command(&layout, &mut relays, &message) {
                        publish_status(&transport, &layout, &channel_id, state, case).await?;
                    }
                }
                None => break,
            },
        }
    }

    // A clean disconnect suppresses the last will
    transport
        .publish(&presence_topic, OFFLINE_PAYLOAD.as_bytes().to_vec(), true)
        .await?;
    transport.disconnect().await?;
    Ok(())
}

/// Publish retained presence and every channel status after a ConnAck
async fn announce(
    transport: &MqttTransport,
    layout: &TopicLayout,
    relays: &BTreeMap<String, RelayState>,
    case: PayloadCase,
) -> Result<(), Box<dyn std::error::Error>> {
    transport
        .publish(layout.presence_topic(), ONLINE_PAYLOAD.as_bytes().to_vec(), true)
        .await?;
    for (channel_id, state) in relays {
        publish_status(transport, layout, channel_id, *state, case).await?;
    }
    info!(channels = relays.len(), "Announced presence and channel status");
    Ok(())
}

fn apply_command(
    layout: &TopicLayout,
    relays: &mut BTreeMap<String, RelayState>,
    message: &InboundMessage,
) -> Option<(String, RelayState)> {
    let channel_id = layout.channel_from_command_topic(&message.topic)?;
    let Some(command) = RelayCommand::parse_payload(&message.payload) else {
        warn!(
            topic = %message.topic,
            payload = %message.payload_str(),
            "Ignoring unrecognized command payload"
        );
        return None;
    };

    let state = command.target_state();
    relays.insert(channel_id.to_string(), state);
    info!(channel = %channel_id, state = %state, "Relay switched");
    Some((channel_id.to_string(), state))
}

async fn publish_status(
    transport: &MqttTransport,
    layout: &TopicLayout,
    channel_id: &str,
    state: RelayState,
    case: PayloadCase,
) -> Result<(), Box<dyn std::error::Error>> {
    let command = match state {
        RelayState::On => RelayCommand::On,
        RelayState::Off => RelayCommand::Off,
        RelayState::Unknown => return Ok(()),
    };
    transport
        .publish(
            &layout.status_topic(channel_id),
            command.payload(case).as_bytes().to_vec(),
            true,
        )
        .await?;
    Ok(())
}

fn handle_config_command(
    config: RelayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(
        presence_topic = %config.topics.presence,
        timeout_secs = config.presence.timeout_threshold().as_secs_f64(),
        channels = config.channels.len(),
        "Configuration validation complete"
    );
    Ok(())
}
