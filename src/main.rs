use anyhow::Context;
use beowulf::config::{Config, ConfigOverrides};
use beowulf::domain::InMemoryRegistry;
use beowulf::infrastructure::media::RtpGateway;
use beowulf::infrastructure::protocols::sip::{
    ServiceSettings, SipServer, SipServerConfig, SipService,
};
use beowulf::interface::metrics::init_metrics;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stateful SIP proxy and registrar
#[derive(Parser, Debug)]
#[command(name = "beowulf", version, about)]
struct Args {
    /// IP of SIP Server (your public IP)
    #[arg(long)]
    unicast_address: Option<String>,

    /// Port to listen for SIP Traffic
    #[arg(long)]
    sip_port: Option<u16>,

    /// Destination for requests to users that are not registered
    #[arg(long)]
    proxy_dst: Option<String>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = ConfigOverrides {
        unicast_address: args.unicast_address,
        sip_port: args.sip_port,
        proxy_dst: args.proxy_dst,
    };
    let config =
        Config::load(args.config.as_deref(), &overrides).context("Failed to load configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Beowulf SIP proxy");

    if let Some(listen) = config.metrics_listen()? {
        init_metrics(listen).context("Failed to install metrics exporter")?;
    }

    let local_ip = match config.sip.unicast_address.as_str() {
        "" => discover_unicast_address()
            .await
            .context("Failed to discover unicast address, pass --unicast-address")?,
        address => address.parse::<IpAddr>().context("Invalid unicast address")?,
    };
    info!("Unicast address: {}", local_ip);

    let mut server = SipServer::bind(SipServerConfig {
        udp_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.sip.port),
        advertised_host: local_ip.to_string(),
        advertised_port: config.sip.port,
        timers: config.timers.sip_timers(),
    })
    .await
    .context("Failed to start SIP transport")?;

    let media = Arc::new(RtpGateway::new(
        config.media_bind_address()?,
        config.media.track_capacity,
    ));
    let service = Arc::new(SipService::new(
        Arc::new(InMemoryRegistry::new()),
        server.endpoint(),
        media,
        ServiceSettings {
            local_ip: local_ip.to_string(),
            sip_port: config.sip.port,
            user_agent: config.sip.user_agent.clone(),
            invite_mode: config.sip.invite_mode,
            fallback_destination: config.sip.fallback_destination.clone(),
            max_concurrent_exchanges: config.relay.max_concurrent_exchanges,
        },
    ));

    let message_loop = server.start(service)?;
    info!(
        invite_mode = ?config.sip.invite_mode,
        "Beowulf listening on {}",
        server.local_addr()
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
        _ = message_loop => warn!("SIP message loop ended"),
    }

    Ok(())
}

/// First non-loopback IPv4 address, as picked by the routing table.
///
/// Connecting a UDP socket sends nothing; it only selects the outgoing interface.
async fn discover_unicast_address() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 5060)).await?;
    let address = socket.local_addr()?.ip();

    if address.is_loopback() || address.is_unspecified() {
        anyhow::bail!("no non-loopback IPv4 interface");
    }
    Ok(address)
}
