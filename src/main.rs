//! Simurgh - cluster membership and service discovery runtime
//!
//! Runs a membership node, a registrar, or one-shot DNS queries
//! against a running overlay.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use simurgh::dns::client::{DnsClient, OverlayContext};
use simurgh::dns::nameservers::NsAddr;
use simurgh::{
    EnvelopeCodec, Monitor, Registrar, RecordType, SimurghConfig, SnowflakeGenerator,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "simurgh")]
#[command(author = "Sina Rabbani")]
#[command(version = VERSION)]
#[command(about = "Cluster membership and DNS service discovery runtime", long_about = None)]
struct Cli {
    /// Configuration file path (falls back to environment variables)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a membership node
    Node {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Base port (UDP; TCP binds base+1)
        #[arg(short, long, default_value = "7000")]
        port: u16,

        /// Worker pairs to run (each takes two consecutive ports)
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// Seed node to join, as host:port
        #[arg(short, long)]
        join: Option<String>,
    },

    /// Run a registrar node (membership + DNS overlay)
    Registrar {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Base port (DNS serves on base+2/base+3)
        #[arg(short, long, default_value = "7000")]
        port: u16,

        /// Service name to advertise under
        #[arg(short, long, default_value = "simurgh")]
        service: String,

        /// Zone the registrar is authoritative for
        #[arg(short, long, default_value = "cluster.local")]
        zone: String,

        /// Peer registrar to register with, as host:port
        #[arg(short, long)]
        join: Option<String>,
    },

    /// Query a registrar's DNS overlay
    Resolve {
        /// Name to resolve
        name: String,

        /// Record type
        #[arg(short, long, default_value = "A")]
        record_type: String,

        /// Registrar DNS address, as host:port (the base port + 2)
        #[arg(short, long, default_value = "127.0.0.1:7002")]
        server: String,

        /// Query over TCP instead of UDP
        #[arg(long)]
        tcp: bool,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<SimurghConfig> {
    let config = match path {
        Some(path) => SimurghConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SimurghConfig::from_env().context("failed to load config from environment")?,
    };

    config
        .validate()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;

    Ok(config)
}

fn parse_addr(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {value}"))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("bad port in {value}"))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("simurgh {VERSION}");

    match cli.command {
        Commands::Node {
            host,
            port,
            workers,
            join,
        } => {
            let config = load_config(cli.config.as_ref())?;

            let monitor = Monitor::new(&host, port, workers, &config);
            monitor.start().await?;

            match join {
                Some(seed) => {
                    let seed = parse_addr(&seed)?;
                    monitor.register(&seed).await?;
                }
                None => {
                    monitor.start_standalone();
                    info!("running as cluster seed on {host}:{port}");
                }
            }

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            monitor.shutdown().await;
        }

        Commands::Registrar {
            host,
            port,
            service,
            zone,
            join,
        } => {
            let config = load_config(cli.config.as_ref())?;

            let registrar = Registrar::new(&host, port, &service, &zone, &config)
                .map_err(|err| anyhow::anyhow!("registrar setup failed: {err}"))?;
            registrar.start().await?;

            if let Some(seed) = join {
                let seed = parse_addr(&seed)?;
                let nameservers = registrar.register_with(&seed).await?;
                info!("registered; {} nameserver(s) known", nameservers.len());
            }

            let (dns_udp, dns_tcp) = registrar.dns_ports();
            info!("dns overlay on {host}:{dns_udp} (udp) / {host}:{dns_tcp} (tcp)");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            registrar.close().await;
        }

        Commands::Resolve {
            name,
            record_type,
            server,
            tcp,
        } => {
            let config = load_config(cli.config.as_ref())?;

            let rtype = RecordType::from_name(&record_type)
                .with_context(|| format!("unknown record type {record_type}"))?;

            let (host, port) = parse_addr(&server)?;
            let scheme = if tcp { "tcp" } else { "udp" };
            let addr = NsAddr::parse(&format!("{scheme}://{host}:{port}"))
                .map_err(|err| anyhow::anyhow!("bad server address: {err}"))?;

            let client =
                DnsClient::new(config.dns.request_timeout).with_overlay(OverlayContext {
                    codec: Arc::new(EnvelopeCodec::new(&config.auth_secret)),
                    id_gen: Arc::new(SnowflakeGenerator::new(1)),
                    host: "0.0.0.0".to_string(),
                    port: 0,
                });

            let response = client
                .query(&name, rtype, &addr)
                .await
                .map_err(|err| anyhow::anyhow!("query failed: {err}"))?;

            if response.answers.is_empty() {
                println!("no answer (rcode {})", response.rcode);
            }

            for record in &response.answers {
                println!(
                    "{}\t{}\t{}\t{:?}",
                    record.name,
                    record.ttl,
                    record.rtype.name(),
                    record.data
                );
            }
        }
    }

    Ok(())
}
