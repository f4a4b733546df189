use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use multihome::{
    config, Address, Endpoint, LogDispatcher, MultiEndpoint, NullTransferEngine,
};
use std::sync::Arc;
use tokio::signal;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(
    name = "multihomed",
    about = "Multi-homed UDP transport daemon",
    long_about = "Binds one UDP endpoint per configured port and keeps the \
        peer bookkeeping, NAT puncturing and path selection running.\n\n\
        Examples:\n  \
          # Bind two sockets on fixed ports\n  \
          multihomed --port 14000 --port 14001\n\n  \
          # One OS-assigned port, verbose logging\n  \
          multihomed --log-level debug"
)]
struct Args {
    /// UDP port to bind; repeat for one endpoint per port
    #[arg(short, long)]
    port: Vec<u16>,

    /// Path to config file
    #[arg(long, short = 'C')]
    config: Option<std::path::PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> config::Config {
    if let Some(path) = &args.config {
        config::Config::load(path).unwrap_or_else(|e| {
            warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path, e
            );
            config::Config::default()
        })
    } else {
        config::Config::load_or_default()
    }
}

fn init_logging(args: &Args, config: &config::Config) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    env_logger::Builder::from_default_env()
        .parse_filters(&level)
        .init();
}

fn spawn_receive_loop(transport: Arc<MultiEndpoint>, local: Address) {
    let Some(socket) = transport.socket_of(&local) else {
        warn!("no socket for endpoint {}, receive loop not started", local);
        return;
    };
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    transport.process_datagram(&local, source, &buf[..len]).await;
                }
                Err(e) => {
                    warn!("receive on {} failed: {}", local, e);
                    transport.report_socket_error(&local, e.raw_os_error().unwrap_or(-1));
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&args, &config);

    let ports = if args.port.is_empty() {
        config.daemon.ports.clone()
    } else {
        args.port.clone()
    };
    info!("starting multihomed with {} endpoint(s)", ports.len());

    let transport = Arc::new(MultiEndpoint::new(
        Arc::new(NullTransferEngine),
        Arc::new(LogDispatcher),
        config.timing.clone(),
    ));

    for port in ports {
        let endpoint = Endpoint::bind(Address::parse(&format!("0.0.0.0:{}", port))).await?;
        let local = endpoint.address.clone();
        transport.add_endpoint(endpoint);
        spawn_receive_loop(transport.clone(), local);
    }

    let maintenance = {
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut ticker = interval(transport.maintenance_interval());
            loop {
                ticker.tick().await;
                transport.run_maintenance_once().await;
                for (addr, kind) in transport.endpoint_status() {
                    log::debug!("endpoint {} connection type {}", addr, kind);
                }
            }
        })
    };

    signal::ctrl_c().await?;
    info!("shutting down");
    maintenance.abort();
    for addr in transport.local_addresses() {
        transport.remove_endpoint(&addr);
    }
    Ok(())
}
