use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleetgate::broker::Broker;
use fleetgate::devices::DeviceRegistry;
use fleetgate::handler::{offline_command, Services};
use fleetgate::pipe::HttpPipe;
use fleetgate::protocols::{autolink, galileo, globalsat, naviset, teltonika, SessionProtocol};
use fleetgate::server::run_server;
use fleetgate::settings::{ProtocolKind, Settings};
use fleetgate::spool::Spool;

fn init_tracing(logs: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleetgate=debug,info"));
    if logs == "stdout" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs)
            .unwrap_or_else(|e| {
                eprintln!("cannot open log file {logs}: {e}");
                std::process::exit(1);
            });
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init();
    }
}

async fn run_gateway<P>(protocol: P, services: Arc<Services>) -> fleetgate::error::Result<()>
where
    P: SessionProtocol,
{
    let protocol = Arc::new(protocol);

    // per-protocol AMQP command listener, independent of the ingress path
    {
        let protocol = protocol.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let broker = services.broker.clone();
            broker
                .run_command_listener(protocol.alias(), |command| {
                    let protocol = protocol.clone();
                    let services = services.clone();
                    async move { offline_command(protocol.as_ref(), &services, command).await }
                })
                .await;
        });
    }

    run_server(protocol, services).await
}

#[tokio::main]
async fn main() {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    init_tracing(&settings.logs);
    info!(
        protocol = ?settings.protocol,
        port = settings.port,
        environment = %settings.environment,
        "fleetgate starting"
    );

    let services = Arc::new(Services {
        broker: Arc::new(Broker::new(&settings.amqp_url, &settings.environment)),
        devices: Arc::new(DeviceRegistry::new()),
        pipe: Arc::new(HttpPipe::new(&settings.pipe_set_url, &settings.pipe_finish_url)),
        spool: Spool::new(&settings.spool_dir),
        public_host: settings.public_host.clone(),
        listen_port: settings.port,
        socket_timeout: settings.socket_timeout,
        socket_packet_length: settings.socket_packet_length,
    });

    let result = match settings.protocol {
        ProtocolKind::Autolink => run_gateway(autolink::Autolink, services).await,
        ProtocolKind::Galileo => run_gateway(galileo::Galileo, services).await,
        ProtocolKind::GlobalsatTr151 => run_gateway(globalsat::Tr151::default(), services).await,
        ProtocolKind::Naviset => run_gateway(naviset::Naviset, services).await,
        ProtocolKind::Teltonika => run_gateway(teltonika::Teltonika, services).await,
    };
    if let Err(e) = result {
        error!(error = %e, "gateway stopped");
        std::process::exit(1);
    }
}
