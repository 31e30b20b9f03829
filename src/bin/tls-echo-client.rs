use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use secure_tcp_server::config::{
    load_config, ClientTlsConfig, InvalidCertificatePolicy, ObservabilityConfig,
};
use secure_tcp_server::observability::logging;
use secure_tcp_server::ClientTlsContext;

#[derive(Parser)]
#[command(name = "tls-echo-client")]
#[command(about = "Connect to a secure echo server and report session reuse", long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9443")]
    addr: SocketAddr,

    /// Configuration file; only its [client_tls] and [observability] sections are used
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CA certificate (PEM) to trust
    #[arg(long)]
    ca: Option<String>,

    /// Name to verify the server certificate against
    #[arg(long)]
    server_name: Option<String>,

    /// Accept certificates that fail validation
    #[arg(long)]
    accept_invalid: bool,

    /// Number of sequential connections
    #[arg(short = 'n', long, default_value_t = 2)]
    connections: usize,

    /// Message to send on each connection
    #[arg(short, long, default_value = "hello")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let (mut tls, observability) = match &cli.config {
        Some(path) => {
            let config = load_config(path)?;
            (config.client_tls, config.observability)
        }
        None => (ClientTlsConfig::default(), ObservabilityConfig::default()),
    };
    if let Some(ca) = cli.ca {
        tls.ca_path = Some(ca);
    }
    if let Some(server_name) = cli.server_name {
        tls.server_name = server_name;
    }
    if cli.accept_invalid {
        tls.invalid_certificate_handler = InvalidCertificatePolicy::Accept;
    }

    logging::init_logging(&observability);
    let context = ClientTlsContext::from_config(&tls)?;

    for attempt in 1..=cli.connections {
        let mut stream = context.connect(cli.addr).await?;
        stream.send(cli.message.as_bytes()).await?;

        let mut echoed = vec![0u8; cli.message.len()];
        stream.receive_exact(&mut echoed).await?;
        println!(
            "#{attempt} {:?} reused={} echo={}",
            stream.protocol_version(),
            stream.session_was_reused(),
            String::from_utf8_lossy(&echoed)
        );
        stream.close().await?;
    }
    Ok(())
}
