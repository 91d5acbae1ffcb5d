use clap::Parser;
use cmux_connect_proxy::config::DEFAULT_LISTEN_PORT;
use cmux_connect_proxy::{spawn_proxy, ProxyConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A proxy that blocks all requests except CONNECT tunnels to the target host"
)]
struct Args {
    /// The port to listen on
    #[arg(short = 'l', long, env = "CMUX_CONNECT_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,
    /// The host to proxy to (host:port, port defaults to 443)
    #[arg(short = 't', long, env = "CMUX_CONNECT_TARGET")]
    target: String,
    /// The IP to dial instead of resolving the target host
    #[arg(short = 'i', long, env = "CMUX_CONNECT_TARGET_IP")]
    target_ip: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .compact()
        .init();

    let config = match ProxyConfig::on_port(args.port, &args.target, args.target_ip.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid proxy configuration");
            std::process::exit(1);
        }
    };
    let target = config.target().to_string();
    let target_ip = config.target_ip();

    let (bound_addr, handle) = match spawn_proxy(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested, no longer accepting connections");
    }) {
        Ok(res) => res,
        Err(err) => {
            error!(error = %err, "failed to start proxy");
            std::process::exit(1);
        }
    };

    info!(listen = %bound_addr, %target, ?target_ip, "CONNECT proxy ready");

    if let Err(err) = handle.await {
        error!(error = %err, "proxy task exited unexpectedly");
        std::process::exit(1);
    }
}
