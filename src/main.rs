use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use egress_dns::dialer::MarkedDialer;
use egress_dns::error::ConfigError;
use egress_dns::iptables::{self, SystemCommandRunner};
use egress_dns::proxy::{DEFAULT_PORT, Proxy, ProxyConfig, shutdown_signal};
use egress_dns::resolv::{self, FALLBACK_UPSTREAM};

#[derive(Parser)]
#[command(name = "egress-dns")]
#[command(about = "Transparent DNS egress interception for sandbox namespaces", long_about = None)]
struct Args {
    /// Local port to listen on (and redirect DNS to)
    #[arg(short, long, env = "EGRESS_DNS_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, env = "EGRESS_DNS_BIND", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Upstream DNS server (ip or ip:port), repeatable; tried in order
    #[arg(short, long, env = "EGRESS_DNS_UPSTREAM", value_delimiter = ',')]
    upstream: Vec<String>,

    /// resolv.conf to take upstreams from when --upstream is not given
    #[arg(long, env = "EGRESS_DNS_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "EGRESS_DNS_DIAL_TIMEOUT_MS", default_value_t = 5000)]
    dial_timeout_ms: u64,

    /// Upstream round-trip timeout in milliseconds
    #[arg(long, env = "EGRESS_DNS_QUERY_TIMEOUT_MS", default_value_t = 5000)]
    query_timeout_ms: u64,

    /// Idle timeout for client TCP connections in milliseconds
    #[arg(long, env = "EGRESS_DNS_IDLE_TIMEOUT_MS", default_value_t = 10000)]
    idle_timeout_ms: u64,

    /// Drop failed queries instead of answering SERVFAIL
    #[arg(long)]
    no_servfail: bool,

    /// Maximum concurrently relayed UDP queries
    #[arg(long, env = "EGRESS_DNS_MAX_INFLIGHT", default_value_t = 1024)]
    max_inflight: usize,

    /// Seconds between stats lines, 0 to disable
    #[arg(long, env = "EGRESS_DNS_STATS_INTERVAL_SECS", default_value_t = 60)]
    stats_interval_secs: u64,

    /// Install the iptables DNS redirect to the listening port once bound
    #[arg(long)]
    install_redirect: bool,

    /// Do not mark upstream sockets (upstream DNS will be redirected too)
    #[arg(long)]
    no_mark: bool,

    /// Log every forwarded query
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn upstreams(args: &Args) -> Result<Vec<SocketAddr>, ConfigError> {
    if !args.upstream.is_empty() {
        return args.upstream.iter().map(|s| resolv::parse_upstream(s)).collect();
    }

    let from_file = match resolv::upstreams_from_resolv_conf(&args.resolv_conf) {
        Ok(upstreams) => upstreams,
        Err(e) => {
            warn!("{}", e);
            Vec::new()
        }
    };

    if from_file.is_empty() {
        warn!(
            "no usable nameserver in {}, falling back to {}",
            args.resolv_conf.display(),
            FALLBACK_UPSTREAM
        );
        return Ok(vec![FALLBACK_UPSTREAM]);
    }

    Ok(from_file)
}

fn config(args: &Args) -> Result<ProxyConfig, ConfigError> {
    let mut config = ProxyConfig::new(SocketAddr::new(args.bind, args.port), upstreams(args)?);
    config.dial_timeout = Duration::from_millis(args.dial_timeout_ms);
    config.query_timeout = Duration::from_millis(args.query_timeout_ms);
    config.idle_timeout = Duration::from_millis(args.idle_timeout_ms);
    config.servfail = !args.no_servfail;
    config.max_inflight = args.max_inflight;
    config.mark = !args.no_mark;
    config.stats_interval =
        (args.stats_interval_secs > 0).then(|| Duration::from_secs(args.stats_interval_secs));
    config.verbose = args.verbose;

    Ok(config)
}

/// Bind, optionally install the redirect to the bound port, then serve.
async fn serve(config: ProxyConfig, dialer: MarkedDialer, install_redirect: bool) -> ExitCode {
    let proxy = match Proxy::bind_with_dialer(config, dialer).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("failed to bind DNS proxy: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Listeners are up before any traffic is redirected to them.
    if install_redirect {
        let runner = SystemCommandRunner;
        if let Err(e) = iptables::install_redirect(&runner, proxy.local_addr().port()) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
        match iptables::list_output_rules(&runner) {
            Ok(rules) => {
                for rule in rules {
                    debug!("nat OUTPUT: {}", rule);
                }
            }
            Err(e) => warn!("could not list nat OUTPUT chain: {}", e),
        }
    }

    match proxy.serve(shutdown_signal()).await {
        Ok(()) => {
            info!("DNS proxy stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("DNS proxy failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let dialer = config.dialer();
    if let Err(e) = dialer.probe() {
        error!("cannot mark upstream sockets (CAP_NET_ADMIN required, or pass --no-mark): {}", e);
        return ExitCode::FAILURE;
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(serve(config, dialer, args.install_redirect))
}
