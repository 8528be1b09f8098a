use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use ndt_client::client::{Client, SharedObserver};
use ndt_client::emitter::{JsonObserver, LogObserver};
use ndt_client::settings::{MlabnsPolicy, NettestFlags, ProtocolFlags, Settings, Verbosity};

#[derive(Clone, Debug, clap::ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum Policy {
    Closest,
    Random,
    GeoOptions,
}

#[derive(Parser, Debug)]
#[command(version, about = "NDT v3.7 network diagnostic client")]
struct Cli {
    /// NDT server hostname. Bypasses mlab-ns discovery.
    #[arg(long)]
    server: Option<String>,
    /// Control port (defaults to 3001, or 3010 with TLS).
    #[arg(long)]
    port: Option<String>,
    /// Skip the download (S2C) subtest.
    #[arg(long)]
    no_download: bool,
    /// Run the upload (C2S) subtest.
    #[arg(long)]
    upload: bool,
    /// Send client metadata through the META subtest.
    #[arg(long)]
    meta: bool,
    /// Use JSON control messages.
    #[arg(long)]
    json: bool,
    /// Use TLS for the control and measurement connections.
    #[arg(long)]
    tls: bool,
    /// Use WebSocket framing (implies --json).
    #[arg(long)]
    websocket: bool,
    /// Do not verify the TLS peer certificate.
    #[arg(long)]
    insecure: bool,
    /// CA bundle used to verify TLS peers.
    #[arg(long)]
    ca_bundle: Option<String>,
    /// Tunnel all traffic through a SOCKS5h proxy on 127.0.0.1:<port>.
    #[arg(long)]
    socks5h_port: Option<String>,
    /// Per-operation I/O timeout, in seconds.
    #[arg(long, default_value_t = 7)]
    timeout: u64,
    /// Maximum runtime of each subtest, in seconds.
    #[arg(long, default_value_t = 14)]
    max_runtime: u64,
    /// mlab-ns base URL, without a trailing slash.
    #[arg(long, default_value = "https://mlab-ns.appspot.com")]
    mlabns_url: String,
    /// mlab-ns server-selection policy.
    #[arg(long, value_enum, default_value_t = Policy::GeoOptions)]
    policy: Policy,
    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Human)]
    format: Format,
    /// Increase verbosity; repeat for debug output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit warnings only.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let mut settings = Settings::default();
    if let Some(server) = cli.server {
        settings.hostname = server;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let mut tests = NettestFlags::default();
    if !cli.no_download {
        tests |= NettestFlags::DOWNLOAD;
    }
    if cli.upload {
        tests |= NettestFlags::UPLOAD;
    }
    if cli.meta {
        tests |= NettestFlags::META;
    }
    if tests == NettestFlags::default() {
        eprintln!("ndt_client: nothing to do");
        return std::process::ExitCode::FAILURE;
    }
    settings.nettest_flags = tests;

    if cli.json {
        settings.protocol_flags |= ProtocolFlags::JSON;
    }
    if cli.tls {
        settings.protocol_flags |= ProtocolFlags::TLS;
    }
    if cli.websocket {
        settings.protocol_flags |= ProtocolFlags::WEBSOCKET | ProtocolFlags::JSON;
    }
    settings.tls_verify_peer = !cli.insecure;
    if let Some(path) = cli.ca_bundle {
        settings.ca_bundle_path = path;
    }
    if let Some(port) = cli.socks5h_port {
        settings.socks5h_port = port;
    }
    settings.timeout = Duration::from_secs(cli.timeout);
    settings.max_runtime = Duration::from_secs(cli.max_runtime);
    settings.mlabns_base_url = cli.mlabns_url;
    settings.mlabns_policy = match cli.policy {
        Policy::Closest => MlabnsPolicy::Closest,
        Policy::Random => MlabnsPolicy::Random,
        Policy::GeoOptions => MlabnsPolicy::GeoOptions,
    };
    settings.verbosity = if cli.quiet {
        Verbosity::Warning
    } else if cli.verbose == 0 {
        Verbosity::Info
    } else {
        Verbosity::Debug
    };

    let observer: SharedObserver = match cli.format {
        Format::Human => Arc::new(Mutex::new(LogObserver::stderr())),
        Format::Json => Arc::new(Mutex::new(JsonObserver::stdout())),
    };

    let client = Client::with_observer(settings, observer);
    match client.run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ndt_client: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
