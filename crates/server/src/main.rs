#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::signal;

use shared::{log, sync::Trigger};

pub mod auth;
pub mod config;
pub mod consts;
pub mod registration;
pub mod server;
pub mod slot;

struct Cli {
    help: bool,
    version: bool,
    debug: bool,
    foreground: bool,
    config_path: String,
}

impl Cli {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut cli = Cli {
            help: false,
            version: false,
            debug: false,
            foreground: false,
            config_path: consts::DEFAULT_CONFIGFILE_PATH.to_string(),
        };
        let mut positional_seen = false;
        for arg in args {
            match arg.as_str() {
                "--help" => cli.help = true,
                "--version" => cli.version = true,
                "-d" => cli.debug = true,
                "-F" => cli.foreground = true,
                other if other.starts_with('-') => {
                    return Err(format!("unrecognized flag `{}`", other));
                }
                other => {
                    if positional_seen {
                        return Err("only one configuration path may be given".to_string());
                    }
                    cli.config_path = other.to_string();
                    positional_seen = true;
                }
            }
        }
        Ok(cli)
    }
}

fn print_usage() {
    println!("usage: elproxy [-F] [-d] [--help] [--version] [config-path]");
    println!();
    println!("  -F            run in the foreground (default; no daemonization is performed)");
    println!("  -d            enable debug logging");
    println!("  --help        print this message and exit");
    println!("  --version     print the version and exit");
    println!("  config-path   path to the configuration file (default: {})", consts::DEFAULT_CONFIGFILE_PATH);
}

/// Reads the configuration, opens the proxy server, and runs its accept
/// loop until a shutdown signal arrives or the listener fails.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let cli = match Cli::parse(&args[1..]) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("elproxy: {}", message);
            std::process::exit(-1);
        }
    };

    if cli.help {
        print_usage();
        return;
    }
    if cli.version {
        println!("elproxy {}", consts::VERSION);
        return;
    }

    let log_level = if cli.debug { "debug" } else { consts::DEFAULT_LOG_LEVEL };
    log::setup_logging(log_level, log::LogType::Proxy);

    let parsed = match config::ProxyConfig::from_file(&cli.config_path) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::error!("failed to load configuration from {}: {:?}", cli.config_path, e);
            std::process::exit(-1);
        }
    };
    config::set(parsed.clone());

    let proxy = match server::ProxyServer::open(&parsed).await {
        Ok(proxy) => proxy,
        Err(e) => {
            log::error!("failed to start proxy: {:?}", e);
            std::process::exit(-1);
        }
    };

    log::info!(
        "elproxy {} listening on {}, {} slot(s) configured",
        consts::VERSION,
        parsed.listen_sockaddr(),
        proxy.slot_count(),
    );

    let stop = Trigger::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut terminate = unix_signal(SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = signal::ctrl_c() => log::info!("received Ctrl-C, shutting down"),
                    _ = terminate.recv() => log::info!("received SIGTERM, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                signal::ctrl_c().await.expect("failed to listen for Ctrl-C");
                log::info!("received Ctrl-C, shutting down");
            }
            stop.trigger();
        });
    }

    loop {
        tokio::select! {
            _ = stop.wait_async() => {
                log::info!("shutdown requested, draining sessions");
                break;
            }
            result = proxy.process() => {
                if let Err(e) = result {
                    log::warn!("listener stopped: {}", e);
                    break;
                }
            }
        }
    }

    proxy.close().await;
    log::info!("elproxy stopped");
}
