use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_porthole::expect::CancelToken;
use vpn_porthole::{Config, Ipv4Subnet, Session, SessionError};

#[derive(Parser)]
#[command(name = "vpnp")]
#[command(about = "Splice a containerised VPN into your host network")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: ~/.config/vpn-porthole/settings.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the container image for a session
    Build {
        /// Session name or "all"
        session: String,
    },
    /// Start the VPN container and splice in its routes and domains
    Start {
        /// Session name or "all"
        session: String,
    },
    /// Unsplice and stop the VPN container
    Stop {
        /// Session name or "all"
        session: String,
    },
    /// Show whether the session's container is running
    Status {
        /// Session name or "all"
        session: String,
    },
    /// Stop and start a running session
    Restart {
        /// Session name or "all"
        session: String,
    },
    /// Route a subnet through the session, e.g. 10.1.2.0/24
    AddRoute {
        /// Session name or "all"
        session: String,
        subnet: Ipv4Subnet,
    },
    /// Remove routes within a subnet from the session
    DelRoute {
        /// Session name or "all"
        session: String,
        subnet: Ipv4Subnet,
    },
    /// Delegate a DNS domain to the session, e.g. example.com
    AddDomain {
        /// Session name or "all"
        session: String,
        domain: String,
    },
    /// Remove a DNS domain delegation from the session
    DelDomain {
        /// Session name or "all"
        session: String,
        domain: String,
    },
    /// Show images, container, routes and domains of a session
    Info {
        /// Session name or "all"
        session: String,
    },
    /// Open a shell in the session's container
    Shell {
        /// Session name
        session: String,
    },
    /// Stop the session and remove its containers and images
    Rm {
        /// Session name or "all"
        session: String,
    },
    /// Run the health hook in the session's container
    Health {
        /// Session name or "all"
        session: String,
    },
    /// Run the refresh hook in the session's container
    Refresh {
        /// Session name or "all"
        session: String,
    },
    /// Write an example settings file
    Init,
}

/// What to do with each selected session
enum Action {
    Build,
    Start,
    Stop,
    Status,
    Restart,
    AddRoute(Ipv4Subnet),
    DelRoute(Ipv4Subnet),
    AddDomain(String),
    DelDomain(String),
    Info,
    Shell,
    Purge,
    Health,
    Refresh,
}

impl Commands {
    fn into_action(self) -> Option<(String, Action)> {
        Some(match self {
            Commands::Build { session } => (session, Action::Build),
            Commands::Start { session } => (session, Action::Start),
            Commands::Stop { session } => (session, Action::Stop),
            Commands::Status { session } => (session, Action::Status),
            Commands::Restart { session } => (session, Action::Restart),
            Commands::AddRoute { session, subnet } => (session, Action::AddRoute(subnet)),
            Commands::DelRoute { session, subnet } => (session, Action::DelRoute(subnet)),
            Commands::AddDomain { session, domain } => (session, Action::AddDomain(domain)),
            Commands::DelDomain { session, domain } => (session, Action::DelDomain(domain)),
            Commands::Info { session } => (session, Action::Info),
            Commands::Shell { session } => (session, Action::Shell),
            Commands::Rm { session } => (session, Action::Purge),
            Commands::Health { session } => (session, Action::Health),
            Commands::Refresh { session } => (session, Action::Refresh),
            Commands::Init => return None,
        })
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let path = cli.config.unwrap_or_else(Config::default_path);

    let Some((target, action)) = cli.command.into_action() else {
        return match Config::write_example(&path) {
            Ok(()) => {
                println!("Created example settings: {}", path.display());
                0
            }
            Err(e) => {
                error!("{}", e);
                3
            }
        };
    };

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}: {}", path.display(), e);
            return 3;
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let handler = ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                // Second Ctrl-C: give up without cleanup
                std::process::exit(130);
            }
            cancel.cancel();
        });
        if let Err(e) = handler {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }
    }

    let names = if target == "all" {
        config.session_names()
    } else {
        vec![target]
    };

    let mut exit_code = 0;
    for name in names {
        let code = match Session::open(&config, &name, cancel.clone()) {
            Ok(mut session) => perform(&mut session, &action),
            Err(e) => {
                error!("{}: {}", name, e);
                e.exit_code()
            }
        };
        if code != 0 {
            exit_code = code;
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    exit_code
}

fn perform(session: &mut Session, action: &Action) -> i32 {
    let result = match action {
        Action::Build => session.build().map(|()| 0),
        Action::Start => session.start().map(|()| 0),
        Action::Stop => session.stop().map(|()| 0),
        Action::Restart => session.restart().map(|()| 0),
        Action::AddRoute(subnet) => session.add_route(subnet).map(|()| 0),
        Action::DelRoute(subnet) => session.del_route(subnet).map(|()| 0),
        Action::AddDomain(domain) => session.add_domain(domain).map(|()| 0),
        Action::DelDomain(domain) => session.del_domain(domain).map(|()| 0),
        Action::Purge => session.purge().map(|()| 0),
        Action::Shell => session.shell(),
        Action::Health => session.health(),
        Action::Refresh => session.refresh(),
        Action::Status => session.status().and_then(|running| {
            let username = session.username()?;
            let settings = session.settings();
            println!(
                "{} {} {}@{}",
                if running { "RUNNING" } else { "STOPPED" },
                settings.name,
                username,
                settings.vpn
            );
            Ok(if running { 0 } else { 1 })
        }),
        Action::Info => session.info().map(|report| {
            print!("{}", report);
            0
        }),
    };

    match result {
        Ok(code) => {
            if code != 0 {
                info!("{} exited with {}", session.tag(), code);
            }
            code
        }
        Err(e) => report(session, e),
    }
}

fn report(session: &Session, e: SessionError) -> i32 {
    error!("{}: {}", session.tag(), e);
    e.exit_code()
}
