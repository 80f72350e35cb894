use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ssl_termination_proxy::controller::{
    self, AppliedStateStore, CertificateBundle, Collaborators, ControllerState, Reconciler,
    SiteConfig, StatusBoard,
};
use ssl_termination_proxy::proxy::{
    render_site, HtpasswdStore, NginxConfigurer, SelfSignedAuthority,
};
use ssl_termination_proxy::relation::{
    parse_relation_file, ChannelEventSource, DirectoryEventSource, EventSource,
};
use ssl_termination_proxy::ProxyConfig;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, env = "SSL_PROXY_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Print the site configuration a relation file would produce
    Render(RenderArgs),
    /// Print the persisted applied state
    Status(ConfigArgs),
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, short, env = "SSL_PROXY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "SSL_PROXY_STATE_FILE")]
    state_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: ConfigArgs,

    #[arg(long, env = "SSL_PROXY_SITES_DIR")]
    sites_dir: Option<PathBuf>,

    #[arg(long, env = "SSL_PROXY_HTPASSWD_DIR")]
    htpasswd_dir: Option<PathBuf>,

    #[arg(long, env = "SSL_PROXY_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Directory of relation files to watch
    #[arg(long, env = "SSL_PROXY_RELATIONS_DIR")]
    relations_dir: Option<PathBuf>,

    /// Periodic resync in seconds; 0 disables it
    #[arg(long, env = "SSL_PROXY_RESYNC_INTERVAL_SECS")]
    resync_interval_secs: Option<u64>,

    /// REST API listen address
    #[arg(long, env = "SSL_PROXY_LISTEN")]
    listen: Option<String>,

    /// Do not start the REST API
    #[arg(long, env = "SSL_PROXY_NO_API")]
    no_api: bool,
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Relation file (YAML or JSON)
    relation_file: PathBuf,

    /// TOML configuration file
    #[arg(long, short, env = "SSL_PROXY_CONFIG")]
    config: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = ProxyConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(state_file) = &self.state_file {
            config.state_file = state_file.clone();
        }
        Ok(config)
    }
}

impl RunArgs {
    fn resolve_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = self.common.load()?;
        if let Some(dir) = &self.sites_dir {
            config.sites_dir = dir.clone();
        }
        if let Some(dir) = &self.htpasswd_dir {
            config.htpasswd_dir = dir.clone();
        }
        if let Some(dir) = &self.cert_dir {
            config.cert_dir = dir.clone();
        }
        if let Some(dir) = &self.relations_dir {
            config.relations_dir = Some(dir.clone());
        }
        if let Some(secs) = self.resync_interval_secs {
            config.resync_interval_secs = secs;
        }
        if let Some(listen) = &self.listen {
            config.api.listen = listen.clone();
        }
        if self.no_api {
            config.api.enabled = false;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("ssl-termination-proxy v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Render(render_args) => run_render(render_args),
        Commands::Status(status_args) => run_status(status_args),
        Commands::Run(run_args) => {
            init_tracing(args.log_json);
            run_proxy(run_args).await
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn run_render(args: RenderArgs) -> anyhow::Result<()> {
    let config = ProxyConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let content = std::fs::read_to_string(&args.relation_file)
        .with_context(|| format!("failed to read {}", args.relation_file.display()))?;
    let requirement = parse_relation_file(&args.relation_file, &content)
        .with_context(|| format!("invalid relation file {}", args.relation_file.display()))?;

    // Paths only; nothing is issued
    let authority = SelfSignedAuthority::new(&config.cert_dir, config.certificate.validity_days);
    let primary = requirement
        .hostnames
        .iter()
        .next()
        .context("relation declares no hostnames")?;
    let live = authority.live_dir(primary);
    let certificate = CertificateBundle {
        private_key: live.join("privkey.pem"),
        full_chain: live.join("fullchain.pem"),
        dh_params: authority.dh_params_path(),
        fingerprint: String::new(),
        not_after: None,
    };

    let site = SiteConfig {
        service: &requirement.service_name,
        backend_addresses: &requirement.backend_addresses,
        load_balancing: requirement.load_balancing,
        hostnames: &requirement.hostnames,
        certificate: &certificate,
        auth_enabled: requirement.auth_enabled(),
    };
    let htpasswd = config.htpasswd_dir.join(&requirement.service_name);
    print!("{}", render_site(&site, &htpasswd));
    Ok(())
}

fn run_status(args: ConfigArgs) -> anyhow::Result<()> {
    let config = args.load()?;
    let store = AppliedStateStore::load(&config.state_file)
        .with_context(|| format!("failed to read {}", config.state_file.display()))?;
    println!("{}", serde_json::to_string_pretty(store.state())?);
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

async fn run_proxy(args: RunArgs) -> anyhow::Result<()> {
    let config = args.resolve_config()?;

    info!(
        "Starting ssl-termination-proxy v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        sites_dir = %config.sites_dir.display(),
        cert_dir = %config.cert_dir.display(),
        state_file = %config.state_file.display(),
        "Configuration loaded"
    );

    ensure_parent(&config.state_file)?;
    let applied = AppliedStateStore::load(&config.state_file)
        .with_context(|| format!("failed to load {}", config.state_file.display()))?;

    let board = Arc::new(StatusBoard::new());
    let collaborators = Collaborators {
        authority: Arc::new(SelfSignedAuthority::new(
            &config.cert_dir,
            config.certificate.validity_days,
        )),
        credentials: Arc::new(HtpasswdStore::new(&config.htpasswd_dir)),
        proxy: Arc::new(
            NginxConfigurer::new(&config.sites_dir, &config.htpasswd_dir)
                .with_validate_command(config.nginx.validate_command.clone())
                .with_reload_command(config.nginx.reload_command.clone()),
        ),
        status: board.clone(),
    };
    let reconciler = Reconciler::new(applied, collaborators, config.reconciler_options());
    let state = Arc::new(ControllerState::new(reconciler, board));

    let (tx, events) = ChannelEventSource::channel(64);

    if let Some(dir) = &config.relations_dir {
        info!("Watching relation files in {}", dir.display());
        let mut source = DirectoryEventSource::new(dir, config.relations_poll_interval());
        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = source.next_event().await {
                if forward.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(feature = "rest-api")]
    {
        if config.api.enabled {
            let addr = config.listen_addr()?;
            let api_state =
                ssl_termination_proxy::rest_api::ApiState::new(state.clone(), tx.clone());
            tokio::spawn(async move {
                if let Err(e) = ssl_termination_proxy::rest_api::run_server(api_state, addr).await
                {
                    tracing::error!("REST API server error: {:?}", e);
                }
            });
        }
    }

    if config.relations_dir.is_none() && !config.api.enabled {
        warn!("Neither a relations directory nor the REST API is configured; no relation can be added");
    }

    // Held so the loop keeps running when no producer is configured
    let _keep_open = tx;
    controller::run_controller(state, events, config.resync_interval())
        .await
        .context("controller loop failed")?;

    info!("Controller stopped");
    Ok(())
}
