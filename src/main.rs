use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use sandgate::{
    adapters::{
        AdminState, GatewayHandler, HttpClientAdapter, RedisStore, admin_router, gateway_router,
    },
    config::load_config,
    core::{
        EventLog, LoadBalancer, RouteCatalog, SandboxPool,
        events::EventConsumerConfig,
        route::now_nanos,
    },
    ports::{http_client::HttpClient, store::Store},
    tracing_setup,
    utils::Shutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "conf/config.yaml")]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "conf/config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "conf/config.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "conf/config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => validate_config_command(&config_path),
        "init" => init_config_command(&config_path).await,
        _ => serve(&config_path).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    config.validate().map_err(|e| eyre!("invalid configuration: {e}"))?;
    let config = Arc::new(config);

    tracing_setup::init_tracing(config.app.debug)
        .map_err(|e| eyre!("failed to initialize tracing: {e}"))?;

    tracing::info!(
        gateway_port = config.gateway.port,
        admin_port = config.app.port,
        strategy = %config.gateway.load_balancer_strategy,
        health_check_interval = config.gateway.health_check_interval,
        "starting sandgate"
    );

    let shutdown = Arc::new(Shutdown::new());
    {
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move { signal_shutdown.run_signal_handler().await });
    }

    // Store connectivity decides between distributed and degraded mode.
    let store: Option<Arc<dyn Store>> = match RedisStore::connect(&config.redis).await {
        Ok(store) => {
            tracing::info!(addr = %config.redis.addr, "connected to shared store");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(addr = %config.redis.addr, error = %e, "store unreachable");
            tracing::warn!(
                "running with in-memory storage only; routes will not be persisted or propagated"
            );
            None
        }
    };

    let events = store.clone().map(|store| Arc::new(EventLog::new(store)));
    let catalog = RouteCatalog::new(store.clone(), events.clone());

    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("failed to create HTTP client adapter")?);

    if store.is_some() {
        if let Err(e) = catalog.load_incremental().await {
            tracing::warn!(error = %e, "initial route load failed");
        }

        let consumer_config =
            EventConsumerConfig::for_replica(format!("consumer-{}", now_nanos()));
        if let Some(events) = &events {
            events
                .start_consumer(consumer_config, catalog.clone(), shutdown.subscribe())
                .await
                .map_err(|e| eyre!("failed to start event consumer: {e}"))?;
        }

        tokio::spawn(catalog.clone().run_sync_loop(shutdown.subscribe()));
    }

    let pool = SandboxPool::new(
        store.clone(),
        LoadBalancer::from_name(&config.gateway.load_balancer_strategy),
    );
    if let Err(e) = pool.load_from_store().await {
        tracing::warn!(error = %e, "initial sandbox load failed");
    }
    tokio::spawn(pool.clone().run_health_loop(
        http_client.clone(),
        Duration::from_secs(config.gateway.health_check_interval),
        shutdown.subscribe(),
    ));

    // Data-plane listener.
    let gateway_handler = Arc::new(GatewayHandler::new(
        catalog.clone(),
        pool.clone(),
        http_client.clone(),
        config.clone(),
    ));
    let gateway_app = gateway_router(gateway_handler);
    let gateway_addr = SocketAddr::from(([0, 0, 0, 0], config.gateway.port));

    // Management listener.
    let admin_app = admin_router(AdminState {
        catalog: catalog.clone(),
        pool: pool.clone(),
        events,
        store,
        config: config.clone(),
    });
    let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.app.port));

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {gateway_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener on {admin_addr}"))?;

    tracing::info!(%gateway_addr, "gateway listener started");
    tracing::info!(%admin_addr, "admin listener started");

    let gateway_shutdown = shutdown.clone();
    let gateway_server = axum::serve(gateway_listener, gateway_app)
        .with_graceful_shutdown(async move { gateway_shutdown.wait().await });

    let admin_shutdown = shutdown.clone();
    let admin_server = axum::serve(admin_listener, admin_app)
        .with_graceful_shutdown(async move { admin_shutdown.wait().await });

    let (gateway_result, admin_result) = tokio::join!(
        async move { gateway_server.await },
        async move { admin_server.await },
    );
    gateway_result.context("gateway server error")?;
    admin_result.context("admin server error")?;

    tracing::info!("sandgate stopped");
    Ok(())
}

/// Validate configuration file and exit
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match config.validate() {
        Ok(()) => {
            println!("configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   gateway port:          {}", config.gateway.port);
            println!("   admin port:            {}", config.app.port);
            println!(
                "   load balancer:         {}",
                config.gateway.load_balancer_strategy
            );
            println!(
                "   health check interval: {}s",
                config.gateway.health_check_interval
            );
            println!("   store:                 {}", config.redis.addr);
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration validation failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Sandgate configuration

app:
  # Admin listener port
  port: 8195
  debug: true
  # Keys checked against the X-Api-Key header; `key` is the legacy
  # fallback for both listeners.
  gateway_key: ""
  admin_key: ""
  key: "sandgate"

gateway:
  # Data-plane listener port
  port: 8080
  # least-connections, round-robin, or random
  load_balancer_strategy: "least-connections"
  # Seconds between sandbox health probes
  health_check_interval: 15
  cors_enabled: true

redis:
  addr: "localhost:6379"
  password: ""
  db: 0

# Consumed by the sandbox worker layer; carried here so one file
# configures the whole deployment.
max_workers: 4
max_requests: 50
worker_timeout: 5
enable_network: true
enable_preload: false
allowed_syscalls: []

proxy:
  socks5: ""
  http: ""
  https: ""
"#;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create config directory")?;
        }
    }
    tokio::fs::write(path, default_config)
        .await
        .context("failed to write config file")?;
    println!("created default configuration at: {config_path}");
    println!("   run 'sandgate serve --config {config_path}' to start the gateway");
    Ok(())
}
