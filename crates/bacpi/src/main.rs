//! bacpi Gateway
//!
//! Exposes single-board computer GPIO and sensors as BACnet/IP objects.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use bacpi::config::{GatewayConfig, Overrides, parse_peer};
use bacpi::hardware::{ReleaseGuard, open_backend};
use bacpi::protocol::{
    BipServer, DeviceInfo, ForeignDevice, ObjectServer, TransportService, read_version,
};
use bacpi::service::ServiceManager;
use bacpi::sync::{SYNC_SERVICE_ID, SyncEngine, SyncService};
use bacpi::{Bootstrap, Gateway};

/// GPIO to BACnet/IP gateway
#[derive(Parser, Debug)]
#[command(name = "bacpi")]
#[command(about = "GPIO to BACnet/IP gateway", long_about = None)]
struct Args {
    /// Bind address as ip/prefix:port
    #[arg(long)]
    address: Option<String>,

    /// Extension file with additional point definitions
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// BBMD to register with as a foreign device (ip[:port])
    #[arg(long)]
    bbmd: Option<String>,

    /// Broadcast address, overriding the one derived from the bind address
    #[arg(long)]
    broadcast_ip: Option<String>,

    /// Device object instance
    #[arg(long)]
    device_id: Option<u32>,

    /// Gateway settings file
    #[arg(short, long, default_value = "gateway.toml")]
    settings: PathBuf,

    /// Use in-memory channels instead of sysfs GPIO
    #[arg(long)]
    simulate: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print the effective settings and exit
    #[arg(long)]
    print_settings: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting bacpi v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    if args.print_settings {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let version = read_version(&config.device.version_file)
        .await
        .with_context(|| {
            format!(
                "Failed to read version file {}",
                config.device.version_file.display()
            )
        })?;

    // Fatal: without hardware there is nothing to serve
    let backend = open_backend(&config.hardware, &config.sensors)
        .context("Failed to acquire hardware backend")?;
    let _release = ReleaseGuard::new(backend.clone());

    let bootstrap = Bootstrap::from_config(&config);
    bootstrap
        .configure_channels(backend.as_ref())
        .context("Failed to configure channels")?;

    let gateway = Gateway::new(bootstrap.registry, backend.clone(), bootstrap.load_context);
    let report = gateway.load_extensions(&config.extension_file).await;
    info!(
        "{} points active ({} from extensions, {} entries skipped)",
        gateway.point_count(),
        report.added.len(),
        report.skipped
    );

    // Fatal: the guard releases the channels on the way out
    let server = Arc::new(
        BipServer::bind(config.bind_address()?)
            .await
            .context("Failed to bind BACnet/IP transport")?,
    );
    if let Some(broadcast) = &config.network.broadcast {
        if let Err(e) = server.set_broadcast_override(broadcast) {
            warn!(
                "{}; using derived broadcast {}",
                e,
                server.broadcast_address()
            );
        }
    }

    server.set_device_info(DeviceInfo::new(&config.device, &version));
    let published = gateway.publish(server.as_ref(), None);
    info!("Published {} objects", published);

    let foreign = config.network.bbmd.as_deref().and_then(|bbmd| {
        match parse_peer(bbmd) {
            Ok(addr) => Some(ForeignDevice {
                bbmd: addr,
                ttl: config.network.bbmd_ttl,
            }),
            Err(e) => {
                warn!("Invalid BBMD address '{}': {}; continuing unregistered", bbmd, e);
                None
            }
        }
    });

    let service_manager = ServiceManager::new_shared();
    service_manager
        .spawn(TransportService::new(server.clone(), foreign))
        .await?;
    let engine = SyncEngine::new(gateway.clone(), bootstrap.channels);
    service_manager
        .spawn(SyncService::new(engine, config.sync_period()))
        .await?;

    for (id, state) in service_manager.list() {
        info!("  - {} ({})", id, state);
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        state = service_manager.wait_terminated(SYNC_SERVICE_ID) => {
            error!("Sync service terminated unexpectedly ({})", state);
        }
    }

    info!("Shutting down services...");
    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bacpi=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let settings = if args.settings.exists() {
        info!("Loading settings from {}", args.settings.display());
        Some(args.settings.as_path())
    } else {
        info!(
            "Settings file {} not found, using defaults",
            args.settings.display()
        );
        None
    };

    let mut config = GatewayConfig::load(settings).context("Failed to load settings")?;
    config
        .apply(Overrides {
            address: args.address.clone(),
            extension_file: args.config.clone(),
            bbmd: args.bbmd.clone(),
            broadcast: args.broadcast_ip.clone(),
            device_id: args.device_id,
            simulate: args.simulate,
        })
        .context("Invalid command line settings")?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
