//! IVI command line
//!
//! Lists backends, drives the climate and tuner features, and serves a
//! simulated tuner and its station list to remote replicas.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ivi::climate::{ClimateControl, ClimateLevel, ClimateSwitch};
use ivi::plugin::MEDIA_MODULE;
use ivi::tuner::{
    AMFM_TUNER_INTERFACE, AmFmTuner, STATION_LIST_SOURCE, Station, StationListSimulation,
    TunerSimulation, TunerSource,
};
use ivi::{App, AppConfig};
use ivi_core::{DiscoveryMode, DiscoveryResult, GENERIC_ZONE, PagingModel, PropertyScope};
use ivi_remote::{PagingModelSource, ProxyTransportAdapter, SourceHost, SourceRegistry};

/// IVI feature host
#[derive(Parser, Debug)]
#[command(name = "ivi")]
#[command(about = "In-vehicle infotainment feature host", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plugin directory, overrides the configuration
    #[arg(short, long)]
    plugins: Option<PathBuf>,

    /// Which backends features may bind to
    #[arg(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered backends
    Backends,

    /// Show climate state, optionally changing it first
    Climate {
        /// Zone written by --temperature and --seat-heater
        #[arg(long, default_value = "FrontLeft")]
        zone: String,

        #[arg(long)]
        temperature: Option<i32>,

        #[arg(long)]
        seat_heater: Option<i32>,

        #[arg(long)]
        fan: Option<i32>,

        #[arg(long)]
        air_conditioning: Option<bool>,
    },

    /// Show tuner state, optionally tuning first
    Tuner {
        /// Frequency in Hz
        #[arg(long)]
        frequency: Option<u32>,

        #[arg(long, conflicts_with = "seek_down")]
        seek_up: bool,

        #[arg(long)]
        seek_down: bool,

        /// List the known stations
        #[arg(long)]
        stations: bool,
    },

    /// Serve a simulated tuner to remote replicas
    Serve {
        /// Listen url, defaults to the configured media url
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Auto,
    Production,
    Simulation,
}

impl From<Mode> for DiscoveryMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => DiscoveryMode::Auto,
            Mode::Production => DiscoveryMode::ProductionOnly,
            Mode::Simulation => DiscoveryMode::SimulationOnly,
        }
    }
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ivi=info,ivi_core=info,ivi_remote=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(plugins) = args.plugins.clone() {
        config.plugin_dir = plugins;
    }

    info!("Starting ivi v{}", env!("CARGO_PKG_VERSION"));

    let mode = DiscoveryMode::from(args.mode);
    if let Command::Serve { url } = &args.command {
        return serve(&config, url.clone()).await;
    }
    let app = App::load(config).await?;

    match args.command {
        Command::Backends => list_backends(&app),
        Command::Climate {
            zone,
            temperature,
            seat_heater,
            fan,
            air_conditioning,
        } => {
            let climate = app.climate();
            climate.set_discovery_mode(mode);
            bind("climate", climate.start_auto_discovery())?;

            if let Some(value) = temperature {
                climate.set_target_temperature(&zone, value);
            }
            if let Some(value) = seat_heater {
                climate.set_seat_heater(&zone, value);
            }
            if let Some(value) = fan {
                climate.set_fan_speed_level(value);
            }
            if let Some(enabled) = air_conditioning {
                climate.set_enabled(ClimateSwitch::AirConditioning, enabled);
            }
            print_climate(&climate);
            Ok(())
        }
        Command::Tuner {
            frequency,
            seek_up,
            seek_down,
            stations,
        } => {
            let tuner = app.tuner();
            tuner.set_discovery_mode(mode);
            bind("tuner", tuner.start_auto_discovery())?;
            wait_initialized(&tuner, app.config().init_timeout()).await?;

            if let Some(frequency) = frequency {
                tuner.set_frequency(frequency);
            }
            if seek_up || seek_down {
                let reply = if seek_up { tuner.seek_up() } else { tuner.seek_down() };
                let station = reply.wait().await.context("seek failed")?;
                println!("seek settled on {} ({} Hz)", station.name, station.frequency);
            }
            print_tuner(&tuner);
            if stations {
                print_stations(&app, &tuner, app.config().init_timeout()).await?;
            }
            Ok(())
        }
        Command::Serve { .. } => Ok(()),
    }
}

fn bind(feature: &str, result: DiscoveryResult) -> Result<()> {
    match result {
        DiscoveryResult::ProductionBackendLoaded | DiscoveryResult::SimulationBackendLoaded => {
            info!(feature, ?result, "Feature bound");
            Ok(())
        }
        _ => bail!("no backend available for {}", feature),
    }
}

/// Remote backends initialize asynchronously
async fn wait_initialized(tuner: &AmFmTuner, timeout: std::time::Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !tuner.is_initialized() {
        if tokio::time::Instant::now() >= deadline {
            bail!("tuner backend did not initialize: {}", tuner.error_message());
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    Ok(())
}

fn list_backends(app: &App) -> Result<()> {
    let descriptors = app.registry().descriptors();
    if descriptors.is_empty() {
        println!("No backends registered");
        return Ok(());
    }
    for descriptor in descriptors {
        println!(
            "{:<24} {:<12?} {}",
            descriptor.name,
            descriptor.backend_type(),
            descriptor.interfaces.join(", ")
        );
    }
    Ok(())
}

fn print_climate(climate: &ClimateControl) {
    let zones = climate.available_zones();
    println!("zones: {}", zones.join(", "));

    for level in ClimateLevel::ALL {
        let keys: Vec<&str> = match level.scope() {
            PropertyScope::Zoned => zones.iter().map(String::as_str).collect(),
            PropertyScope::Generic => vec![GENERIC_ZONE],
        };
        for zone in keys {
            if let Some(property) = climate.level(level, zone) {
                let label = if zone.is_empty() { "-" } else { zone };
                println!("{:<22} {:<12} {:>4}  {:?}", format!("{:?}", level), label, property.value, property.attribute);
            }
        }
    }
    for switch in ClimateSwitch::ALL {
        if let Some(property) = climate.switch(switch) {
            println!("{:<22} {:<12} {:>4}", format!("{:?}", switch), "-", property.value);
        }
    }
}

/// Page through the station list offered by the tuner's backend
async fn print_stations(app: &App, tuner: &AmFmTuner, timeout: std::time::Duration) -> Result<()> {
    let Some(handle) = tuner.service_object() else {
        bail!("tuner is not bound");
    };
    let backend = handle.name().to_string();
    let model = PagingModel::with_service_object(app.registry().clone(), handle);
    if model.capability().is_none() {
        println!("stations: not offered by {}", backend);
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if model.can_fetch_more() {
            model.fetch_more();
        }
        let complete = !model.can_fetch_more() && model.items().iter().all(Option::is_some);
        if complete {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("station list did not load");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    println!("stations:");
    for row in 0..model.row_count() {
        match model.get::<Station>(row) {
            Some(station) => println!("  {:<24} {:>10} Hz  {:?}", station.name, station.frequency, station.band),
            None => println!("  <invalid row {}>", row),
        }
    }
    Ok(())
}

fn print_tuner(tuner: &AmFmTuner) {
    if let Some(band) = tuner.band() {
        println!(
            "band: {:?} ({}..{} Hz, step {})",
            band.band, band.minimum_frequency, band.maximum_frequency, band.step_size
        );
    }
    if let Some(frequency) = tuner.frequency() {
        println!("frequency: {} Hz", frequency);
    }
    match tuner.station() {
        Some(station) if !station.name.is_empty() => println!("station: {}", station.name),
        _ => println!("station: -"),
    }
    println!("scanning: {}", tuner.is_scan_running());
}

async fn serve(config: &AppConfig, url: Option<String>) -> Result<()> {
    let endpoint = match url {
        Some(url) => ivi_remote::Endpoint::parse(&url)?,
        None => config
            .remote_config()?
            .resolve_endpoint(MEDIA_MODULE, Some(AMFM_TUNER_INTERFACE), None)?,
    };

    let backend = Arc::new(TunerSimulation::with_seek_delay(config.seek_delay()));
    let stations = Arc::new(StationListSimulation::new(&backend.stations()));
    let sources = SourceRegistry::default();
    sources.enable_remoting(Arc::new(ProxyTransportAdapter::new(TunerSource::new(backend))));
    sources.enable_remoting(Arc::new(ProxyTransportAdapter::new(PagingModelSource::new(
        STATION_LIST_SOURCE,
        stations,
    ))));
    let host = SourceHost::bind(&endpoint, sources).await?;

    info!(%endpoint, sources = ?host.sources().names(), "Serving simulated tuner");
    tokio::select! {
        result = host.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
