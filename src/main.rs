use std::sync::Arc;

use clap::{Parser, Subcommand};
use skywatch::OurResult;
use skywatch::camera::spawn_camera;
use skywatch::capture::{FrameStore, HttpFrameSource};
use skywatch::config::Settings;
use skywatch::cycle::{CycleState, Orchestrator};
use skywatch::positions::{HOME_POSITION, PositionRegistry};
use skywatch::scheduler::Scheduler;
use skywatch::server::{self, AppState};
use skywatch::transport::build_transport;
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "skywatch")]
#[command(about = "PTZ weather camera acquisition daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the acquisition daemon and web server
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single capture cycle and exit
    Cycle,
    /// Query the camera's presets and show how they map onto positions
    Presets,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show configuration
    Show,
}

#[tokio::main]
async fn main() -> OurResult<()> {
    let cli = Cli::parse();

    // Initialize configuration
    let mut settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    settings.apply_user_config();

    // Initialize tracing
    let log_level = if cli.debug || settings.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    if cli.debug {
        debug!("Debug mode enabled");
    }

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.host.clone());
            let port = port.unwrap_or(settings.port);
            serve(host, port, settings).await
        }
        Commands::Cycle => run_single_cycle(settings).await,
        Commands::Presets => show_presets(settings).await,
        Commands::Config { action } => handle_config_command(action, &settings),
    }
}

/// Wire up the full acquisition pipeline from settings.
fn build_pipeline(settings: &Settings) -> OurResult<(Arc<AppState>, Scheduler)> {
    let transport = build_transport(settings)?;

    let mut frame_roots = vec![settings.frames_dir.clone()];
    frame_roots.extend(settings.frame_fallback_dirs.iter().cloned());

    let mut position_ids = vec![HOME_POSITION];
    position_ids.extend(&settings.patrol_positions);
    let store = Arc::new(FrameStore::open(
        &frame_roots,
        &position_ids,
        settings.frame_width,
        settings.frame_height,
        settings.jpeg_quality,
    )?);

    let state = CycleState::from_settings(settings).shared();
    let camera = spawn_camera(
        transport,
        PositionRegistry::default(),
        settings.move_speed,
        state.clone(),
    );
    let source = Arc::new(HttpFrameSource::new(settings.stream_url.clone())?);
    let orchestrator = Orchestrator::new(state, camera.clone(), source, store);
    let scheduler = Scheduler::new(orchestrator.clone());

    let app_state = Arc::new(AppState {
        settings: settings.clone(),
        camera,
        orchestrator,
        scheduler: scheduler.clone(),
    });
    Ok((app_state, scheduler))
}

async fn serve(host: String, port: u16, settings: Settings) -> OurResult<()> {
    info!("Skywatch starting up");
    let (app_state, scheduler) = build_pipeline(&settings)?;

    // The scheduler ticks from the start; the first cycle fires on the
    // first due tick, never during startup itself.
    scheduler.start().await;

    server::start_server(host, port, app_state).await
}

async fn run_single_cycle(settings: Settings) -> OurResult<()> {
    let (_app_state, scheduler) = build_pipeline(&settings)?;
    let report = scheduler.force_run_now().await?;

    info!("Cycle outcome: {:?}", report.outcome);
    for result in &report.results {
        match &result.file_path {
            Some(path) => info!("Position {}: {}", result.position_id, path.display()),
            None => info!(
                "Position {}: failed ({})",
                result.position_id,
                result.error.as_deref().unwrap_or("unknown")
            ),
        }
    }
    Ok(())
}

async fn show_presets(settings: Settings) -> OurResult<()> {
    let (app_state, _scheduler) = build_pipeline(&settings)?;

    let presets = app_state.camera.discover_presets().await;
    println!("Device presets ({}):", presets.len());
    for (token, name) in &presets {
        println!("  {token}: {name}");
    }

    println!("Position bindings:");
    for position in app_state.camera.positions().await {
        match &position.preset_ref {
            Some(token) => println!("  {} ({}) -> preset {token}", position.id, position.name),
            None => println!("  {} ({}) -> unmapped", position.id, position.name),
        }
    }
    Ok(())
}

fn handle_config_command(action: ConfigAction, settings: &Settings) -> OurResult<()> {
    match action {
        ConfigAction::Show => {
            println!("Configuration:");
            println!("  Host: {}", settings.host);
            println!("  Port: {}", settings.port);
            println!("  Debug: {}", settings.debug);
            println!("  Frames dir: {}", settings.frames_dir.display());
            println!("  Cycle interval: {}s", settings.cycle_interval_secs);
            println!("  Position wait: {}s", settings.position_wait_secs);
            println!("  Transition wait: {}s", settings.transition_wait_secs);
            println!(
                "  Active window: {} - {}",
                settings.active_start.format("%H:%M"),
                settings.active_end.format("%H:%M")
            );
            println!(
                "  Timezone offset: {} (DST: {})",
                settings.timezone_offset, settings.dst_enabled
            );
            println!("  Patrol positions: {:?}", settings.patrol_positions);
            println!("  Vendor: {:?}", settings.vendor);
            println!("  Camera: {}:{}", settings.camera_host, settings.camera_port);
            println!("  Stream URL: {}", settings.stream_url);
            Ok(())
        }
    }
}
