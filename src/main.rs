use std::error::Error;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use marine_proto::Message;
use marine_proto::ids::{channels, sources as source_ids};
use tracing::{debug, error, info, warn};

mod app_metrics;
mod cancel;
mod channel_map;
mod channel_stats;
mod checkpoint;
mod config;
mod dispatcher;
mod driver;
mod error;
mod log_writer;
mod monitor;
mod queue;
mod sources;
mod transport;
mod web;

use cancel::CancelToken;
use channel_map::ChannelMap;
use checkpoint::StateCheckpoint;
use config::Config;
use dispatcher::{Dispatcher, DispatcherSettings, LogControl, SharedSnapshot};
use driver::{DeviceDriver, SourceRegistry, SourceState, standard_channels};
use error::SourceError;
use monitor::LiveMonitor;
use queue::{Fanout, MessageQueue, QueueProducer};
use sources::timer::TimerSource;

const DEFAULT_CONFIG_FILE: &str = "config.json";
/// How often the main thread checks whether all sources have finished
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);

// ========== Logging Setup ==========

fn init_logging(log_config: &config::LogConfig) -> Result<(), Box<dyn Error>> {
    use tracing_appender::rolling;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    std::fs::create_dir_all(&log_config.directory)?;

    let file_appender = rolling::daily(&log_config.directory, &log_config.file_prefix);

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| fmt::time::OffsetTime::new(
            time::UtcOffset::UTC,
            time::format_description::well_known::Rfc3339,
        )));

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_thread_names(true)
        .with_timer(fmt::time::OffsetTime::local_rfc_3339().unwrap_or_else(|_| fmt::time::OffsetTime::new(
            time::UtcOffset::UTC,
            time::format_description::well_known::Rfc3339,
        )));

    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

// ========== Source Threads ==========

/// A started driver and the registration it pushes through
struct ActiveSource {
    driver: Box<dyn DeviceDriver>,
    producer: QueueProducer,
}

/// Only an unrecoverable driver error comes back through the handle;
/// anything else ends the source alone.
fn spawn_source(
    mut source: ActiveSource,
    registry: Arc<SourceRegistry>,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<Result<(), SourceError>>> {
    let name = source.driver.tag().to_string();
    thread::Builder::new().name(name).spawn(move || {
        let id = source.driver.source_id();
        registry.set_state(id, SourceState::Running, None);

        let result = match source.driver.run(&source.producer, &cancel) {
            Ok(()) => {
                info!("[{}] Finished", source.driver.tag());
                registry.set_state(id, SourceState::Stopped, None);
                Ok(())
            }
            Err(e) => {
                error!("[{}] {}", source.driver.tag(), e);
                registry.set_state(id, SourceState::Failed, Some(e.to_string()));
                if e.is_fatal() {
                    error!("[{}] Unrecoverable error, shutting down", source.driver.tag());
                    cancel.cancel();
                    Err(e)
                } else {
                    Ok(())
                }
            }
        };
        source.driver.stop();
        result
    })
}

/// Configured sources plus the internal timer, each with its `required` flag
fn build_drivers(config: &Config) -> Result<Vec<(Box<dyn DeviceDriver>, bool)>, Box<dyn Error>> {
    let mut drivers: Vec<(Box<dyn DeviceDriver>, bool)> = Vec::new();
    for (section, source_config) in &config.sources {
        drivers.push((sources::build_driver(section, source_config)?, source_config.required));
    }
    if config.timer_frequency > 0 {
        let timer: Box<dyn DeviceDriver> = Box::new(TimerSource::new(config.timer_frequency));
        drivers.push((timer, true));
    }
    Ok(drivers)
}

/// Start every driver on the calling thread. Optional sources that fail
/// are skipped; any other error stops the drivers already started.
fn start_sources(
    drivers: Vec<(Box<dyn DeviceDriver>, bool)>,
    fanout: &Fanout,
    channel_map: &ChannelMap,
    registry: &SourceRegistry,
    announce: &QueueProducer,
) -> Result<Vec<ActiveSource>, Box<dyn Error>> {
    let mut active: Vec<ActiveSource> = Vec::with_capacity(drivers.len());
    for (driver, required) in drivers {
        match start_source(driver, required, fanout, channel_map, registry, announce) {
            Ok(Some(source)) => active.push(source),
            Ok(None) => {}
            Err(e) => {
                for mut started in active {
                    started.driver.stop();
                    registry.set_state(started.driver.source_id(), SourceState::Stopped, None);
                }
                return Err(e);
            }
        }
    }
    Ok(active)
}

/// `Ok(None)` for a skipped optional source. The driver is stopped before
/// any error is returned.
fn start_source(
    mut driver: Box<dyn DeviceDriver>,
    required: bool,
    fanout: &Fanout,
    channel_map: &ChannelMap,
    registry: &SourceRegistry,
    announce: &QueueProducer,
) -> Result<Option<ActiveSource>, Box<dyn Error>> {
    registry.register(&*driver, required);
    if let Err(e) = driver.start() {
        driver.stop();
        if required {
            registry.set_state(driver.source_id(), SourceState::Failed, Some(e.to_string()));
            return Err(format!("Required source {} failed to start: {}", driver.tag(), e).into());
        }
        warn!("[{}] Skipping optional source: {}", driver.tag(), e);
        registry.set_state(driver.source_id(), SourceState::Skipped, Some(e.to_string()));
        return Ok(None);
    }

    channel_map.declare(driver.source_id(), driver.name(), &driver.channels());
    let registered = announce
        .push_all(channel_map.broadcast_messages(driver.source_id()))
        .and_then(|()| fanout.register());
    match registered {
        Ok(producer) => Ok(Some(ActiveSource { driver, producer })),
        Err(e) => {
            driver.stop();
            registry.set_state(driver.source_id(), SourceState::Failed, Some(e.to_string()));
            Err(format!("Unable to register source {}: {}", driver.tag(), e).into())
        }
    }
}

// ========== Signals and Web Server ==========

/// Real-time signal `SIGRTMIN + offset`, where the platform has them
#[cfg(target_os = "linux")]
fn realtime_signal(offset: i32) -> std::io::Result<Option<tokio::signal::unix::Signal>> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::from_raw(libc::SIGRTMIN() + offset)).map(Some)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn realtime_signal(_offset: i32) -> std::io::Result<Option<tokio::signal::unix::Signal>> {
    Ok(None)
}

#[cfg(unix)]
async fn recv_optional(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn handle_signals(cancel: CancelToken, control: LogControl) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut rt_shutdown = realtime_signal(1)?;
    let mut rt_rotate = realtime_signal(2)?;
    let mut rt_pause = realtime_signal(3)?;
    let mut rt_resume = realtime_signal(4)?;
    let mut poll = tokio::time::interval(SUPERVISE_INTERVAL);

    while !cancel.is_cancelled() {
        tokio::select! {
            _ = interrupt.recv() => { info!("SIGINT received, shutting down"); cancel.cancel(); }
            _ = terminate.recv() => { info!("SIGTERM received, shutting down"); cancel.cancel(); }
            _ = quit.recv() => { info!("SIGQUIT received, shutting down"); cancel.cancel(); }
            _ = recv_optional(&mut rt_shutdown) => { info!("SIGRTMIN+1 received, shutting down"); cancel.cancel(); }
            _ = hangup.recv() => { info!("SIGHUP received, rotating data files"); control.request_rotation(); }
            _ = user1.recv() => { info!("SIGUSR1 received, rotating data files"); control.request_rotation(); }
            _ = recv_optional(&mut rt_rotate) => { info!("SIGRTMIN+2 received, rotating data files"); control.request_rotation(); }
            _ = recv_optional(&mut rt_pause) => { info!("SIGRTMIN+3 received, pausing logging"); control.pause(); }
            _ = recv_optional(&mut rt_resume) => { info!("SIGRTMIN+4 received, resuming logging"); control.resume(); }
            _ = poll.tick() => {}
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn handle_signals(cancel: CancelToken, _control: LogControl) -> std::io::Result<()> {
    let mut poll = tokio::time::interval(SUPERVISE_INTERVAL);
    while !cancel.is_cancelled() {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
            _ = poll.tick() => {}
        }
    }
    Ok(())
}

/// Runs the tokio runtime for signal handling and the optional web server
fn spawn_runtime(
    cancel: CancelToken,
    control: LogControl,
    web: Option<(web::AppState, u16)>,
) -> std::io::Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("runtime")
        .enable_all()
        .build()?;

    thread::Builder::new().name("signals".to_string()).spawn(move || {
        runtime.block_on(async move {
            if let Some((state, port)) = web {
                tokio::spawn(async move {
                    if let Err(e) = web::start_web_server(state, port).await {
                        error!("Web server stopped: {}", e);
                    }
                });
            }
            if let Err(e) = handle_signals(cancel.clone(), control).await {
                error!("Failed to install signal handlers: {}", e);
                // Without handlers the process can only be stopped by a
                // finished source, so keep waiting for that
                while !cancel.is_cancelled() {
                    tokio::time::sleep(SUPERVISE_INTERVAL).await;
                }
            }
        });
        runtime.shutdown_timeout(Duration::from_secs(1));
    })
}

// ========== Main Application ==========

fn print_help() {
    println!("Marine Data Logger");
    println!();
    println!("USAGE:");
    println!("    marine_logger [OPTIONS] [CONFIG]");
    println!();
    println!("OPTIONS:");
    println!("    --validate-config, --validate, -v    Validate configuration and exit");
    println!("    --help, -h                           Show this help message");
    println!();
    println!("Configuration file: {} (in current directory) unless CONFIG is given", DEFAULT_CONFIG_FILE);
}

fn print_summary(config: &Config, warnings: &[String]) {
    println!("✓ Configuration validation successful");
    println!("  Data prefix: {}", config.data_prefix);
    println!(
        "  State file: {} (every {} s, {})",
        config.state_file,
        config.state_interval_seconds,
        if config.save_state { "enabled" } else { "disabled" }
    );
    println!("  Timer: {} Hz", config.timer_frequency);
    println!("  Sources: {}", config.sources.len());
    for (section, source) in &config.sources {
        let endpoint = source
            .endpoint(section)
            .map(|e| e.to_string())
            .unwrap_or_default();
        println!(
            "    [{}] {} {} on {}{}",
            section,
            source.source_type.label(),
            source.display_name(section),
            endpoint,
            if source.required { "" } else { " (optional)" }
        );
    }
    for warning in warnings {
        println!("  Warning: {}", warning);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        std::process::exit(0);
    }

    let validate_only = args
        .iter()
        .any(|a| a == "--validate-config" || a == "--validate" || a == "-v");
    let config_path = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with('-'))
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_FILE);

    // A logger without its configuration would record nothing useful
    let (config, warnings) = match Config::from_file(config_path).and_then(|c| {
        let warnings = c.validate()?;
        Ok((c, warnings))
    }) {
        Ok(loaded) => loaded,
        Err(e) => {
            if validate_only {
                eprintln!("✗ Configuration validation failed: {}", e);
            } else {
                eprintln!("Fatal configuration error in {}: {}", config_path, e);
            }
            std::process::exit(1);
        }
    };
    if validate_only {
        print_summary(&config, &warnings);
        std::process::exit(0);
    }

    init_logging(&config.logging)?;
    info!("Marine logger {} starting...", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {}", config_path);
    for warning in &warnings {
        warn!("{}", warning);
    }

    let cancel = CancelToken::new();
    let control = LogControl::new();
    let channel_map = Arc::new(ChannelMap::new());
    let registry = Arc::new(SourceRegistry::new());
    let published: SharedSnapshot = Arc::new(RwLock::new(None));

    // One queue per sink, all fed by the same fan-out
    let log_queue = Arc::new(MessageQueue::new());
    let mut fanout = Fanout::new();
    fanout.add_sink(Arc::clone(&log_queue));
    let monitor_queue = config.monitor.enabled.then(|| {
        let queue = Arc::new(MessageQueue::new());
        fanout.add_sink(Arc::clone(&queue));
        queue
    });

    let settings = DispatcherSettings::from_config(&config);
    let mut dispatcher = Dispatcher::new(
        &settings,
        Arc::clone(&log_queue),
        Arc::clone(&channel_map),
        control.clone(),
        Arc::clone(&published),
    )
    .map_err(|e| format!("Failed to open data file for {}: {}", settings.data_prefix, e))?;

    if let Some(state_file) = &settings.state_file {
        match StateCheckpoint::load(state_file) {
            Ok(Some(snapshot)) => dispatcher.restore(&snapshot),
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable state file {}: {}", state_file.display(), e),
        }
    }

    // Held by the main thread for the startup announcements
    let announce = fanout.register()?;
    channel_map.declare(source_ids::LOCAL, "Logger", &standard_channels(false));
    announce.push_all(channel_map.broadcast_messages(source_ids::LOCAL))?;
    announce.push(Message::string(
        source_ids::LOCAL,
        channels::INFO,
        format!("marine_logger {}", env!("CARGO_PKG_VERSION")),
    ))?;

    let dispatcher_handle = thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || dispatcher.run())?;
    let monitor_handle = match monitor_queue {
        Some(queue) => {
            let monitor = LiveMonitor::new(queue, config.monitor.destination.clone());
            Some(thread::Builder::new().name("monitor".to_string()).spawn(move || monitor.run())?)
        }
        None => None,
    };

    let web = config.web.enabled.then(|| {
        (
            web::AppState {
                channel_map: Arc::clone(&channel_map),
                snapshot: Arc::clone(&published),
                registry: Arc::clone(&registry),
            },
            config.web.port,
        )
    });
    let runtime_handle = spawn_runtime(cancel.clone(), control.clone(), web)?;

    // Reported as the exit status once the shutdown below has run
    let mut fatal: Option<Box<dyn Error>> = None;
    let mut source_handles = Vec::new();
    let started = build_drivers(&config)
        .and_then(|drivers| start_sources(drivers, &fanout, &channel_map, &registry, &announce));
    match started {
        Ok(active) => {
            info!("{} sources running", active.len());
            for source in active {
                source_handles.push(spawn_source(source, Arc::clone(&registry), cancel.clone())?);
            }
        }
        Err(e) => {
            error!("{}", e);
            cancel.cancel();
            fatal = Some(e);
        }
    }
    drop(announce);

    while cancel.sleep(SUPERVISE_INTERVAL) {
        if source_handles.iter().all(|h| h.is_finished()) {
            info!("All sources finished");
            break;
        }
    }

    info!("Shutting down...");
    cancel.cancel();
    for handle in source_handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if fatal.is_none() {
                    fatal = Some(e.into());
                }
            }
            Err(_) => error!("A source thread panicked"),
        }
    }
    // A paused dispatcher would never see the queue close
    control.resume();
    // Every producer is gone now, so the sinks drain and exit
    match dispatcher_handle.join() {
        Ok(stats) => info!(
            "Logged {} messages on {} channels",
            stats.total_count(),
            stats.len()
        ),
        Err(_) => error!("Dispatcher thread panicked"),
    }
    if let Some(handle) = monitor_handle
        && let Ok((sent, errors)) = handle.join()
    {
        debug!("Live monitor sent {} datagrams, {} errors", sent, errors);
    }
    if runtime_handle.join().is_err() {
        error!("Runtime thread panicked");
    }

    match fatal {
        Some(e) => {
            error!("Marine logger stopped after a fatal error");
            Err(e)
        }
        None => {
            info!("Marine logger stopped");
            Ok(())
        }
    }
}
