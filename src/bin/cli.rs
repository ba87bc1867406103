//! Witness CLI - Main entry point for CLI binary
//!
//! This binary provides the `witness-cli` tool for operating a witness device
//! on a host: checkpoint storage, firmware verification and the update loop.

use clap::Parser;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use witness_core::engine::{
    api::{create_router, ApiState},
    cli::formatter::{format_duration, format_size, CliFormatter},
    cli::{CheckpointAction, Cli, Commands, OutputFormat},
    config::Config,
    firmware::{Bundle, BundleVerifier, Component, Manifest, Version},
    storage::{FilePartition, Partition, SlotPersistence},
    updater::{
        run_update_loop, DirectoryInstaller, HttpLogClient, UpdateFetcher, UpdateReport, Updater,
    },
};

type CliResult = Result<(), Box<dyn Error>>;
type DeviceUpdater = Updater<DirectoryInstaller, UpdateFetcher<HttpLogClient>, BundleVerifier>;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&e.to_string());
        std::process::exit(1);
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_cli(cli: Cli) -> CliResult {
    let device_dir = cli.get_device_dir();
    let json_output = cli.format == OutputFormat::Json;

    let level = Config::load(&device_dir)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "warn".to_string());
    init_tracing(&level);

    match cli.command {
        Commands::Init {
            log_url,
            origin,
            verifier_key,
            num_slots,
        } => cmd_init(&device_dir, &log_url, &origin, &verifier_key, num_slots, json_output)?,
        Commands::Serve { port, host } => cmd_serve(&device_dir, host, port, json_output)?,
        Commands::Update => cmd_update(&device_dir, json_output)?,
        Commands::Verify { bundle, firmware } => {
            cmd_verify(&device_dir, &bundle, firmware.as_deref(), json_output)?
        }
        Commands::Manifest {
            component,
            version,
            commit,
            tamago_version,
            firmware,
        } => cmd_manifest(component, version, &commit, tamago_version, &firmware, json_output)?,
        Commands::Checkpoint { action } => cmd_checkpoint(action, &device_dir, json_output)?,
        Commands::Directory => cmd_directory(&device_dir, json_output)?,
        Commands::Erase { yes } => cmd_erase(&device_dir, yes, json_output)?,
    }

    Ok(())
}

fn open_persistence(config: &Config, device_dir: &Path) -> Result<SlotPersistence<FilePartition>, Box<dyn Error>> {
    let partition = FilePartition::open_dir(
        &config.storage_dir(device_dir),
        config.storage.num_slots,
        config.storage.slot_size,
    )?;
    let persistence = SlotPersistence::new(partition);
    persistence.init()?;
    Ok(persistence)
}

fn build_updater(config: &Config, device_dir: &Path) -> Result<DeviceUpdater, Box<dyn Error>> {
    let verifier = BundleVerifier::from_vkey(&config.log.origin, &config.log.verifier_key)?;
    let client = HttpLogClient::new(&config.log.url, config.log_timeout())?;
    let fetcher = UpdateFetcher::new(client, verifier.checkpoints().clone());
    let installer = DirectoryInstaller::new(config.install_dir(device_dir));
    installer.init()?;
    Ok(Updater::new(installer, fetcher, verifier).with_state_file(config.state_path(device_dir)))
}

fn cmd_init(
    device_dir: &Path,
    log_url: &str,
    origin: &str,
    verifier_key: &str,
    num_slots: u32,
    json: bool,
) -> CliResult {
    if device_dir.join(witness_core::engine::config::CONFIG_FILE).exists() {
        return Err(format!("Device already initialized: {}", device_dir.display()).into());
    }
    // Reject a key the updater could never use.
    BundleVerifier::from_vkey(origin, verifier_key)?;

    std::fs::create_dir_all(device_dir)?;
    let mut config = Config::default_for_device(log_url, origin, verifier_key);
    config.storage.num_slots = num_slots;
    config.validate()?;
    config.save(device_dir)?;

    let persistence = open_persistence(&config, device_dir)?;
    DirectoryInstaller::new(config.install_dir(device_dir)).init()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "device_dir": device_dir.display().to_string(),
                "free_slots": persistence.free_slots()?,
            })
        );
    } else {
        CliFormatter::success(&format!("Initialized witness device in {}", device_dir.display()));
        CliFormatter::kv("Log", &format!("{} ({})", origin, log_url));
        CliFormatter::kv("Slots", &format!("{} free of {}", persistence.free_slots()?, num_slots));
        CliFormatter::info("Run `witness-cli serve` to start the update loop");
    }

    Ok(())
}

#[tokio::main]
async fn cmd_serve(device_dir: &Path, host: Option<String>, port: Option<u16>, json: bool) -> CliResult {
    let config = Config::load(device_dir)?;
    let persistence = Arc::new(open_persistence(&config, device_dir)?);
    let updater = build_updater(&config, device_dir)?;
    if updater.local().take_reboot_request()? {
        tracing::info!("Restarted after firmware update");
    }

    let app = create_router(ApiState {
        persistence,
        update: updater.state(),
    });
    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| config.api.host.clone()),
        port.unwrap_or(config.api.port)
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    if !json {
        CliFormatter::header("Witness Device");
        CliFormatter::kv("Log", &config.log.url);
        CliFormatter::kv("Update interval", &format_duration(config.update.interval_secs));
        CliFormatter::kv("Listening", &format!("http://{}", addr));
        CliFormatter::info("Press Ctrl+C to stop");
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let report = run_update_loop(&updater, config.update_interval(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    let _ = stop_tx.send(());
    server.await??;

    match report {
        Some(report) => {
            print_report(&report, json)?;
            if !json {
                CliFormatter::warning("Firmware installed, restart the device to run it");
            }
        }
        None if !json => CliFormatter::info("Stopped"),
        None => {}
    }
    Ok(())
}

#[tokio::main]
async fn cmd_update(device_dir: &Path, json: bool) -> CliResult {
    let config = Config::load(device_dir)?;
    let updater = build_updater(&config, device_dir)?;
    let report = updater.cycle().await?;
    print_report(&report, json)
}

fn print_report(report: &UpdateReport, json: bool) -> CliResult {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    CliFormatter::header("Firmware Update");
    CliFormatter::outcome("OS", &report.os);
    CliFormatter::outcome("Applet", &report.applet);
    if report.rebooted {
        CliFormatter::success("Reboot requested");
    } else if report.os.is_failed() || report.applet.is_failed() {
        CliFormatter::warning("Update finished with failures");
    } else {
        CliFormatter::success("Firmware is up to date");
    }
    Ok(())
}

fn cmd_verify(device_dir: &Path, bundle_path: &Path, firmware: Option<&Path>, json: bool) -> CliResult {
    let config = Config::load(device_dir)?;
    let verifier = BundleVerifier::from_vkey(&config.log.origin, &config.log.verifier_key)?;

    let mut bundle: Bundle = serde_json::from_slice(&std::fs::read(bundle_path)?)?;
    if let Some(path) = firmware {
        bundle.firmware = Some(std::fs::read(path)?);
    }

    let manifest = match verifier.verify(&bundle) {
        Ok(manifest) => manifest,
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({ "valid": false, "error": e.to_string() }));
            }
            return Err(e.into());
        }
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "valid": true,
                "index": bundle.index,
                "manifest": manifest,
            })
        );
    } else {
        CliFormatter::success("Bundle verified");
        CliFormatter::kv("Component", &manifest.component);
        CliFormatter::kv("Version", &manifest.git_tag_name.to_string());
        CliFormatter::kv("Commit", &manifest.git_commit_fingerprint);
        CliFormatter::kv("Log index", &bundle.index.to_string());
        CliFormatter::kv("Digest", &hex::encode(&manifest.firmware_digest_sha256));
    }
    Ok(())
}

fn cmd_manifest(
    component: Component,
    version: Version,
    commit: &str,
    tamago_version: Version,
    firmware: &Path,
    json: bool,
) -> CliResult {
    let image = std::fs::read(firmware)?;
    let manifest = Manifest {
        component: component.id().to_string(),
        git_tag_name: version,
        git_commit_fingerprint: commit.to_string(),
        firmware_digest_sha256: Sha256::digest(&image).to_vec(),
        tamago_version,
    };

    if !json {
        eprintln!(
            "{} digest of {} ({})",
            component,
            firmware.display(),
            format_size(image.len() as u64)
        );
    }
    // The manifest is the command's output in both formats.
    println!("{}", String::from_utf8(manifest.to_json()?)?);
    Ok(())
}

fn cmd_checkpoint(action: CheckpointAction, device_dir: &Path, json: bool) -> CliResult {
    let config = Config::load(device_dir)?;
    let persistence = open_persistence(&config, device_dir)?;

    match action {
        CheckpointAction::Get { log_id } => {
            let checkpoint = persistence.latest(&log_id)?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "log_id": log_id,
                        "checkpoint": String::from_utf8_lossy(&checkpoint),
                    })
                );
            } else {
                print!("{}", String::from_utf8_lossy(&checkpoint));
            }
        }
        CheckpointAction::Put { log_id, file } => {
            let data = std::fs::read(&file)?;
            let len = data.len();
            persistence.update(&log_id, move |_| Ok::<_, Infallible>(data))?;
            let slot = persistence.log_ids()?.get(&log_id).copied();
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "success": true, "log_id": log_id, "slot": slot })
                );
            } else {
                CliFormatter::success(&format!(
                    "Stored {} checkpoint for {}",
                    format_size(len as u64),
                    log_id
                ));
            }
        }
    }
    Ok(())
}

fn cmd_directory(device_dir: &Path, json: bool) -> CliResult {
    let config = Config::load(device_dir)?;
    let persistence = open_persistence(&config, device_dir)?;
    let entries = persistence.log_ids()?;
    let free = persistence.free_slots()?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "logs": entries, "free_slots": free })
        );
        return Ok(());
    }

    CliFormatter::header("Slot Directory");
    if entries.is_empty() {
        CliFormatter::item("(no logs)");
    } else {
        CliFormatter::table_header(&["Slot", "Log"]);
        for (log_id, slot) in &entries {
            CliFormatter::table_row(&[format!("{:>4}", slot).as_str(), log_id.as_str()]);
        }
    }
    CliFormatter::kv("Free slots", &free.to_string());
    Ok(())
}

fn cmd_erase(device_dir: &Path, yes: bool, json: bool) -> CliResult {
    if !yes {
        return Err("Refusing to erase without --yes".into());
    }
    let config = Config::load(device_dir)?;
    let partition = FilePartition::open_dir(
        &config.storage_dir(device_dir),
        config.storage.num_slots,
        config.storage.slot_size,
    )?;
    partition.erase()?;

    if json {
        println!("{}", serde_json::json!({ "success": true }));
    } else {
        CliFormatter::success(&format!("Erased {} slots", partition.num_slots()));
    }
    Ok(())
}
