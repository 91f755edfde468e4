mod keyfile;
mod state;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use time::Duration;
use turnstile_core::{
    credential, Credential, DeviceBinding, GateSignal, Keyring, OfflineManifest, PolicySet,
    ScanMode, ScanOutcome, ScanRequest, Ticket,
};
use turnstile_offline::{
    build_manifest, export_batch, verify_manifest, OfflineValidator, ScanLogFile, SignedLogBatch,
};
use turnstile_reconcile::{reconcile, render_report};
use turnstile_storage::{OnlineValidator, ScanStorage};

use keyfile::KeyFile;
use state::VenueState;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Exit codes for scan subcommands, so gate wrappers can branch on them.
const EXIT_DENY: i32 = 2;
const EXIT_REVIEW: i32 = 3;
const EXIT_RETRY: i32 = 4;

/// Turnstile venue admission toolchain.
#[derive(Parser)]
#[command(name = "turnstile", version, about = "Turnstile venue admission toolchain")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store signing keys
    Keygen {
        #[command(subcommand)]
        command: KeygenCommands,
    },

    /// Manage tickets in the venue state
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },

    /// Register a scanning device
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// Set per-event admission policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Issue a signed, short-lived credential for a ticket
    Issue {
        /// Ticket id to issue for
        ticket_id: String,
        #[arg(long)]
        event: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        venue: String,
        /// Credential lifetime in seconds
        #[arg(long, default_value = "30")]
        ttl: i64,
        /// Key file holding the tenant signing key
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
        /// Write the credential here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a credential online against the venue state
    /// (exit 0 allow, 2 deny, 3 review, 4 retry)
    Scan {
        /// Path to the credential JSON
        credential: PathBuf,
        #[arg(long)]
        device: String,
        #[arg(long)]
        staff: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },

    /// Build or verify offline manifests
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },

    /// Offline device operations: scan against a cached manifest, export logs
    Offline {
        #[command(subcommand)]
        command: OfflineCommands,
    },

    /// Merge uploaded offline log batches into authoritative state
    Reconcile {
        /// Event to reconcile
        event_id: String,
        /// Signed log batch JSON files
        batches: Vec<PathBuf>,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
}

#[derive(Subcommand)]
enum KeygenCommands {
    /// Generate a tenant signing key
    Tenant {
        tenant_id: String,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },
    /// Generate a device batch-signing key
    Device {
        device_id: String,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },
}

#[derive(Subcommand)]
enum TicketCommands {
    /// Add a valid ticket
    Add {
        ticket_id: String,
        #[arg(long)]
        event: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        venue: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
    /// Administratively void a ticket
    Void {
        ticket_id: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
    /// Administratively reinstate a used or void ticket
    Reinstate {
        ticket_id: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
    /// Show a ticket record
    Show {
        ticket_id: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// Register a device with its tenant/venue binding
    Add {
        device_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        venue: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
        /// Key file; when the device has a batch key there, its verifying
        /// key is registered for offline log uploads
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Set the rule set for an event
    Set {
        event_id: String,
        #[arg(long)]
        reentry_allowed: bool,
        #[arg(long)]
        max_admissions: Option<u64>,
        #[arg(long)]
        require_review: bool,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Snapshot the still-valid tickets for an event into a signed manifest
    Build {
        event_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        venue: String,
        #[arg(long, default_value = "turnstile-state.json")]
        state: PathBuf,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
        /// Write the manifest here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify a manifest signature against the tenant key
    Verify {
        manifest: PathBuf,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },
}

#[derive(Subcommand)]
enum OfflineCommands {
    /// Validate a credential against a cached manifest, appending to the
    /// device log (exit 0 allow, 2 deny, 3 review, 4 retry)
    Scan {
        /// Path to the credential JSON
        credential: PathBuf,
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        device: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        venue: String,
        #[arg(long)]
        staff: String,
        /// Device-local append-only scan log
        #[arg(long, default_value = "turnstile-offline.jsonl")]
        log: PathBuf,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
    },
    /// Sign the device log as an uploadable batch
    Export {
        #[arg(long)]
        device: String,
        #[arg(long)]
        event: String,
        #[arg(long, default_value = "turnstile-offline.jsonl")]
        log: PathBuf,
        #[arg(long, default_value = "turnstile-keys.json")]
        keys: PathBuf,
        /// Write the batch here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = run(cli).unwrap_or_else(|message| {
        eprintln!("error: {message}");
        1
    });
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32, String> {
    let output = cli.output;
    match cli.command {
        Commands::Keygen { command } => cmd_keygen(command),
        Commands::Ticket { command } => cmd_ticket(command, output),
        Commands::Device { command } => cmd_device(command),
        Commands::Policy { command } => cmd_policy(command),
        Commands::Issue {
            ticket_id,
            event,
            tenant,
            venue,
            ttl,
            keys,
            out,
        } => cmd_issue(&ticket_id, &event, &tenant, &venue, ttl, &keys, out.as_deref()),
        Commands::Scan {
            credential,
            device,
            staff,
            state,
            keys,
        } => cmd_scan(&credential, &device, &staff, &state, &keys, output),
        Commands::Manifest { command } => cmd_manifest(command, output),
        Commands::Offline { command } => cmd_offline(command, output),
        Commands::Reconcile {
            event_id,
            batches,
            state,
        } => cmd_reconcile(&event_id, &batches, &state, output),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("tokio runtime: {e}"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("{what} {}: {e}", path.display()))?;
    serde_json::from_str(&contents).map_err(|e| format!("{what} {}: {e}", path.display()))
}

fn emit_json<T: serde::Serialize>(value: &T, out: Option<&Path>) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    match out {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| format!("{}: {e}", path.display()))
        }
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn cmd_keygen(command: KeygenCommands) -> Result<i32, String> {
    match command {
        KeygenCommands::Tenant { tenant_id, keys } => {
            let mut file = KeyFile::load(&keys)?;
            let verifying = file.generate_tenant(&tenant_id);
            file.save(&keys)?;
            println!("tenant {tenant_id} verifying key: {verifying}");
        }
        KeygenCommands::Device { device_id, keys } => {
            let mut file = KeyFile::load(&keys)?;
            let verifying = file.generate_device(&device_id);
            file.save(&keys)?;
            println!("device {device_id} batch verifying key: {verifying}");
        }
    }
    Ok(0)
}

fn cmd_ticket(command: TicketCommands, output: OutputFormat) -> Result<i32, String> {
    let rt = runtime()?;
    match command {
        TicketCommands::Add {
            ticket_id,
            event,
            tenant,
            venue,
            state,
        } => {
            with_storage(&state, |storage| {
                rt.block_on(storage.insert_ticket(Ticket::valid(&ticket_id, &event, &tenant, &venue)))
                    .map_err(|e| e.to_string())
            })?;
            println!("ticket {ticket_id} added");
            Ok(0)
        }
        TicketCommands::Void { ticket_id, state } => {
            with_storage(&state, |storage| {
                rt.block_on(storage.void_ticket(&ticket_id)).map_err(|e| e.to_string())
            })?;
            println!("ticket {ticket_id} voided");
            Ok(0)
        }
        TicketCommands::Reinstate { ticket_id, state } => {
            with_storage(&state, |storage| {
                rt.block_on(storage.reinstate_ticket(&ticket_id))
                    .map_err(|e| e.to_string())
            })?;
            println!("ticket {ticket_id} reinstated");
            Ok(0)
        }
        TicketCommands::Show { ticket_id, state } => {
            let venue_state = VenueState::load(&state)?;
            let storage = venue_state.open_storage()?;
            let ticket = rt
                .block_on(storage.get_ticket(&ticket_id))
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("ticket not found: {ticket_id}"))?;
            match output {
                OutputFormat::Json => emit_json(&ticket, None)?,
                OutputFormat::Text => println!(
                    "ticket {} event {} status {:?} used_by {}",
                    ticket.id,
                    ticket.event_id,
                    ticket.status,
                    ticket.used_by_scan_id.as_deref().unwrap_or("-")
                ),
            }
            Ok(0)
        }
    }
}

/// Load the venue state, run one storage mutation, and persist the result.
fn with_storage<F>(state_path: &Path, op: F) -> Result<(), String>
where
    F: FnOnce(&turnstile_storage::MemoryStorage) -> Result<(), String>,
{
    let mut venue_state = VenueState::load(state_path)?;
    let storage = venue_state.open_storage()?;
    op(&storage)?;
    venue_state.storage = storage.snapshot().map_err(|e| e.to_string())?;
    venue_state.save(state_path)
}

fn cmd_device(command: DeviceCommands) -> Result<i32, String> {
    match command {
        DeviceCommands::Add {
            device_id,
            tenant,
            venue,
            state,
            keys,
        } => {
            let key_file = KeyFile::load(&keys)?;
            let batch_verifying_key = key_file.device_verifying_key(&device_id).ok();
            let mut venue_state = VenueState::load(&state)?;
            venue_state.devices.retain(|b| b.device_id != device_id);
            venue_state.devices.push(DeviceBinding {
                device_id: device_id.clone(),
                tenant_id: tenant,
                venue_id: venue,
                batch_verifying_key,
            });
            venue_state.save(&state)?;
            println!("device {device_id} registered");
            Ok(0)
        }
    }
}

fn cmd_policy(command: PolicyCommands) -> Result<i32, String> {
    match command {
        PolicyCommands::Set {
            event_id,
            reentry_allowed,
            max_admissions,
            require_review,
            state,
        } => {
            let mut venue_state = VenueState::load(&state)?;
            venue_state.policies.insert(
                event_id.clone(),
                PolicySet {
                    reentry_allowed,
                    max_admissions,
                    require_review,
                },
            );
            venue_state.save(&state)?;
            println!("policy for {event_id} updated");
            Ok(0)
        }
    }
}

fn cmd_issue(
    ticket_id: &str,
    event: &str,
    tenant: &str,
    venue: &str,
    ttl: i64,
    keys: &Path,
    out: Option<&Path>,
) -> Result<i32, String> {
    let keyring: Keyring = KeyFile::load(keys)?.keyring()?;
    let cred = credential::issue(
        ticket_id,
        event,
        tenant,
        venue,
        Duration::seconds(ttl),
        &keyring,
    )
    .map_err(|e| e.to_string())?;
    emit_json(&cred, out)?;
    Ok(0)
}

fn signal_exit(outcome: &ScanOutcome, output: OutputFormat) -> Result<i32, String> {
    match output {
        OutputFormat::Json => emit_json(outcome, None)?,
        OutputFormat::Text => match &outcome.signal {
            GateSignal::Allow => println!("ALLOW (scan {})", outcome.scan_id),
            GateSignal::Deny { reason_code } => {
                println!("DENY {reason_code} (scan {})", outcome.scan_id)
            }
            GateSignal::Review { reason_code } => {
                println!("REVIEW {reason_code} (scan {})", outcome.scan_id)
            }
            GateSignal::Retry { correlation_id } => {
                println!("RETRY (correlation {correlation_id})")
            }
        },
    }
    Ok(match outcome.signal {
        GateSignal::Allow => 0,
        GateSignal::Deny { .. } => EXIT_DENY,
        GateSignal::Review { .. } => EXIT_REVIEW,
        GateSignal::Retry { .. } => EXIT_RETRY,
    })
}

fn cmd_scan(
    credential_path: &Path,
    device: &str,
    staff: &str,
    state_path: &Path,
    keys: &Path,
    output: OutputFormat,
) -> Result<i32, String> {
    let cred: Credential = read_json(credential_path, "credential")?;
    let keyring = KeyFile::load(keys)?.keyring()?;
    let mut venue_state = VenueState::load(state_path)?;

    let storage = Arc::new(venue_state.open_storage()?);
    let validator = OnlineValidator::new(
        storage.clone(),
        venue_state.registry(),
        venue_state.policy_engine(),
        Arc::new(keyring),
    );
    let request = ScanRequest {
        device_id: device.to_string(),
        staff_user_id: staff.to_string(),
        credential: cred,
        mode: ScanMode::Online,
        deadline: None,
    };

    let outcome = runtime()?.block_on(validator.scan(&request));

    venue_state.storage = storage.snapshot().map_err(|e| e.to_string())?;
    venue_state.save(state_path)?;
    signal_exit(&outcome, output)
}

fn cmd_manifest(command: ManifestCommands, output: OutputFormat) -> Result<i32, String> {
    match command {
        ManifestCommands::Build {
            event_id,
            tenant,
            venue,
            state,
            keys,
            out,
        } => {
            let keyring = KeyFile::load(&keys)?.keyring()?;
            let mut venue_state = VenueState::load(&state)?;
            let storage = venue_state.open_storage()?;

            let manifest = runtime()?
                .block_on(build_manifest(&event_id, &tenant, &venue, &storage, &keyring))
                .map_err(|e| e.to_string())?;

            venue_state.storage = storage.snapshot().map_err(|e| e.to_string())?;
            venue_state.save(&state)?;
            match output {
                OutputFormat::Json => emit_json(&manifest, out.as_deref())?,
                OutputFormat::Text => {
                    emit_json(&manifest, out.as_deref())?;
                    eprintln!(
                        "manifest v{} for {}: {} valid tickets",
                        manifest.version,
                        manifest.event_id,
                        manifest.valid_ticket_ids.len()
                    );
                }
            }
            Ok(0)
        }
        ManifestCommands::Verify { manifest, keys } => {
            let parsed: OfflineManifest = read_json(&manifest, "manifest")?;
            let trust = KeyFile::load(&keys)?.trust_store()?;
            let key = turnstile_core::KeyProvider::verifying_key(&trust, &parsed.tenant_id)
                .map_err(|e| e.to_string())?;
            verify_manifest(&parsed, &key).map_err(|e| e.to_string())?;
            println!(
                "manifest v{} for {} verified ({} tickets)",
                parsed.version,
                parsed.event_id,
                parsed.valid_ticket_ids.len()
            );
            Ok(0)
        }
    }
}

fn cmd_offline(command: OfflineCommands, output: OutputFormat) -> Result<i32, String> {
    match command {
        OfflineCommands::Scan {
            credential: credential_path,
            manifest,
            device,
            tenant,
            venue,
            staff,
            log,
            keys,
        } => {
            let cred: Credential = read_json(&credential_path, "credential")?;
            let parsed: OfflineManifest = read_json(&manifest, "manifest")?;
            let trust = KeyFile::load(&keys)?.trust_store()?;
            let binding = DeviceBinding {
                device_id: device,
                tenant_id: tenant,
                venue_id: venue,
                batch_verifying_key: None,
            };
            let validator = OfflineValidator::load(
                parsed,
                binding,
                trust,
                PolicySet::default(),
                ScanLogFile::new(log),
            )
            .map_err(|e| e.to_string())?;

            let outcome = runtime()?.block_on(validator.scan(&staff, cred));
            signal_exit(&outcome, output)
        }
        OfflineCommands::Export {
            device,
            event,
            log,
            keys,
            out,
        } => {
            let device_key = KeyFile::load(&keys)?.device_key(&device)?;
            let attempts = ScanLogFile::new(log).load().map_err(|e| e.to_string())?;
            let batch =
                export_batch(&device, &event, attempts, &device_key).map_err(|e| e.to_string())?;
            emit_json(&batch, out.as_deref())?;
            eprintln!(
                "batch {} with {} attempts",
                batch.batch_id,
                batch.attempts.len()
            );
            Ok(0)
        }
    }
}

fn cmd_reconcile(
    event_id: &str,
    batch_paths: &[PathBuf],
    state_path: &Path,
    output: OutputFormat,
) -> Result<i32, String> {
    let mut batches: Vec<SignedLogBatch> = Vec::new();
    for path in batch_paths {
        batches.push(read_json(path, "log batch")?);
    }
    let mut venue_state = VenueState::load(state_path)?;
    let storage = venue_state.open_storage()?;
    let registry = venue_state.registry();

    let record = runtime()?
        .block_on(reconcile(event_id, &batches, &storage, &registry))
        .map_err(|e| e.to_string())?;

    venue_state.storage = storage.snapshot().map_err(|e| e.to_string())?;
    venue_state.save(state_path)?;

    match output {
        OutputFormat::Json => emit_json(&record, None)?,
        OutputFormat::Text => print!("{}", render_report(&record)),
    }
    Ok(0)
}
