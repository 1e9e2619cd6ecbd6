/*!
Tidemark CLI - Command-line interface for Tidemark backups and migrations.

This CLI drives the backup orchestrator and migration runner against a
file-backed document store: creating, listing, downloading, uploading,
verifying and deleting backup archives, rolling the store back, and
applying pending migrations.
*/

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tidemark_core::migration::StepStatus;
use tidemark_core::observability::{gather_metrics, init_observability};
use tidemark_core::{
    builtin_registry, uploader_from_config, BackupOptions, BackupOrchestrator, FileDocumentStore,
    LifecycleConfig, MigrationRunner, OperationLock, RemoteConfig, RemoteStatus,
    ARCHIVE_MIME_TYPE,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Backups, rollbacks and migrations for a Tidemark document store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "TIDEMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory holding data/, backups/ and assets/ (ignored with --config)
    #[arg(short, long, global = true, env = "TIDEMARK_ROOT", default_value = ".tidemark")]
    root: PathBuf,

    /// Remote destination for uploads, e.g. s3://bucket/prefix
    #[arg(long, global = true, env = "TIDEMARK_REMOTE")]
    remote: Option<String>,

    /// Milliseconds to wait for a running operation before failing
    #[arg(long, global = true, env = "TIDEMARK_LOCK_WAIT_MS")]
    lock_wait_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all backups, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Create a new backup of the live store
    Create {
        /// Also upload the archive to the configured remote
        #[arg(short, long)]
        upload: bool,
        /// Write a copy of the archive to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a backup archive to a file ("-" for stdout)
    Download {
        /// Backup name
        name: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Stage an archive file, optionally rolling back to it
    Upload {
        /// Archive file to upload
        file: PathBuf,
        /// Declared MIME type of the upload
        #[arg(long, default_value = ARCHIVE_MIME_TYPE)]
        mime: String,
        /// Restore the live store from the upload once staged
        #[arg(long)]
        rollback: bool,
    },
    /// Replace the live store with a stored backup
    Rollback {
        /// Backup name
        name: String,
    },
    /// Delete one or more backups
    Delete {
        /// Backup names
        #[arg(required = true)]
        names: Vec<String>,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Apply pending migrations
    Migrate {
        /// Only show which migrations are applied or pending
        #[arg(long)]
        status: bool,
    },
    /// Check that a backup would restore without touching the live store
    Verify {
        /// Backup name
        name: String,
    },
    /// Print lifecycle metrics in the Prometheus text format
    Metrics,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct MigrationRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Description")]
    description: String,
    #[tabled(rename = "Status")]
    status: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    init_observability(cli.json_logs, level)?;

    let config = load_config(&cli)?;
    let store = Arc::new(
        FileDocumentStore::open(&config.data_dir)
            .with_context(|| format!("opening store at {}", config.data_dir.display()))?,
    );
    let lock = Arc::new(OperationLock::new());

    let wants_remote = matches!(cli.command, Commands::Create { upload: true, .. });
    let mut orchestrator = BackupOrchestrator::from_config(config, store, lock)?;
    if wants_remote {
        let uploader = uploader_from_config(&orchestrator.config().remote)?
            .context("no remote configured; pass --remote s3://bucket/prefix")?;
        orchestrator = orchestrator.with_uploader(uploader);
    }

    run_command(&orchestrator, cli.command)
}

fn load_config(cli: &Cli) -> Result<LifecycleConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => LifecycleConfig::from_file(path)?,
        None => LifecycleConfig::with_root(&cli.root),
    };
    if let Some(uri) = &cli.remote {
        config.remote = RemoteConfig::from_uri(uri)?;
    }
    if let Some(wait) = cli.lock_wait_ms {
        config.lock_wait_ms = wait;
    }
    config.validate()?;
    Ok(config)
}

fn run_command(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    command: Commands,
) -> Result<(), anyhow::Error> {
    match command {
        Commands::List { json } => list_backups(orchestrator, json),
        Commands::Create { upload, output } => create_backup(orchestrator, upload, output),
        Commands::Download { name, output } => download_backup(orchestrator, &name, &output),
        Commands::Upload {
            file,
            mime,
            rollback,
        } => upload_backup(orchestrator, &file, &mime, rollback),
        Commands::Rollback { name } => {
            let report = orchestrator.rollback_to(&name)?;
            println!(
                "✓ Restored {} collection(s), {} document(s) from {}",
                report.import.collections.len(),
                report.import.documents,
                report.name
            );
            if report.assets_restored {
                println!("  Assets restored");
            }
            println!("  Run `tidemark migrate` to bring the restored data up to date");
            Ok(())
        }
        Commands::Delete { names, force } => delete_backups(orchestrator, &names, force),
        Commands::Migrate { status } => migrate(orchestrator, status),
        Commands::Verify { name } => {
            let manifest = orchestrator.verify_backup(&name)?;
            println!("✓ Backup {name} is restorable");
            println!("  Dump ID: {}", manifest.dump_id);
            println!("  Created: {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!(
                "  Collections: {} ({} documents)",
                manifest.collections.len(),
                manifest.total_documents()
            );
            Ok(())
        }
        Commands::Metrics => {
            print!("{}", gather_metrics()?);
            Ok(())
        }
    }
}

fn list_backups(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    json: bool,
) -> Result<(), anyhow::Error> {
    let archives = orchestrator.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&archives)?);
        return Ok(());
    }
    if archives.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let rows: Vec<BackupRow> = archives
        .into_iter()
        .map(|archive| BackupRow {
            created: archive.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            size: format_size(archive.size_bytes),
            name: archive.name,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn create_backup(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    upload: bool,
    output: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let created = orchestrator.create_backup(BackupOptions {
        upload_remote: upload,
    })?;

    println!(
        "✓ Created backup {} ({})",
        created.archive.name,
        format_size(created.archive.size_bytes)
    );
    match &created.remote {
        RemoteStatus::Skipped => {}
        RemoteStatus::Uploaded(object) => println!("  Uploaded to {}", object.location),
        RemoteStatus::Failed(reason) => {
            warn!(reason = %reason, "Remote upload failed");
            println!("  Remote upload failed: {reason}");
        }
    }
    for name in &created.pruned {
        println!("  Pruned {name}");
    }

    if let Some(path) = output {
        std::fs::write(&path, &created.bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("  Wrote {}", path.display());
    }
    Ok(())
}

fn download_backup(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    name: &str,
    output: &Path,
) -> Result<(), anyhow::Error> {
    let stream = orchestrator.download_stream(name)?;
    let written = if output == Path::new("-") {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        let written = stream.copy_to(&mut handle)?;
        handle.flush()?;
        written
    } else {
        let mut file = File::create(output)
            .with_context(|| format!("creating {}", output.display()))?;
        let written = stream.copy_to(&mut file)?;
        file.sync_all()?;
        eprintln!("✓ Wrote {} ({})", output.display(), format_size(written));
        written
    };
    info!(name, bytes = written, "Downloaded backup");
    Ok(())
}

fn upload_backup(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    file: &Path,
    mime: &str,
    rollback: bool,
) -> Result<(), anyhow::Error> {
    let mut reader = BufReader::new(
        File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );
    let handle = orchestrator.accept_upload_and_stage(&mut reader, mime)?;
    println!("✓ Staged {} as {handle}", file.display());

    if !rollback {
        // Staging does not outlive this process
        orchestrator.discard_staged(handle.as_str())?;
        println!("  Archive unpacked cleanly; pass --rollback to restore from it");
        return Ok(());
    }

    let report = orchestrator.rollback_to(handle.as_str())?;
    println!(
        "✓ Restored {} collection(s), {} document(s) from upload",
        report.import.collections.len(),
        report.import.documents
    );
    Ok(())
}

fn delete_backups(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    names: &[String],
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force {
        print!("Delete {} backup(s)? (y/N): ", names.len());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    let report = orchestrator.delete_backups(names)?;
    for name in &report.deleted {
        println!("✓ Deleted {name}");
    }
    for name in &report.missing {
        println!("  {name} was already absent");
    }
    Ok(())
}

fn migrate(
    orchestrator: &BackupOrchestrator<FileDocumentStore>,
    status_only: bool,
) -> Result<(), anyhow::Error> {
    let runner = MigrationRunner::new(
        Arc::clone(orchestrator.store()),
        Arc::new(builtin_registry()?),
        Arc::clone(orchestrator.lock()),
    )
    .with_lock_wait(orchestrator.config().lock_wait());

    if status_only {
        let rows: Vec<MigrationRow> = runner
            .status()?
            .into_iter()
            .map(|entry| MigrationRow {
                version: entry.version.to_string(),
                description: entry.description,
                status: match entry.status {
                    StepStatus::Applied(at) => format!("applied {}", at.format("%Y-%m-%d %H:%M:%S")),
                    StepStatus::Pending => "pending".to_string(),
                },
            })
            .collect();
        println!("{}", Table::new(rows));
        return Ok(());
    }

    let report = runner.run()?;
    if report.is_noop() {
        println!("✓ Up to date ({} migration(s) already applied)", report.already_applied);
        return Ok(());
    }
    for outcome in &report.applied {
        println!(
            "✓ Applied {} {} ({} document(s) changed)",
            outcome.version, outcome.description, outcome.documents_changed
        );
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_parses_delete_batch() {
        let cli = Cli::parse_from(["tidemark", "delete", "a", "b", "--force"]);
        match cli.command {
            Commands::Delete { names, force } => {
                assert_eq!(names, vec!["a", "b"]);
                assert!(force);
            }
            _ => panic!("expected delete"),
        }
    }

    #[test]
    fn test_remote_flag_overrides_root_config() {
        let cli = Cli::parse_from([
            "tidemark",
            "--root",
            "/tmp/tidemark-test",
            "--remote",
            "s3://backups/nightly",
            "list",
            "--json",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tidemark-test/data"));
        assert_eq!(config.remote.bucket.as_deref(), Some("backups"));
        assert_eq!(config.remote.prefix.as_deref(), Some("nightly"));
    }
}
