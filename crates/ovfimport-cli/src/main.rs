//! ovfimport CLI - Import OVF/OVA packages into vSphere as templates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovfimport_core::ovf::parse_envelope;
use ovfimport_core::package::Package;
use ovfimport_core::{
    resolve_placement, virtual_machine_from_uuid, CancelToken, ConnectionConfig, ImportOptions,
    ImportPhase, ImportProgress, ImportRequest, Importer, VsphereClient,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Import OVF/OVA packages into vSphere as templates.
#[derive(Parser)]
#[command(name = "ovfimport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a package into a resource pool and datastore.
    Import {
        /// Path to the .ovf descriptor or .ova archive.
        package: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,

        /// Resource pool id (e.g. resgroup-8).
        #[arg(long)]
        resource_pool: String,

        /// Datastore id (e.g. datastore-11).
        #[arg(long)]
        datastore: String,

        /// Datacenter name or inventory path.
        #[arg(long)]
        datacenter: String,

        /// Destination folder inventory path. Empty means the datacenter VM folder.
        #[arg(long, default_value = "")]
        folder: String,

        /// Name for the imported template. Defaults to the descriptor's name.
        #[arg(short, long)]
        name: Option<String>,

        /// Map a declared network to an inventory network.
        #[arg(long = "network", value_name = "SOURCE=TARGET", value_parser = parse_network_override)]
        networks: Vec<(String, String)>,

        /// Seconds to wait for the lease to become ready.
        #[arg(long, default_value = "300")]
        lease_timeout: u64,

        /// Abort the whole import after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip manifest and disk format checks.
        #[arg(long)]
        skip_verify: bool,

        /// Leave the import as a virtual machine instead of a template.
        #[arg(long)]
        keep_as_vm: bool,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a package without connecting.
    Inspect {
        /// Path to the .ovf descriptor or .ova archive.
        package: PathBuf,
    },

    /// Find a virtual machine or template by BIOS UUID.
    Lookup {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// BIOS UUID to search for.
        #[arg(long)]
        uuid: String,
    },
}

/// Server connection settings.
#[derive(Args)]
struct ConnectionArgs {
    /// vCenter or ESXi server name or URL.
    #[arg(long, env = "VSPHERE_SERVER")]
    server: String,

    /// User name.
    #[arg(long, env = "VSPHERE_USER")]
    user: String,

    /// Password.
    #[arg(long, env = "VSPHERE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Accept unverified TLS certificates.
    #[arg(long, env = "VSPHERE_ALLOW_UNVERIFIED_SSL")]
    insecure: bool,
}

impl ConnectionArgs {
    fn connect(&self) -> Result<VsphereClient> {
        let config = ConnectionConfig::new(&self.server, &self.user, &self.password)
            .with_insecure(self.insecure);
        VsphereClient::connect(config).with_context(|| format!("failed to connect to {}", self.server))
    }
}

/// Parse a `SOURCE=TARGET` network override.
fn parse_network_override(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((source, target)) if !source.trim().is_empty() && !target.trim().is_empty() => {
            Ok((source.trim().to_string(), target.trim().to_string()))
        }
        _ => Err(format!("expected SOURCE=TARGET, got '{}'", value)),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "ovfimport=info,ovfimport_core=info",
        1 => "ovfimport=debug,ovfimport_core=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Import {
            package,
            connection,
            resource_pool,
            datastore,
            datacenter,
            folder,
            name,
            networks,
            lease_timeout,
            timeout,
            skip_verify,
            keep_as_vm,
            quiet,
        } => {
            let options = ImportOptions {
                lease_ready_timeout: Duration::from_secs(lease_timeout),
                verify_manifest: !skip_verify,
                check_disk_format: !skip_verify,
                mark_as_template: !keep_as_vm,
                ..ImportOptions::default()
            };

            let client = connection.connect()?;
            let placement = resolve_placement(&client, &resource_pool, &datastore, &datacenter, &folder)
                .context("failed to resolve placement")?;

            let mut request = ImportRequest::new(&package, placement);
            if let Some(name) = name {
                request = request.with_entity_name(name);
            }
            for (source, target) in networks {
                request = request.with_network_override(source, target);
            }

            let cancel = match timeout {
                Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
                None => CancelToken::new(),
            };

            let result = run_import(&client, &request, options, &cancel, quiet);
            if let Err(e) = client.logout() {
                tracing::warn!(error = %e, "logout failed");
            }
            result?;
        }
        Commands::Inspect { package } => {
            show_info(&package)?;
        }
        Commands::Lookup { connection, uuid } => {
            let client = connection.connect()?;
            let vm = virtual_machine_from_uuid(&client, &uuid)
                .with_context(|| format!("lookup of UUID {} failed", uuid));
            if let Err(e) = client.logout() {
                tracing::warn!(error = %e, "logout failed");
            }
            println!("{}", vm?.reference());
        }
    }

    Ok(())
}

fn run_import(
    client: &VsphereClient,
    request: &ImportRequest,
    options: ImportOptions,
    cancel: &CancelToken,
    quiet: bool,
) -> Result<()> {
    let mut importer = Importer::new(client, client).with_options(options);

    // Set up progress tracking
    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    if let Some(pb) = progress_bar.clone() {
        importer = importer.with_progress(Arc::new(move |progress: ImportProgress| {
            if progress.bytes_total > 0 {
                pb.set_length(progress.bytes_total);
            }
            pb.set_position(progress.bytes_processed);
            pb.set_message(phase_message(&progress));
        }));
    }

    info!(package = %request.descriptor_path.display(), "starting import");
    let result = importer.import_template(request, cancel);

    if let Some(pb) = progress_bar {
        match &result {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(_) => pb.abandon_with_message("Failed"),
        }
    }

    match result {
        Ok(outcome) => {
            if !quiet {
                println!();
                println!("Import completed successfully");
                if let Some(entity) = &outcome.entity {
                    println!("Entity:    {}", entity);
                }
                for url in &outcome.urls {
                    println!("Uploaded:  {}", url);
                }
            }
            Ok(())
        }
        Err(e) => {
            for url in &e.partial_urls {
                eprintln!("Uploaded before failure: {}", url);
            }
            Err(e.into())
        }
    }
}

fn phase_message(progress: &ImportProgress) -> String {
    match progress.phase {
        ImportPhase::Uploading if progress.total_items > 1 => format!(
            "Uploading file {}/{}",
            progress.current_item.max(1),
            progress.total_items
        ),
        phase => format!("{}...", phase),
    }
}

fn show_info(path: &Path) -> Result<()> {
    let package = Package::open(path)?;
    let envelope = parse_envelope(package.descriptor())?;

    println!("Package Information");
    println!("===================");
    println!();
    println!("Descriptor: {}", package.descriptor_name());
    println!("Format:     {}", if package.is_archive() { "OVA" } else { "OVF" });
    if let Some(name) = envelope.system_name() {
        println!("Name:       {}", name);
    }
    if let Some(system) = envelope.virtual_systems.first() {
        if let Some(os) = &system.os_type {
            println!("Guest OS:   {}", os);
        }
        println!("CPUs:       {}", system.cpu_count());
        if let Some(memory) = system.memory_mb() {
            println!("Memory:     {} MB", memory);
        }
    }
    println!();

    if envelope.networks.is_empty() {
        println!("Networks:   None");
    } else {
        println!("Networks:");
        for network in &envelope.networks {
            match &network.description {
                Some(description) => println!("  - {} ({})", network.name, description),
                None => println!("  - {}", network.name),
            }
        }
    }
    println!();

    if envelope.references.is_empty() {
        println!("Files:      None");
    } else {
        println!("Files:");
        for (i, file) in envelope.references.iter().enumerate() {
            let size = file.size.map(format_bytes).unwrap_or_else(|| "unknown size".to_string());
            let format = match envelope.disk_for_href(&file.href) {
                Some(disk) if disk.is_stream_optimized() => " (streamOptimized disk)",
                Some(_) => " (disk)",
                None => "",
            };
            println!("  {}. {} - {}{}", i + 1, file.href, size, format);
        }
        println!();
        println!("Total size: {}", format_bytes(envelope.total_declared_size()));
    }

    match package.manifest() {
        Some(manifest) => println!("Manifest:   {} entries", manifest.entries.len()),
        None => println!("Manifest:   None"),
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_override() {
        assert_eq!(
            parse_network_override("VM Network=prod-vlan-12").unwrap(),
            ("VM Network".to_string(), "prod-vlan-12".to_string())
        );
        assert!(parse_network_override("no-separator").is_err());
        assert!(parse_network_override("=target").is_err());
        assert!(parse_network_override("source=").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_cli_parses_import() {
        let cli = Cli::try_parse_from([
            "ovfimport",
            "import",
            "appliance.ova",
            "--server",
            "vc.example.com",
            "--user",
            "admin",
            "--password",
            "secret",
            "--resource-pool",
            "resgroup-8",
            "--datastore",
            "datastore-11",
            "--datacenter",
            "dc1",
            "--network",
            "VM Network=prod",
        ])
        .expect("arguments should parse");

        match cli.command {
            Commands::Import {
                networks, folder, ..
            } => {
                assert_eq!(networks, vec![("VM Network".to_string(), "prod".to_string())]);
                assert_eq!(folder, "");
            }
            _ => panic!("expected import command"),
        }
    }
}
