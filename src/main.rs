//! vaultlock CLI - Main entry point.

use anyhow::Context;
use std::process;
use tracing::{info, warn};
use vaultlock::cli::output::{self, AuditRow, OutputFormat, PolicyRow, SnapshotRow};
use vaultlock::cli::{AuditArgs, Cli, Commands, PolicyCommands, SnapshotCommands};
use vaultlock::config::VaultConfig;
use vaultlock::restore::RestoreOptions;
use vaultlock::scheduling::TickOutcome;
use vaultlock::shutdown::{ShutdownCoordinator, SignalHandler};
use vaultlock::types::TrackedObjectSet;
use vaultlock::worm::{AuditQuery, PolicySpec};
use vaultlock::{Vault, VaultError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(err) = run(cli).await {
        let code = err
            .downcast_ref::<VaultError>()
            .map(VaultError::exit_code)
            .unwrap_or(1);
        output::error(format!("{:#}", err));
        process::exit(code);
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<VaultConfig> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VaultConfig::default(),
    };

    if let Some(dir) = &cli.state_dir {
        config.storage.state_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }

    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Version = cli.command {
        println!("vaultlock {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = load_config(&cli)?;
    if let Commands::Sweep { purge: true } = cli.command {
        config.scheduler.enable_purge();
    }
    vaultlock::observability::init(&config.observability)?;

    if config.storage.state_dir.is_none() {
        warn!("No state directory configured; policies and snapshots live only for this process");
    }

    let vault = Vault::open(config).await?;
    let actor = cli.actor.as_str();
    let format = cli.output;

    match cli.command {
        Commands::Policy { command } => policy_command(&vault, command, actor, format).await?,
        Commands::Snapshot { command } => snapshot_command(&vault, command, actor, format).await?,

        Commands::Restore {
            snapshot,
            target,
            overwrite,
        } => {
            let options = RestoreOptions { overwrite };
            let result = vault.restore(snapshot, &target, options, actor).await?;
            match format {
                OutputFormat::Table => {
                    output::success(format!("Restored {} to {}", snapshot, result.location));
                    output::print_kv("Objects", result.objects_restored);
                    output::print_kv("Size", output::format_bytes(result.bytes_restored));
                    if result.overwritten {
                        output::warning(format!("Replaced existing target {}", result.target));
                    }
                }
                _ => output::print_single(&result, format)?,
            }
        }

        Commands::Audit(args) => audit_command(&vault, args, format).await?,

        Commands::Report { from, to } => {
            let to = to.unwrap_or_else(|| vault.clock().now());
            let from = from.unwrap_or(to - chrono::Duration::days(30));
            let report = vault.audit_report(from, to).await;
            output::print_single(&report, format)?;
        }

        Commands::Tick => {
            let report = vault.tick().await;
            match format {
                OutputFormat::Table => {
                    for tick in &report.policies {
                        match &tick.outcome {
                            TickOutcome::Created { snapshot_id } => output::success(format!(
                                "{}: captured {}",
                                tick.policy_name, snapshot_id
                            )),
                            TickOutcome::Failed { error, .. } => {
                                output::error(format!("{}: {}", tick.policy_name, error))
                            }
                            TickOutcome::AlreadyCaptured => output::print_kv(
                                &tick.policy_name,
                                format!("slot {} already captured", tick.slot),
                            ),
                            TickOutcome::Inactive => {
                                output::print_kv(&tick.policy_name, "schedule ended")
                            }
                        }
                    }
                }
                _ => output::print_single(&report, format)?,
            }
            if report.failures() > 0 {
                return Err(VaultError::CaptureFailed(format!(
                    "{} of {} policies failed to capture",
                    report.failures(),
                    report.policies.len()
                ))
                .into());
            }
        }

        Commands::Sweep { .. } => {
            let report = vault.sweep_expired().await?;
            match format {
                OutputFormat::Table => {
                    output::success(format!(
                        "{} expired, {} purged",
                        report.expired.len(),
                        report.purged.len()
                    ));
                    for (id, reason) in &report.failures {
                        output::warning(format!("{}: {}", id, reason));
                    }
                }
                _ => output::print_single(&report, format)?,
            }
        }

        Commands::Serve => {
            let coordinator = ShutdownCoordinator::new();
            let signals = SignalHandler::new(coordinator.clone());
            tokio::spawn(async move {
                if let Err(e) = signals.run().await {
                    tracing::error!(error = %e, "Signal handler failed");
                }
            });
            vault.serve(coordinator.subscribe()).await?;
            if coordinator.is_shutting_down() {
                info!("Shut down cleanly");
            }
        }

        Commands::Version => {}
    }

    Ok(())
}

async fn policy_command(
    vault: &Vault,
    command: PolicyCommands,
    actor: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        PolicyCommands::Create {
            name,
            interval,
            retention,
            set_name,
            objects,
            classification,
            hipaa,
            ends_at,
        } => {
            let mut tracked = TrackedObjectSet::new(set_name, objects)?;
            if let Some(classification) = classification {
                tracked = tracked.with_classification(classification);
            }

            let mut spec = match (hipaa, interval, retention) {
                (true, _, _) => PolicySpec::hipaa(name, tracked),
                (false, Some(interval), Some(retention)) => {
                    PolicySpec::new(name, interval, retention, tracked)
                }
                _ => {
                    return Err(VaultError::InvalidArgument(
                        "--interval and --retention are required".to_string(),
                    )
                    .into())
                }
            };
            if let Some(ends_at) = ends_at {
                spec = spec.with_end(ends_at);
            }

            let policy = vault.create_policy(spec, actor).await?;
            match format {
                OutputFormat::Table => {
                    output::success(format!("Created policy {} ({})", policy.name(), policy.id()))
                }
                _ => output::print_single(&policy, format)?,
            }
        }

        PolicyCommands::List => {
            let rows: Vec<PolicyRow> = vault.list_policies().await.iter().map(PolicyRow::from).collect();
            output::print_output(&rows, format)?;
        }

        PolicyCommands::Show { policy } => {
            let policy = vault.policy(&policy).await?;
            match format {
                OutputFormat::Table => {
                    let row = PolicyRow::from(&policy);
                    output::print_kv("ID", &row.id);
                    output::print_kv("Name", &row.name);
                    output::print_kv("Schedule", &row.schedule);
                    output::print_kv("Retention", &row.retention);
                    output::print_kv("Tracked", &row.tracked);
                    output::print_kv("Objects", policy.terms().tracked.objects().join(", "));
                    output::print_kv("Classification", &row.classification);
                    output::print_kv("Lock", output::lock_indicator(policy.is_locked()));
                }
                _ => output::print_single(&policy, format)?,
            }
        }

        PolicyCommands::Lock { policy } => {
            let id = vault.resolve_policy(&policy).await?;
            let locked = vault.engage_lock(id, actor).await?;
            output::success(format!(
                "Retention lock engaged on {}; snapshots created from now on cannot be deleted before expiry",
                locked.name()
            ));
        }

        PolicyCommands::SetRetention { policy, retention } => {
            let id = vault.resolve_policy(&policy).await?;
            let updated = vault.update_retention(id, retention, actor).await?;
            match format {
                OutputFormat::Table => output::success(format!(
                    "Retention of {} set to {}",
                    updated.name(),
                    PolicyRow::from(&updated).retention
                )),
                _ => output::print_single(&updated, format)?,
            }
        }
    }
    Ok(())
}

async fn snapshot_command(
    vault: &Vault,
    command: SnapshotCommands,
    actor: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let now = vault.clock().now();
    match command {
        SnapshotCommands::Create { policy } => {
            let id = vault.resolve_policy(&policy).await?;
            let snapshot = vault.create_snapshot(id, actor).await?;
            match format {
                OutputFormat::Table => output::success(format!(
                    "Captured snapshot {} ({}, expires {})",
                    snapshot.id(),
                    snapshot.state(),
                    snapshot.expires_at()
                )),
                _ => output::print_single(&snapshot, format)?,
            }
        }

        SnapshotCommands::List { policy } => {
            let snapshots = match policy {
                Some(policy) => {
                    let id = vault.resolve_policy(&policy).await?;
                    vault.list_snapshots(id).await?
                }
                None => vault.list_all_snapshots().await?,
            };
            let rows: Vec<SnapshotRow> = snapshots.iter().map(|s| SnapshotRow::new(s, now)).collect();
            output::print_output(&rows, format)?;
        }

        SnapshotCommands::Show { id } => {
            let snapshot = vault.get_snapshot(id).await?;
            output::print_single(&snapshot, format)?;
        }

        SnapshotCommands::Delete { id } => {
            let snapshot = vault.delete_snapshot(id, actor).await?;
            output::success(format!("Deleted snapshot {} of {}", snapshot.id(), snapshot.policy_name()));
        }
    }
    Ok(())
}

async fn audit_command(vault: &Vault, args: AuditArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut query = AuditQuery::new();
    if let Some(from) = args.from {
        query = query.from(from);
    }
    if let Some(to) = args.to {
        query = query.to(to);
    }
    if let Some(actor) = args.actor {
        query = query.actor(actor);
    }
    if let Some(event_type) = args.event_type {
        query = query.event_type(event_type);
    }
    if let Some(subject) = args.subject {
        query = query.subject(subject);
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }

    if args.export {
        println!("{}", vault.export_audit(&query).await?);
        return Ok(());
    }

    let events = vault.audit_events(&query).await;
    let rows: Vec<AuditRow> = events.iter().map(AuditRow::from).collect();
    output::print_output(&rows, format)?;
    if format == OutputFormat::Table && !events.is_empty() {
        output::print_kv("Events", events.len());
    }
    Ok(())
}
