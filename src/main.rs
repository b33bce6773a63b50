mod cli;
mod compute;
mod config;
mod context;
mod error;
#[cfg(test)]
mod fake;
mod health;
mod jobs;
mod models;
mod reconcile;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{
    Command, FirewallCommand, FleetCommand, FleetStartArgs, FleetStatusArgs, FleetStopArgs,
    ImagesArgs, OperationsCommand, OperationsWaitArgs,
};
use crate::compute::ComputeApi;
use crate::config::{FleetConfig, FleetFile, Profile};
use crate::context::{gate, FleetContext};
use crate::error::CloudError;
use crate::health::HealthChecker;
use crate::jobs::{JobQueue, JobStatus};
use crate::models::{last_segment, InstanceStatus, Operation, OperationStatus};
use crate::reconcile::{
    ensure_firewall, fleet_firewall, list_fleet, qualify_network, resolve_image, scale, teardown,
    wait_for_operations, ApplyReport, WaitReport,
};

const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const JOB_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> ExitCode {
    let directive = match "info".parse() {
        Ok(directive) => directive,
        Err(err) => {
            eprintln!("invalid log directive: {}", err);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    match run(cli::Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match cloud_error(&err) {
                Some(cloud) => error!(status = cloud.status_code().as_u16(), "{:#}", err),
                None => error!("{:#}", err),
            }
            ExitCode::from(exit_code(&err))
        }
    }
}

fn cloud_error(err: &anyhow::Error) -> Option<&CloudError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CloudError>())
}

/// 2 when the failure traces back to credentials, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    cloud_error(err)
        .map(|cloud| u8::try_from(cloud.exit_code()).unwrap_or(1))
        .unwrap_or(1)
}

async fn run(cli: cli::Cli) -> Result<()> {
    let config = FleetFile::load(cli.config)?;
    let profile = config.profile(cli.profile.as_deref())?;

    match cli.command {
        Command::Fleet(command) => handle_fleet(command, &config, &profile).await,
        Command::Firewall(FirewallCommand::Ensure(args)) => {
            let fleet = config.fleet(&args.fleet)?;
            let context = ready(&profile, Some(&fleet))?;
            let client = context.client().await?;
            let (name, operation) = ensure_fleet_firewall(&context, &client, &fleet).await?;
            print_json(&serde_json::json!({
                "firewall": name,
                "created": operation.is_some(),
                "operation": operation.map(|op| op.name),
            }))
        }
        Command::Images(args) => handle_images(args, &profile).await,
        Command::Disks => {
            let context = ready(&profile, None)?;
            let client = context.client().await?;
            print_json(&client.list_disks().await?)
        }
        Command::Operations(OperationsCommand::Wait(args)) => {
            handle_operations_wait(args, &profile).await
        }
    }
}

fn ready(profile: &Profile, fleet: Option<&FleetConfig>) -> Result<FleetContext> {
    gate(profile, fleet)
        .into_ready()
        .with_context(|| format!("Profile '{}' is not usable", profile.name))
}

async fn handle_fleet(command: FleetCommand, config: &FleetFile, profile: &Profile) -> Result<()> {
    match command {
        FleetCommand::List(args) => {
            let fleet = config.fleet(&args.fleet)?;
            let context = ready(profile, Some(&fleet))?;
            let client = context.client().await?;
            let instances = list_fleet(&client, &fleet.prefix).await?;
            let rows: BTreeMap<&str, InstanceRow> = instances
                .iter()
                .map(|instance| {
                    let row = InstanceRow {
                        status: instance.status,
                        external_ip: instance.external_ip(),
                        machine_type: instance.machine_type.as_deref().map(last_segment),
                    };
                    (instance.name.as_str(), row)
                })
                .collect();
            print_json(&rows)
        }
        FleetCommand::Start(args) => {
            let fleet = config.fleet(&args.fleet)?;
            let context = ready(profile, Some(&fleet))?;
            start_fleet(args, &context).await
        }
        FleetCommand::Status(args) => {
            let fleet = config.fleet(&args.fleet)?;
            let context = ready(profile, Some(&fleet))?;
            fleet_status(args, &context).await
        }
        FleetCommand::Stop(args) => {
            let fleets = match args.fleet.as_deref() {
                Some(name) => vec![config.fleet(name)?],
                None => config.fleets.clone(),
            };
            if fleets.is_empty() {
                bail!("No fleets configured in {}", config.path.display());
            }
            let context = ready(profile, None)?;
            stop_fleets(args, &context, fleets).await
        }
    }
}

#[derive(Serialize)]
struct InstanceRow<'a> {
    status: InstanceStatus,
    #[serde(rename = "externalIp", skip_serializing_if = "Option::is_none")]
    external_ip: Option<&'a str>,
    #[serde(rename = "machineType", skip_serializing_if = "Option::is_none")]
    machine_type: Option<String>,
}

async fn start_fleet(args: FleetStartArgs, context: &FleetContext) -> Result<()> {
    let fleet = context.fleet()?;
    let client = context.client().await?;

    if fleet.firewall.is_some() {
        ensure_fleet_firewall(context, &client, fleet).await?;
    }
    let image = resolve_image(
        &client,
        context.image_project(),
        fleet.image.as_deref(),
        context.fallback_image(),
    )
    .await?;
    let template = context.template(client.zone(), image)?;
    let report = scale(&client, args.count, &template).await?;

    let operations = if args.wait {
        Some(
            wait_for_operations(
                &client,
                report.operations.clone(),
                OPERATION_POLL_INTERVAL,
                Duration::from_secs(args.timeout_secs),
            )
            .await?,
        )
    } else {
        None
    };

    print_json(&serde_json::json!({
        "fleet": fleet.name,
        "project": client.project(),
        "zone": client.zone(),
        "desired": args.count,
        "apply": report,
        "operations": operations,
    }))?;
    ensure_complete(&report, operations.as_ref())
}

async fn fleet_status(args: FleetStatusArgs, context: &FleetContext) -> Result<()> {
    let fleet = context.fleet()?;
    let client = context.client().await?;
    let instances = list_fleet(&client, &fleet.prefix).await?;

    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(context.probe_timeout);
    let checker = HealthChecker::new(timeout, fleet.probe)?;
    let report = checker.check_fleet(&instances, &fleet.load_balancers).await;
    print_json(&report)
}

async fn stop_fleets(
    args: FleetStopArgs,
    context: &FleetContext,
    fleets: Vec<FleetConfig>,
) -> Result<()> {
    let api: Arc<dyn ComputeApi> = Arc::new(context.client().await?);
    let deadline = Duration::from_secs(args.timeout_secs);
    let queue = JobQueue::new();

    let ids: Vec<String> = fleets
        .iter()
        .map(|fleet| {
            let api = Arc::clone(&api);
            let prefix = fleet.prefix.clone();
            queue.submit(format!("stop fleet {}", fleet.name), async move {
                stop_fleet(api.as_ref(), &prefix, deadline).await
            })
        })
        .collect();

    let waits = join_all(ids.iter().map(|id| queue.wait(id, JOB_POLL_INTERVAL)));
    tokio::select! {
        results = waits => {
            for result in results {
                result?;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling teardown jobs");
            for id in &ids {
                // Jobs that already finished keep their outcome.
                let _ = queue.cancel(id);
            }
        }
    }

    let jobs = queue.list();
    print_json(&jobs)?;
    let unsuccessful = jobs
        .iter()
        .filter(|job| !matches!(job.status, JobStatus::Succeeded(_)))
        .count();
    if unsuccessful > 0 {
        bail!("{} of {} teardown jobs did not succeed", unsuccessful, jobs.len());
    }
    Ok(())
}

async fn stop_fleet(api: &dyn ComputeApi, prefix: &str, deadline: Duration) -> Result<String> {
    let report = teardown(api, prefix)
        .await
        .with_context(|| format!("Teardown of fleet '{}' failed", prefix))?;
    let operations =
        wait_for_operations(api, report.operations.clone(), OPERATION_POLL_INTERVAL, deadline)
            .await?;
    ensure_complete(&report, Some(&operations))?;
    Ok(format!(
        "deleted {} instance(s) of {}",
        report.deleted.len(),
        prefix
    ))
}

async fn ensure_fleet_firewall(
    context: &FleetContext,
    api: &dyn ComputeApi,
    fleet: &FleetConfig,
) -> Result<(String, Option<Operation>)> {
    let name = fleet
        .firewall
        .clone()
        .unwrap_or_else(|| format!("{}-www", fleet.prefix));
    let rule = fleet_firewall(
        &name,
        &qualify_network(context.network()),
        &fleet.tags,
        &fleet.firewall_ports,
    );
    let operation = ensure_firewall(api, &rule).await?;
    Ok((name, operation))
}

async fn handle_images(args: ImagesArgs, profile: &Profile) -> Result<()> {
    let context = ready(profile, None)?;
    let client = context.client().await?;
    let project = args
        .project
        .unwrap_or_else(|| context.image_project().to_string());
    let images = client.list_images(&project).await?;
    print_json(&images)
}

async fn handle_operations_wait(args: OperationsWaitArgs, profile: &Profile) -> Result<()> {
    let context = ready(profile, None)?;
    let client = context.client().await?;
    let zone = if args.global {
        None
    } else {
        Some(args.zone.unwrap_or_else(|| client.zone().to_string()))
    };
    let operations = args
        .names
        .into_iter()
        .map(|name| Operation {
            name,
            status: OperationStatus::Pending,
            operation_type: None,
            target_link: None,
            zone: zone.clone(),
            error: None,
        })
        .collect();

    let report = wait_for_operations(
        &client,
        operations,
        OPERATION_POLL_INTERVAL,
        Duration::from_secs(args.timeout_secs),
    )
    .await?;
    print_json(&report)?;
    if !report.failed.is_empty() || !report.pending.is_empty() {
        bail!(
            "{} operation(s) failed, {} still pending",
            report.failed.len(),
            report.pending.len()
        );
    }
    Ok(())
}

fn ensure_complete(report: &ApplyReport, operations: Option<&WaitReport>) -> Result<()> {
    if !report.is_complete() {
        let names: Vec<&str> = report.failed.iter().map(|f| f.name.as_str()).collect();
        bail!("Requests failed for: {}", names.join(", "));
    }
    if let Some(operations) = operations {
        if !operations.failed.is_empty() {
            bail!("{} operation(s) finished with errors", operations.failed.len());
        }
        if !operations.pending.is_empty() {
            bail!(
                "{} operation(s) still pending at deadline",
                operations.pending.len()
            );
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{instance, FakeCompute};
    use crate::reconcile::{Action, ItemFailure};

    #[test]
    fn auth_failures_exit_with_two() {
        let err = anyhow::Error::new(CloudError::Auth("expired".to_string()))
            .context("listing fractal");
        assert_eq!(exit_code(&err), 2);
        let err = anyhow::Error::new(CloudError::Api("503".to_string()));
        assert_eq!(exit_code(&err), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("bad config")), 1);
    }

    #[test]
    fn incomplete_reports_are_errors() {
        let mut report = ApplyReport::default();
        assert!(ensure_complete(&report, None).is_ok());

        let pending = WaitReport {
            pending: vec!["op-1".to_string()],
            ..WaitReport::default()
        };
        assert!(ensure_complete(&report, Some(&pending)).is_err());

        report.failed.push(ItemFailure {
            name: "demo-2".to_string(),
            action: Action::Delete,
            error: "busy".to_string(),
        });
        assert!(ensure_complete(&report, None).is_err());
    }

    #[tokio::test]
    async fn stop_fleet_deletes_and_waits() {
        let api = FakeCompute::new(vec![
            instance("demo-0", InstanceStatus::Running),
            instance("demo-1", InstanceStatus::Terminated),
        ]);
        let summary = stop_fleet(&api, "demo", Duration::from_secs(5))
            .await
            .expect("stop");
        assert_eq!(summary, "deleted 2 instance(s) of demo");
        assert!(api.names().is_empty());
    }
}
