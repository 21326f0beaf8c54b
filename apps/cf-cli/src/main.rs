use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cf_app::{AppError, AppResult, CaseDriver, CaseSummary, DriverConfig, local_driver};
use cf_case::CaseState;
use cf_core::{CaseId, RemotePath};
use cf_remote::LocalDirRemote;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cfdflow")]
#[command(about = "CFDFlow CLI - manage CFD cases stored in remote folders", long_about = None)]
struct Cli {
    /// Driver configuration file
    #[arg(short, long, global = true, default_value = "cfdflow.yaml")]
    config: PathBuf,
    /// Print case summaries as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known case types
    Types,
    /// Show the state of a case
    Status {
        /// Remote folder of the case
        case: String,
    },
    /// Create a new case folder
    Create {
        /// Case type name
        case_type: String,
        /// Remote folder to create the case in
        parent: String,
        /// Name of the new case folder
        name: String,
    },
    /// Change case parameters
    Params {
        /// Remote folder of the case
        case: String,
        /// Assignments of the form NAME=VALUE
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Run the meshing stage
    Mesh {
        /// Remote folder of the case
        case: String,
        /// Remote geometry file passed to the mesher
        #[arg(long)]
        geo: Option<String>,
    },
    /// Run the solver stage
    Solve {
        /// Remote folder of the case
        case: String,
    },
    /// Run the post processing stage
    Post {
        /// Remote folder of the case
        case: String,
    },
    /// Delete the output of a stage and every later stage
    Rollback {
        /// Remote folder of the case
        case: String,
        /// Stage id to roll back
        stage: String,
    },
}

type Driver = CaseDriver<LocalDirRemote>;

struct Session {
    driver: Driver,
    config: DriverConfig,
}

fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let mut session = Session {
        driver: local_driver(&config)?,
        config,
    };

    match cli.command {
        Commands::Types => cmd_types(&session.driver),
        Commands::Status { case } => cmd_status(&mut session, &case, cli.json),
        Commands::Create {
            case_type,
            parent,
            name,
        } => cmd_create(&mut session, &case_type, &parent, &name, cli.json),
        Commands::Params { case, assignments } => {
            cmd_params(&mut session, &case, &assignments, cli.json)
        }
        Commands::Mesh { case, geo } => cmd_mesh(&mut session, &case, geo.as_deref(), cli.json),
        Commands::Solve { case } => cmd_run(&mut session, &case, cli.json, |d, id| d.open_foam(id)),
        Commands::Post { case } => {
            cmd_run(&mut session, &case, cli.json, |d, id| d.post_process(id))
        }
        Commands::Rollback { case, stage } => {
            cmd_run(&mut session, &case, cli.json, |d, id| d.roll_back(id, &stage))
        }
    }
}

fn load_config(path: &Path) -> AppResult<DriverConfig> {
    if path.exists() {
        return DriverConfig::load(path);
    }
    tracing::debug!(path = %path.display(), "no config file, using defaults");
    let mut config = DriverConfig::default();
    config.apply_env_overrides()?;
    Ok(config)
}

fn remote_path(raw: &str) -> AppResult<RemotePath> {
    Ok(RemotePath::parse(raw)?)
}

impl Session {
    fn locate(&mut self, raw: &str) -> AppResult<cf_core::NodeId> {
        let path = remote_path(raw)?;
        let poll = self.config.poll_interval();
        let limit = self.wait_limit();
        self.driver.locate(&path, poll, limit)
    }

    fn settle(&mut self, id: CaseId) -> AppResult<CaseState> {
        let poll = self.config.poll_interval();
        let limit = self.wait_limit();
        self.driver.settle(id, poll, limit)
    }

    /// Jobs can run for a long time; only the watchdog bounds them.
    fn wait_limit(&self) -> std::time::Duration {
        self.config
            .invoke_timeout()
            .map(|t| t.saturating_add(self.config.poll_interval().saturating_mul(10)))
            .unwrap_or(std::time::Duration::MAX)
    }

    fn open(&mut self, raw: &str) -> AppResult<CaseId> {
        let folder = self.locate(raw)?;
        let id = self.driver.open_case(folder)?;
        self.settle(id)?;
        Ok(id)
    }
}

fn print_summary(summary: &CaseSummary, json: bool) -> AppResult<()> {
    if json {
        let text = serde_json::to_string_pretty(summary)
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }
    println!(
        "{} [{}] {}",
        summary.folder.as_deref().unwrap_or("<no folder>"),
        summary.case_type.as_deref().unwrap_or("unknown type"),
        summary.state
    );
    for (stage, state) in &summary.stages {
        println!("  {stage:<12} {state}");
    }
    if !summary.params.is_empty() {
        println!("  parameters:");
        for (name, value) in &summary.params {
            println!("    {name} = {value}");
        }
    }
    Ok(())
}

/// Print the case and fail if it ended in `ERROR`.
fn report(session: &Session, id: CaseId, json: bool) -> AppResult<()> {
    let summary = session.driver.summary(id)?;
    print_summary(&summary, json)?;
    if let Some(reason) = session.driver.case(id)?.invalid_reason() {
        println!("  invalid: {reason}");
    }
    if summary.state == CaseState::Error {
        return Err(AppError::InvalidInput(format!(
            "case {} ended in ERROR",
            summary.folder.as_deref().unwrap_or("<no folder>")
        )));
    }
    Ok(())
}

fn cmd_types(driver: &Driver) -> AppResult<()> {
    for case_type in driver.types().iter() {
        println!("{}", case_type.name);
        if !case_type.description.is_empty() {
            println!("  {}", case_type.description);
        }
        let stages: Vec<&str> = case_type.stages.iter().map(|s| s.id.as_str()).collect();
        println!("  stages: {}", stages.join(" -> "));
        for param in &case_type.parameters {
            println!(
                "  {:<20} {:<6} default {:?}",
                param.name, param.stage, param.default
            );
        }
    }
    Ok(())
}

fn cmd_status(session: &mut Session, case: &str, json: bool) -> AppResult<()> {
    let id = session.open(case)?;
    report(session, id, json)
}

fn cmd_create(
    session: &mut Session,
    case_type: &str,
    parent: &str,
    name: &str,
    json: bool,
) -> AppResult<()> {
    let containing = session.locate(parent)?;
    let id = session.driver.new_case(case_type)?;
    session.driver.create_case(id, name, containing)?;
    session.settle(id)?;
    report(session, id, json)
}

fn parse_assignments(assignments: &[String]) -> AppResult<BTreeMap<String, String>> {
    assignments
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| AppError::InvalidInput(format!("expected NAME=VALUE, got {raw:?}")))
        })
        .collect()
}

fn cmd_params(session: &mut Session, case: &str, assignments: &[String], json: bool) -> AppResult<()> {
    let params = parse_assignments(assignments)?;
    let id = session.open(case)?;
    session.driver.change_parameters(id, params)?;
    session.settle(id)?;
    report(session, id, json)
}

fn cmd_mesh(session: &mut Session, case: &str, geo: Option<&str>, json: bool) -> AppResult<()> {
    let id = session.open(case)?;
    let geo_file = geo.map(|g| session.locate(g)).transpose()?;
    session.driver.mesh(id, geo_file)?;
    session.settle(id)?;
    report(session, id, json)
}

fn cmd_run(
    session: &mut Session,
    case: &str,
    json: bool,
    start: impl FnOnce(&mut Driver, CaseId) -> AppResult<()>,
) -> AppResult<()> {
    let id = session.open(case)?;
    start(&mut session.driver, id)?;
    session.settle(id)?;
    report(session, id, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_split_on_first_equals() {
        let params =
            parse_assignments(&["end_time=400".to_string(), "probe_locations=a=b".to_string()])
                .unwrap();
        assert_eq!(params["end_time"], "400");
        assert_eq!(params["probe_locations"], "a=b");
    }

    #[test]
    fn assignment_without_value_is_rejected() {
        assert!(parse_assignments(&["end_time".to_string()]).is_err());
        assert!(parse_assignments(&["=3".to_string()]).is_err());
    }

    #[test]
    fn huge_timeout_saturates_wait_limit() {
        let config = DriverConfig {
            invoke_timeout_s: Some(f64::MAX),
            poll_interval_ms: u64::MAX,
            ..DriverConfig::default()
        };
        let session = Session {
            driver: local_driver(&DriverConfig {
                remote_root: std::env::temp_dir(),
                case_types_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../case_types"),
                ..DriverConfig::default()
            })
            .unwrap(),
            config,
        };
        assert_eq!(session.wait_limit(), std::time::Duration::MAX);
    }

    #[test]
    fn cli_parses_rollback() {
        let cli = Cli::try_parse_from(["cfdflow", "--json", "rollback", "/projects/cyl", "mesh"])
            .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Rollback { ref stage, .. } if stage == "mesh"));
    }
}
