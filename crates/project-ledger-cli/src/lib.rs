//! Command surface for the project ledger.
//!
//! Hosts embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a [`Command`] against a `SQLite` DB path.
//! - [`run_command`] for a [`Command`] against any [`TabularStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use project_ledger_core::{
    ApproverDesk, BatchReport, CodeCatalog, DirectoryEntry, Ledger, ProjectRecord,
    ProjectSelection, ReserveOutcome, RequestorDesk, Session, StaticDirectory, SystemClock,
    TabularStore,
};
use project_ledger_store_sqlite::SqliteTableStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "pid")]
#[command(about = "Project ID allocation ledger")]
pub struct Cli {
    #[arg(long, env = "PROJECT_LEDGER_DB", default_value = "./project_ledger.sqlite3")]
    db: PathBuf,

    /// JSON file holding the user directory and optional code catalog.
    #[arg(long, env = "PROJECT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PROJECT_LEDGER_USER")]
    user: Option<String>,

    #[arg(long, env = "PROJECT_LEDGER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shows the authenticated identity.
    Whoami,
    /// Prints the code catalog.
    Catalog,
    /// Reserves a new project ID, or shows the one already reserved.
    Reserve(SelectionArgs),
    /// Shows the caller's current reservation.
    Show,
    /// Submits the caller's reservation for approval.
    Submit(SubmitArgs),
    /// Cancels the caller's reservation.
    Cancel,
    History(ListArgs),
    /// Releases any allocation lock held by the caller.
    Logout,
    Pending(ListArgs),
    Approve(DecisionArgs),
    Reject(DecisionArgs),
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum LockCommand {
    Status,
}

#[derive(Debug, Args)]
pub struct SelectionArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    project_type: String,
    #[arg(long)]
    cooling: String,
    #[arg(long)]
    department: String,
    #[arg(long, default_value = "")]
    note: String,
}

impl SelectionArgs {
    fn into_selection(self) -> ProjectSelection {
        ProjectSelection {
            client_code: self.client,
            project_type_code: self.project_type,
            cooling_code: self.cooling,
            department_code: self.department,
            note: self.note,
        }
    }
}

/// Overrides for a submission; omitted fields keep the reserved values.
#[derive(Debug, Args, Default)]
pub struct SubmitArgs {
    #[arg(long)]
    client: Option<String>,
    #[arg(long)]
    project_type: Option<String>,
    #[arg(long)]
    cooling: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

impl SubmitArgs {
    fn merge(self, record: &ProjectRecord) -> Result<ProjectSelection> {
        let current = record.selection();
        let pick = |value: Option<String>, field: &str, fallback: Option<&str>| {
            value
                .or_else(|| fallback.map(str::to_string))
                .ok_or_else(|| anyhow!("--{field} is required: reserved {field} is not a catalogued code"))
        };
        Ok(ProjectSelection {
            client_code: pick(
                self.client,
                "client",
                current.as_ref().map(|s| s.client_code.as_str()),
            )?,
            project_type_code: pick(
                self.project_type,
                "project-type",
                current.as_ref().map(|s| s.project_type_code.as_str()),
            )?,
            cooling_code: pick(
                self.cooling,
                "cooling",
                current.as_ref().map(|s| s.cooling_code.as_str()),
            )?,
            department_code: pick(
                self.department,
                "department",
                current.as_ref().map(|s| s.department_code.as_str()),
            )?,
            note: self.note.unwrap_or_else(|| record.note.clone()),
        })
    }
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DecisionArgs {
    /// Project IDs to decide on.
    #[arg(required = true)]
    project_ids: Vec<String>,
}

/// Runtime configuration loaded from `--config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    #[serde(default)]
    pub users: BTreeMap<String, DirectoryEntry>,
    #[serde(default)]
    pub catalog: CodeCatalog,
}

impl LedgerConfig {
    /// Reads the config file, or returns the built-in catalog with no users.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or decoded, or when a
    /// user entry has an empty display name.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            debug!("no config file given, using built-in catalog");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when a user entry has an empty display name.
    pub fn validate(&self) -> Result<()> {
        if let Some((credential, _)) = self
            .users
            .iter()
            .find(|(_, entry)| entry.name.trim().is_empty())
        {
            return Err(anyhow!("user {credential} has an empty display name"));
        }
        Ok(())
    }

    #[must_use]
    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.users.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when config loading, store open/migrate, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = LedgerConfig::load(cli.config.as_deref())?;
    let credentials = Credentials {
        user: cli.user,
        password: cli.password,
    };
    run_command_with_db(&cli.db, &config, &credentials, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(
    db_path: &Path,
    config: &LedgerConfig,
    credentials: &Credentials,
    command: Command,
) -> Result<()> {
    let store = SqliteTableStore::open(db_path)?;
    store.migrate()?;
    run_command(command, config, credentials, &store)
}

/// Executes a parsed command against an existing store.
///
/// # Errors
/// Returns an error on authentication failure, a role mismatch, a denied
/// allocation lock, a rejected workflow transition, or store failure.
pub fn run_command(
    command: Command,
    config: &LedgerConfig,
    credentials: &Credentials,
    store: &dyn TabularStore,
) -> Result<()> {
    let directory = config.directory();
    let clock = SystemClock;
    let ledger = Ledger::new(store, &directory, &config.catalog, &clock);

    match command {
        Command::Catalog => print_json(&config.catalog),
        Command::Lock {
            command: LockCommand::Status,
        } => print_json(&ledger.lock_manager().status()?),
        command => {
            if directory.is_empty() {
                return Err(anyhow!(
                    "no users configured; pass --config or set PROJECT_LEDGER_CONFIG"
                ));
            }
            let session = login(&ledger, credentials)?;
            run_session_command(command, &session)
        }
    }
}

fn login<'a>(ledger: &Ledger<'a>, credentials: &Credentials) -> Result<Session<'a>> {
    let user = credentials
        .user
        .as_deref()
        .ok_or_else(|| anyhow!("--user (or PROJECT_LEDGER_USER) is required"))?;
    let password = credentials
        .password
        .as_deref()
        .ok_or_else(|| anyhow!("--password (or PROJECT_LEDGER_PASSWORD) is required"))?;
    Ok(ledger.login(user, password)?)
}

fn run_session_command(command: Command, session: &Session<'_>) -> Result<()> {
    match command {
        Command::Whoami => print_json(session.identity()),
        Command::Logout => {
            session.logout()?;
            print_json(&json!({ "logged_out": session.identity().credential }))
        }
        Command::Reserve(args) => {
            let outcome = requestor(session)?.reserve(&args.into_selection())?;
            print_json(&outcome)?;
            match outcome {
                ReserveOutcome::Busy { holder_name, .. } => Err(anyhow!(
                    "allocation lock is held by {holder_name}; try again later"
                )),
                ReserveOutcome::Created { .. } | ReserveOutcome::Existing { .. } => Ok(()),
            }
        }
        Command::Show => print_json(&requestor(session)?.current_reservation()?),
        Command::Submit(args) => {
            let desk = requestor(session)?;
            let Some(record) = desk.current_reservation()? else {
                return Err(anyhow!(
                    "no reserved project found for {}",
                    desk.identity().display_name
                ));
            };
            let selection = args.merge(&record)?;
            print_json(&desk.submit(&selection)?)
        }
        Command::Cancel => print_json(&requestor(session)?.cancel()?),
        Command::History(args) => {
            let records = requestor(session)?.history()?;
            print_records(&records, args.json)
        }
        Command::Pending(args) => {
            let records = approver(session)?.pending()?;
            print_records(&records, args.json)
        }
        Command::Approve(args) => {
            let report = approver(session)?.approve(&args.project_ids)?;
            print_json(&report)?;
            warn_skipped(&report);
            Ok(())
        }
        Command::Reject(args) => {
            let report = approver(session)?.reject(&args.project_ids)?;
            print_json(&report)?;
            warn_skipped(&report);
            Ok(())
        }
        Command::Catalog | Command::Lock { .. } => {
            Err(anyhow!("command does not require a session"))
        }
    }
}

fn requestor<'s, 'a>(session: &'s Session<'a>) -> Result<&'s RequestorDesk<'a>> {
    match session {
        Session::Requestor(desk) => Ok(desk),
        Session::Approver(desk) => Err(anyhow!(
            "{} is an approver; this command requires a requestor",
            desk.identity().credential
        )),
    }
}

fn approver<'s, 'a>(session: &'s Session<'a>) -> Result<&'s ApproverDesk<'a>> {
    match session {
        Session::Approver(desk) => Ok(desk),
        Session::Requestor(desk) => Err(anyhow!(
            "{} is a requestor; this command requires an approver",
            desk.identity().credential
        )),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_records(records: &[ProjectRecord], as_json: bool) -> Result<()> {
    if as_json {
        return print_json(records);
    }

    println!(
        "{:<18} {:<8} {:<10} {:<19} {:<12} {:<12} note",
        "project_id", "number", "status", "created_time", "applicant", "approver"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<18} {:<8} {:<10} {:<19} {:<12} {:<12} {}",
            record.project_id,
            record.sequence_number,
            record.status.map_or("n/a", |status| status.as_str()),
            record.created_time,
            record.applicant,
            if record.approver.is_empty() {
                "-"
            } else {
                record.approver.as_str()
            },
            record.note
        );
    }
    Ok(())
}

fn warn_skipped(report: &BatchReport) {
    for skipped in &report.skipped {
        eprintln!(
            "skipped {}: {}",
            skipped.project_id,
            serde_json::to_string(&skipped.reason).unwrap_or_default()
        );
    }
}
