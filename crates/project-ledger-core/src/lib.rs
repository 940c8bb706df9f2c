//! Coordination layer for project identifier allocation.
//!
//! All state lives in an external tabular store reached through
//! [`TabularStore`], which only offers read-all, append-row, update-cell and
//! ensure-headers. Mutual exclusion between requestors is provided by the
//! advisory [`LockManager`]; numbering by [`next_sequence_number`]; record
//! lifecycle by [`next_status`]. Hosts drive everything through [`Ledger`]
//! and the role-specific [`Session`] it hands out at login.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, warn};

pub const PROJECTS_TABLE: &str = "Projects";
pub const LOCK_TABLE: &str = "Lock";

pub const CLIENT: &str = "Client";
pub const PROJECT: &str = "Project";
pub const COOLING: &str = "Cooling";
pub const DEPARTMENT: &str = "Department";
pub const NUMBER: &str = "Number";
pub const PROJECT_ID: &str = "Project_ID";
pub const CREATED_TIME: &str = "Created_Time";
pub const STATUS: &str = "Status";
pub const NOTE: &str = "Note";
pub const APPLICANT: &str = "Applicant";
pub const APPROVER: &str = "Approver";

pub const USER: &str = "User";
pub const LOCKED_TIME: &str = "Locked_Time";

pub const PROJECT_HEADERS: [&str; 11] = [
    CLIENT,
    PROJECT,
    COOLING,
    DEPARTMENT,
    NUMBER,
    PROJECT_ID,
    CREATED_TIME,
    STATUS,
    NOTE,
    APPLICANT,
    APPROVER,
];

pub const LOCK_HEADERS: [&str; 2] = [USER, LOCKED_TIME];

pub const FIRST_SEQUENCE_NUMBER: &str = "001";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed for {0}")]
    Authentication(String),
    #[error("cannot {action} a project in status {from}")]
    InvalidTransition {
        from: ProjectStatus,
        action: WorkflowAction,
    },
    #[error("no reserved project found for {0}")]
    NoReservation(String),
    #[error("store error: {0}")]
    Store(String),
}

/// The two logical tables held by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Table {
    Projects,
    Lock,
}

impl Table {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Projects => PROJECTS_TABLE,
            Self::Lock => LOCK_TABLE,
        }
    }

    #[must_use]
    pub fn headers(self) -> &'static [&'static str] {
        match self {
            Self::Projects => &PROJECT_HEADERS,
            Self::Lock => &LOCK_HEADERS,
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub type Row = BTreeMap<String, String>;

/// Full read of one table: the header row plus every data row keyed by header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSnapshot {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl TableSnapshot {
    /// 1-based column index of `header`, as used by [`TabularStore::update_cell`].
    #[must_use]
    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|candidate| candidate == header)
            .map(|position| position + 1)
    }

    /// Store row index of the data row at `position`; the header row is row 1.
    #[must_use]
    pub fn row_index(position: usize) -> usize {
        position + 2
    }

    fn required_column(&self, table: Table, header: &str) -> Result<usize, LedgerError> {
        self.column_index(header).ok_or_else(|| {
            LedgerError::Store(format!("table {table} is missing the {header} column"))
        })
    }
}

#[must_use]
pub fn cell<'a>(row: &'a Row, header: &str) -> &'a str {
    row.get(header).map_or("", String::as_str)
}

/// Store Adapter contract.
///
/// Implementations must not be assumed to offer any atomicity across calls:
/// every coordination guarantee in this crate is built from these four
/// primitives alone.
pub trait TabularStore {
    /// Reads the header row and every data row of `table`, in row order.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the backend cannot be reached.
    fn read_all_rows(&self, table: Table) -> Result<TableSnapshot, LedgerError>;

    /// Appends `row` after the last row, laying values out in header order.
    /// Keys without a header are dropped and missing headers become empty.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the backend cannot be reached or
    /// the table has no header row.
    fn append_row(&self, table: Table, row: &Row) -> Result<(), LedgerError>;

    /// Overwrites one cell. Both indices are 1-based; row 1 is the header.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the backend cannot be reached and
    /// [`LedgerError::Validation`] for a zero index.
    fn update_cell(
        &self,
        table: Table,
        row_index: usize,
        column_index: usize,
        value: &str,
    ) -> Result<(), LedgerError>;

    /// Creates the header row if absent, otherwise appends missing headers
    /// after the existing ones without reordering them.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the backend cannot be reached.
    fn ensure_headers(&self, table: Table, expected: &[&str]) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ProjectStatus {
    #[serde(rename = "預留中")]
    Reserved,
    #[serde(rename = "簽核中")]
    PendingApproval,
    #[serde(rename = "批准")]
    Approved,
    #[serde(rename = "已取消")]
    Cancelled,
}

impl ProjectStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "預留中",
            Self::PendingApproval => "簽核中",
            Self::Approved => "批准",
            Self::Cancelled => "已取消",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "預留中" => Some(Self::Reserved),
            "簽核中" => Some(Self::PendingApproval),
            "批准" => Some(Self::Approved),
            "已取消" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Cancelled)
    }
}

impl Display for ProjectStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requestor,
    Approver,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requestor => "requestor",
            Self::Approver => "approver",
        }
    }

}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Submit,
    Cancel,
    Approve,
    Reject,
}

impl WorkflowAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    /// Role allowed to perform the action.
    #[must_use]
    pub fn actor(self) -> Role {
        match self {
            Self::Submit | Self::Cancel => Role::Requestor,
            Self::Approve | Self::Reject => Role::Approver,
        }
    }
}

impl Display for WorkflowAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies `action` to a record in status `from`.
///
/// `Approved` and `Cancelled` have no outgoing transitions. A rejection sends
/// the record back to `Reserved` so its applicant can edit and resubmit it.
///
/// # Errors
/// Returns [`LedgerError::InvalidTransition`] for any pair outside the table.
pub fn next_status(
    from: ProjectStatus,
    action: WorkflowAction,
) -> Result<ProjectStatus, LedgerError> {
    match (from, action) {
        (ProjectStatus::Reserved, WorkflowAction::Submit) => Ok(ProjectStatus::PendingApproval),
        (ProjectStatus::Reserved, WorkflowAction::Cancel) => Ok(ProjectStatus::Cancelled),
        (ProjectStatus::PendingApproval, WorkflowAction::Approve) => Ok(ProjectStatus::Approved),
        (ProjectStatus::PendingApproval, WorkflowAction::Reject) => Ok(ProjectStatus::Reserved),
        _ => Err(LedgerError::InvalidTransition { from, action }),
    }
}

/// Builds the external identifier `client-type-cooling-department-sequence`.
/// Codes are used verbatim.
#[must_use]
pub fn compose_project_id(
    client_code: &str,
    project_type_code: &str,
    cooling_code: &str,
    department_code: &str,
    sequence_number: &str,
) -> String {
    format!("{client_code}-{project_type_code}-{cooling_code}-{department_code}-{sequence_number}")
}

#[must_use]
pub fn format_sequence_number(value: u64) -> String {
    format!("{value:03}")
}

/// Derives the next sequence number for `client_code` from a Projects snapshot.
///
/// Only rows whose `Client` cell wraps the same code are considered. `Number`
/// cells that are empty, not an integer, negative or outside the 64-bit range
/// are ignored. The result is `max + 1`, zero-padded to at least three digits,
/// or `"001"` when nothing matches. Numbers that are reserved elsewhere but not
/// yet visible in the snapshot are unknown to this function; callers serialise
/// through the [`LockManager`].
///
/// # Errors
/// Returns [`LedgerError::Validation`] when the highest number has no successor.
pub fn next_sequence_number(
    projects: &TableSnapshot,
    client_code: &str,
) -> Result<String, LedgerError> {
    let highest = projects
        .rows
        .iter()
        .filter(|row| extract_code(cell(row, CLIENT)) == Some(client_code))
        .filter_map(|row| cell(row, NUMBER).trim().parse::<u64>().ok())
        .max();

    match highest {
        Some(value) => value
            .checked_add(1)
            .map(format_sequence_number)
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "sequence numbers for client {client_code} are exhausted"
                ))
            }),
        None => Ok(FIRST_SEQUENCE_NUMBER.to_string()),
    }
}

#[must_use]
pub fn wrap_code(code: &str, label: &str) -> String {
    format!("({code}){label}")
}

/// Recovers the code from a `(code)label` display value.
#[must_use]
pub fn extract_code(display: &str) -> Option<&str> {
    let start = display.find('(')? + 1;
    let length = display[start..].find(')')?;
    Some(&display[start..start + length])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Client,
    ProjectType,
    Cooling,
    Department,
}

impl CodeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::ProjectType => "project_type",
            Self::Cooling => "cooling",
            Self::Department => "department",
        }
    }
}

/// The enumerations a requestor chooses codes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeCatalog {
    pub clients: BTreeMap<String, String>,
    pub project_types: BTreeMap<String, String>,
    pub coolings: BTreeMap<String, String>,
    pub departments: BTreeMap<String, String>,
}

impl Default for CodeCatalog {
    fn default() -> Self {
        fn table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
            entries
                .iter()
                .map(|(code, label)| ((*code).to_string(), (*label).to_string()))
                .collect()
        }

        Self {
            clients: table(&[
                ("01", "仁寶"),
                ("02", "廣達"),
                ("03", "緯創"),
                ("04", "華勤"),
                ("05", "光寶"),
                ("06", "技嘉"),
                ("07", "智邦"),
                ("00", "其他"),
            ]),
            project_types: table(&[
                ("S1", "Server"),
                ("N1", "NB"),
                ("M1", "MINI PC"),
                ("A1", "AIO"),
                ("C1", "車用"),
                ("00", "其他"),
            ]),
            coolings: table(&[("A", "氣冷"), ("L", "水冷")]),
            departments: table(&[("F", "風扇部門"), ("N", "筆電模組部門"), ("S", "伺服器模組部門")]),
        }
    }
}

impl CodeCatalog {
    #[must_use]
    pub fn table(&self, kind: CodeKind) -> &BTreeMap<String, String> {
        match kind {
            CodeKind::Client => &self.clients,
            CodeKind::ProjectType => &self.project_types,
            CodeKind::Cooling => &self.coolings,
            CodeKind::Department => &self.departments,
        }
    }

    /// Display value `(code)label` for a catalogued code.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `code` is not catalogued.
    pub fn label(&self, kind: CodeKind, code: &str) -> Result<String, LedgerError> {
        self.table(kind)
            .get(code)
            .map(|label| wrap_code(code, label))
            .ok_or_else(|| {
                LedgerError::Validation(format!("unknown {} code: {code}", kind.as_str()))
            })
    }

    /// # Errors
    /// Returns [`LedgerError::Validation`] for the first uncatalogued code.
    pub fn validate(&self, selection: &ProjectSelection) -> Result<(), LedgerError> {
        for (kind, code) in selection.codes() {
            self.label(kind, code)?;
        }
        Ok(())
    }
}

/// Codes and note chosen by a requestor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSelection {
    pub client_code: String,
    pub project_type_code: String,
    pub cooling_code: String,
    pub department_code: String,
    #[serde(default)]
    pub note: String,
}

impl ProjectSelection {
    fn codes(&self) -> [(CodeKind, &str); 4] {
        [
            (CodeKind::Client, self.client_code.as_str()),
            (CodeKind::ProjectType, self.project_type_code.as_str()),
            (CodeKind::Cooling, self.cooling_code.as_str()),
            (CodeKind::Department, self.department_code.as_str()),
        ]
    }
}

/// One row of the Projects table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRecord {
    /// Store row index the record was observed at.
    pub row_index: usize,
    pub client: String,
    pub project_type: String,
    pub cooling: String,
    pub department: String,
    pub sequence_number: String,
    pub project_id: String,
    pub created_time: String,
    /// `None` when the cell is empty or holds an unrecognised literal.
    pub status: Option<ProjectStatus>,
    pub note: String,
    pub applicant: String,
    pub approver: String,
}

impl ProjectRecord {
    #[must_use]
    pub fn from_row(position: usize, row: &Row) -> Self {
        Self {
            row_index: TableSnapshot::row_index(position),
            client: cell(row, CLIENT).to_string(),
            project_type: cell(row, PROJECT).to_string(),
            cooling: cell(row, COOLING).to_string(),
            department: cell(row, DEPARTMENT).to_string(),
            sequence_number: cell(row, NUMBER).to_string(),
            project_id: cell(row, PROJECT_ID).to_string(),
            created_time: cell(row, CREATED_TIME).to_string(),
            status: ProjectStatus::parse(cell(row, STATUS)),
            note: cell(row, NOTE).to_string(),
            applicant: cell(row, APPLICANT).to_string(),
            approver: cell(row, APPROVER).to_string(),
        }
    }

    #[must_use]
    pub fn to_row(&self) -> Row {
        [
            (CLIENT, self.client.as_str()),
            (PROJECT, self.project_type.as_str()),
            (COOLING, self.cooling.as_str()),
            (DEPARTMENT, self.department.as_str()),
            (NUMBER, self.sequence_number.as_str()),
            (PROJECT_ID, self.project_id.as_str()),
            (CREATED_TIME, self.created_time.as_str()),
            (STATUS, self.status.map_or("", ProjectStatus::as_str)),
            (NOTE, self.note.as_str()),
            (APPLICANT, self.applicant.as_str()),
            (APPROVER, self.approver.as_str()),
        ]
        .into_iter()
        .map(|(header, value)| (header.to_string(), value.to_string()))
        .collect()
    }

    #[must_use]
    pub fn client_code(&self) -> Option<&str> {
        extract_code(&self.client)
    }

    /// The codes and note currently on the record, if every code cell is wrapped.
    #[must_use]
    pub fn selection(&self) -> Option<ProjectSelection> {
        Some(ProjectSelection {
            client_code: extract_code(&self.client)?.to_string(),
            project_type_code: extract_code(&self.project_type)?.to_string(),
            cooling_code: extract_code(&self.cooling)?.to_string(),
            department_code: extract_code(&self.department)?.to_string(),
            note: self.note.clone(),
        })
    }
}

#[must_use]
pub fn project_records(snapshot: &TableSnapshot) -> Vec<ProjectRecord> {
    snapshot
        .rows
        .iter()
        .enumerate()
        .map(|(position, row)| ProjectRecord::from_row(position, row))
        .collect()
}

/// Resolved directory entry, without the secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub credential: String,
    pub role: Role,
    pub display_name: String,
    pub priority: u32,
}

/// Identity Directory contract.
pub trait IdentityDirectory {
    fn resolve(&self, credential: &str) -> Option<Identity>;

    /// # Errors
    /// Returns [`LedgerError::Authentication`] for an unknown credential or a
    /// password mismatch.
    fn authenticate(&self, credential: &str, password: &str) -> Result<Identity, LedgerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub password: String,
    pub role: Role,
    pub name: String,
    #[serde(default)]
    pub priority: u32,
}

/// Fixed credential table; authentication is plain equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDirectory {
    entries: BTreeMap<String, DirectoryEntry>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(entries: BTreeMap<String, DirectoryEntry>) -> Self {
        Self { entries }
    }

    /// Decodes a `{credential: {password, role, name, priority}}` object.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the payload does not decode.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let entries = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid identity directory payload: {err}"))
        })?;
        Ok(Self::new(entries))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityDirectory for StaticDirectory {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        self.entries.get(credential).map(|entry| Identity {
            credential: credential.to_string(),
            role: entry.role,
            display_name: entry.name.clone(),
            priority: entry.priority,
        })
    }

    fn authenticate(&self, credential: &str, password: &str) -> Result<Identity, LedgerError> {
        match self.entries.get(credential) {
            Some(entry) if entry.password == password => self
                .resolve(credential)
                .ok_or_else(|| LedgerError::Authentication(credential.to_string())),
            _ => Err(LedgerError::Authentication(credential.to_string())),
        }
    }
}

/// Source of wall-clock time for record and lock timestamps.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;
}

/// Local wall clock; falls back to UTC when the local offset is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|err| {
            debug!(error = %err, "local offset unavailable, using UTC");
            OffsetDateTime::now_utc()
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

/// Formats `YYYY-MM-DD HH:MM:SS` in the timestamp's own offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .map_err(|err| LedgerError::Validation(format!("failed to format timestamp: {err}")))
}

/// # Errors
/// Returns [`LedgerError::Validation`] when `value` is not `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(value: &str) -> Result<PrimitiveDateTime, LedgerError> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map_err(|err| LedgerError::Validation(format!("invalid timestamp {value:?}: {err}")))
}

/// Process-local store with spreadsheet semantics.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    sheets: Mutex<BTreeMap<Table, Vec<Vec<String>>>>,
}

impl MemoryTableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sheet<T>(
        &self,
        table: Table,
        apply: impl FnOnce(&mut Vec<Vec<String>>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut sheets = self
            .sheets
            .lock()
            .map_err(|_| LedgerError::Store("memory table store poisoned".to_string()))?;
        apply(sheets.entry(table).or_default())
    }
}

impl TabularStore for MemoryTableStore {
    fn read_all_rows(&self, table: Table) -> Result<TableSnapshot, LedgerError> {
        self.with_sheet(table, |grid| {
            let Some((header_row, data_rows)) = grid.split_first() else {
                return Ok(TableSnapshot::default());
            };
            let headers = header_row.clone();
            let rows = data_rows
                .iter()
                .map(|values| {
                    headers
                        .iter()
                        .enumerate()
                        .map(|(index, header)| {
                            (header.clone(), values.get(index).cloned().unwrap_or_default())
                        })
                        .collect::<Row>()
                })
                .collect();
            Ok(TableSnapshot { headers, rows })
        })
    }

    fn append_row(&self, table: Table, row: &Row) -> Result<(), LedgerError> {
        self.with_sheet(table, |grid| {
            let Some(headers) = grid.first() else {
                return Err(LedgerError::Store(format!(
                    "cannot append to {table}: no header row"
                )));
            };
            let values = headers
                .iter()
                .map(|header| cell(row, header).to_string())
                .collect();
            grid.push(values);
            Ok(())
        })
    }

    fn update_cell(
        &self,
        table: Table,
        row_index: usize,
        column_index: usize,
        value: &str,
    ) -> Result<(), LedgerError> {
        if row_index == 0 || column_index == 0 {
            return Err(LedgerError::Validation(
                "row and column indices are 1-based".to_string(),
            ));
        }
        self.with_sheet(table, |grid| {
            if grid.len() < row_index {
                grid.resize_with(row_index, Vec::new);
            }
            let target = &mut grid[row_index - 1];
            if target.len() < column_index {
                target.resize(column_index, String::new());
            }
            target[column_index - 1] = value.to_string();
            Ok(())
        })
    }

    fn ensure_headers(&self, table: Table, expected: &[&str]) -> Result<(), LedgerError> {
        self.with_sheet(table, |grid| {
            match grid.first_mut() {
                None => grid.push(expected.iter().map(|name| (*name).to_string()).collect()),
                Some(headers) => {
                    for name in expected {
                        if !headers.iter().any(|existing| existing == name) {
                            headers.push((*name).to_string());
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

/// Outcome of a lock acquisition. Denial is a normal result, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockDecision {
    Granted,
    Denied { holder: String, holder_name: String },
}

impl LockDecision {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// Display name of the blocking holder; empty when granted.
    #[must_use]
    pub fn holder_name(&self) -> &str {
        match self {
            Self::Granted => "",
            Self::Denied { holder_name, .. } => holder_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub row_index: usize,
    pub user: String,
    pub holder_name: String,
    pub locked_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockStatus {
    pub holders: Vec<LockHolder>,
    /// More than one distinct user holds a row: two acquisitions interleaved
    /// between their read and their append.
    pub contended: bool,
}

/// Single-holder advisory lock kept in the Lock table.
///
/// `acquire` is a read followed by a conditional append with nothing atomic
/// underneath, so two callers that both observe a free table will both be
/// granted. The race is detected after the fact (see [`LockManager::status`])
/// but not prevented; while it lasts, the user of the first active row is
/// treated as the holder. Locks never expire; only [`LockManager::release`]
/// frees them.
#[derive(Clone, Copy)]
pub struct LockManager<'a> {
    store: &'a dyn TabularStore,
    directory: &'a dyn IdentityDirectory,
    clock: &'a dyn Clock,
}

impl<'a> LockManager<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn TabularStore,
        directory: &'a dyn IdentityDirectory,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
        }
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Lock table cannot be read or
    /// written.
    pub fn acquire(&self, user: &str) -> Result<LockDecision, LedgerError> {
        let snapshot = load(self.store, Table::Lock)?;
        let holders = self.holders(&snapshot);

        if holders.is_empty() {
            let locked_time = format_timestamp(self.clock.now())?;
            let row: Row = [
                (USER.to_string(), user.to_string()),
                (LOCKED_TIME.to_string(), locked_time.clone()),
            ]
            .into_iter()
            .collect();
            self.store.append_row(Table::Lock, &row)?;
            info!(user, %locked_time, "allocation lock acquired");

            let after = self.status()?;
            if after.contended {
                warn!(
                    user,
                    holders = after.holders.len(),
                    "allocation lock granted concurrently to more than one holder"
                );
            }
            return Ok(LockDecision::Granted);
        }

        let first = &holders[0];
        if holders.iter().any(|holder| holder.user != first.user) {
            warn!(
                user,
                first = %first.user,
                holders = holders.len(),
                "allocation lock is contended; the first active row wins"
            );
        }

        if first.user != user {
            debug!(user, holder = %first.user, "allocation lock denied");
            return Ok(LockDecision::Denied {
                holder: first.user.clone(),
                holder_name: first.holder_name.clone(),
            });
        }

        debug!(user, "allocation lock re-entered by its holder");
        Ok(LockDecision::Granted)
    }

    /// Blanks every Lock row held by `user` in place and returns how many
    /// rows were cleared. Rows are never removed.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the Lock table cannot be read or
    /// written.
    pub fn release(&self, user: &str) -> Result<usize, LedgerError> {
        let snapshot = load(self.store, Table::Lock)?;
        let user_column = snapshot.required_column(Table::Lock, USER)?;
        let time_column = snapshot.required_column(Table::Lock, LOCKED_TIME)?;

        let mut released = 0_usize;
        for (position, row) in snapshot.rows.iter().enumerate() {
            if cell(row, USER) != user {
                continue;
            }
            let row_index = TableSnapshot::row_index(position);
            self.store
                .update_cell(Table::Lock, row_index, user_column, "")?;
            self.store
                .update_cell(Table::Lock, row_index, time_column, "")?;
            released += 1;
        }

        if released > 0 {
            info!(user, rows = released, "allocation lock released");
        }
        Ok(released)
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Lock table cannot be read.
    pub fn status(&self) -> Result<LockStatus, LedgerError> {
        let snapshot = load(self.store, Table::Lock)?;
        let holders = self.holders(&snapshot);
        let distinct = holders
            .iter()
            .map(|holder| holder.user.as_str())
            .collect::<BTreeSet<_>>();
        Ok(LockStatus {
            contended: distinct.len() > 1,
            holders,
        })
    }

    fn holders(&self, snapshot: &TableSnapshot) -> Vec<LockHolder> {
        snapshot
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !cell(row, USER).is_empty())
            .map(|(position, row)| {
                let user = cell(row, USER).to_string();
                LockHolder {
                    row_index: TableSnapshot::row_index(position),
                    holder_name: self.display_name(&user),
                    locked_time: cell(row, LOCKED_TIME).to_string(),
                    user,
                }
            })
            .collect()
    }

    fn display_name(&self, credential: &str) -> String {
        self.directory
            .resolve(credential)
            .map_or_else(|| credential.to_string(), |identity| identity.display_name)
    }
}

fn load(store: &dyn TabularStore, table: Table) -> Result<TableSnapshot, LedgerError> {
    store.ensure_headers(table, table.headers())?;
    store.read_all_rows(table)
}

/// Wiring of the external collaborators; cheap to copy.
#[derive(Clone, Copy)]
pub struct Ledger<'a> {
    store: &'a dyn TabularStore,
    directory: &'a dyn IdentityDirectory,
    catalog: &'a CodeCatalog,
    clock: &'a dyn Clock,
}

impl<'a> Ledger<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn TabularStore,
        directory: &'a dyn IdentityDirectory,
        catalog: &'a CodeCatalog,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            store,
            directory,
            catalog,
            clock,
        }
    }

    /// Ensures both tables and their header rows exist.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the store cannot be written.
    pub fn bootstrap(&self) -> Result<(), LedgerError> {
        for table in [Table::Projects, Table::Lock] {
            self.store.ensure_headers(table, table.headers())?;
        }
        Ok(())
    }

    /// Authenticates and opens the session matching the caller's role.
    ///
    /// # Errors
    /// Returns [`LedgerError::Authentication`] on bad credentials and
    /// [`LedgerError::Store`] when the tables cannot be prepared.
    pub fn login(&self, credential: &str, password: &str) -> Result<Session<'a>, LedgerError> {
        let identity = self.directory.authenticate(credential, password)?;
        self.bootstrap()?;
        info!(
            credential,
            role = identity.role.as_str(),
            "session opened"
        );
        Ok(match identity.role {
            Role::Requestor => Session::Requestor(RequestorDesk {
                ledger: *self,
                identity,
            }),
            Role::Approver => Session::Approver(ApproverDesk {
                ledger: *self,
                identity,
            }),
        })
    }

    #[must_use]
    pub fn lock_manager(&self) -> LockManager<'a> {
        LockManager::new(self.store, self.directory, self.clock)
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Projects table cannot be read.
    pub fn projects(&self) -> Result<Vec<ProjectRecord>, LedgerError> {
        Ok(project_records(&self.projects_snapshot()?))
    }

    fn projects_snapshot(&self) -> Result<TableSnapshot, LedgerError> {
        load(self.store, Table::Projects)
    }

    fn now(&self) -> Result<String, LedgerError> {
        format_timestamp(self.clock.now())
    }
}

/// A logged-in actor; the variant fixes which operations are available.
pub enum Session<'a> {
    Requestor(RequestorDesk<'a>),
    Approver(ApproverDesk<'a>),
}

impl Session<'_> {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Requestor(desk) => &desk.identity,
            Self::Approver(desk) => &desk.identity,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.identity().role
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Lock table cannot be updated.
    pub fn logout(&self) -> Result<(), LedgerError> {
        match self {
            Self::Requestor(desk) => desk.logout(),
            Self::Approver(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReserveOutcome {
    /// A new row was allocated; the caller now holds the allocation lock.
    Created { record: ProjectRecord },
    /// The caller already had a reservation, which must be finished first.
    Existing { record: ProjectRecord },
    /// Another requestor holds the allocation lock.
    Busy { holder: String, holder_name: String },
}

pub struct RequestorDesk<'a> {
    ledger: Ledger<'a>,
    identity: Identity,
}

impl RequestorDesk<'_> {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Projects table cannot be read.
    pub fn current_reservation(&self) -> Result<Option<ProjectRecord>, LedgerError> {
        let snapshot = self.ledger.projects_snapshot()?;
        Ok(self.find_reserved(&snapshot))
    }

    /// Allocates a new identifier unless the caller already has a reservation.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for uncatalogued codes and
    /// [`LedgerError::Store`] on store failure.
    pub fn reserve(&self, selection: &ProjectSelection) -> Result<ReserveOutcome, LedgerError> {
        let catalog = self.ledger.catalog;
        catalog.validate(selection)?;

        if let Some(record) = self.current_reservation()? {
            debug!(
                applicant = %self.identity.display_name,
                project_id = %record.project_id,
                "existing reservation returned instead of allocating"
            );
            return Ok(ReserveOutcome::Existing { record });
        }

        if let LockDecision::Denied {
            holder,
            holder_name,
        } = self.ledger.lock_manager().acquire(&self.identity.credential)?
        {
            return Ok(ReserveOutcome::Busy {
                holder,
                holder_name,
            });
        }

        let snapshot = self.ledger.projects_snapshot()?;
        // A rejection may have reopened one of the caller's rows since the first read.
        if let Some(record) = self.find_reserved(&snapshot) {
            debug!(
                applicant = %self.identity.display_name,
                project_id = %record.project_id,
                "reservation reopened while acquiring the lock"
            );
            return Ok(ReserveOutcome::Existing { record });
        }
        let sequence_number = next_sequence_number(&snapshot, &selection.client_code)?;
        let project_id = compose_project_id(
            &selection.client_code,
            &selection.project_type_code,
            &selection.cooling_code,
            &selection.department_code,
            &sequence_number,
        );

        let record = ProjectRecord {
            row_index: TableSnapshot::row_index(snapshot.rows.len()),
            client: catalog.label(CodeKind::Client, &selection.client_code)?,
            project_type: catalog.label(CodeKind::ProjectType, &selection.project_type_code)?,
            cooling: catalog.label(CodeKind::Cooling, &selection.cooling_code)?,
            department: catalog.label(CodeKind::Department, &selection.department_code)?,
            sequence_number,
            project_id,
            created_time: self.ledger.now()?,
            status: Some(ProjectStatus::Reserved),
            note: selection.note.clone(),
            applicant: self.identity.display_name.clone(),
            approver: String::new(),
        };
        self.ledger
            .store
            .append_row(Table::Projects, &record.to_row())?;
        info!(
            applicant = %record.applicant,
            project_id = %record.project_id,
            "project id reserved"
        );

        Ok(ReserveOutcome::Created { record })
    }

    /// Rewrites the reservation's codes and note, moves it to pending
    /// approval and releases the caller's lock. The identifier and sequence
    /// number stay as allocated.
    ///
    /// # Errors
    /// Returns [`LedgerError::NoReservation`] when the caller has no Reserved
    /// row, [`LedgerError::Validation`] for uncatalogued codes and
    /// [`LedgerError::Store`] on store failure.
    pub fn submit(&self, selection: &ProjectSelection) -> Result<ProjectRecord, LedgerError> {
        let catalog = self.ledger.catalog;
        catalog.validate(selection)?;

        let snapshot = self.ledger.projects_snapshot()?;
        let mut record = self.require_reserved(&snapshot)?;
        let status = self.transition(&record, WorkflowAction::Submit)?;

        record.client = catalog.label(CodeKind::Client, &selection.client_code)?;
        record.project_type = catalog.label(CodeKind::ProjectType, &selection.project_type_code)?;
        record.cooling = catalog.label(CodeKind::Cooling, &selection.cooling_code)?;
        record.department = catalog.label(CodeKind::Department, &selection.department_code)?;
        record.note.clone_from(&selection.note);
        record.status = Some(status);
        record.created_time = self.ledger.now()?;

        let writes = [
            (CLIENT, record.client.as_str()),
            (PROJECT, record.project_type.as_str()),
            (COOLING, record.cooling.as_str()),
            (DEPARTMENT, record.department.as_str()),
            (NOTE, record.note.as_str()),
            (STATUS, status.as_str()),
            (CREATED_TIME, record.created_time.as_str()),
        ];
        for (header, value) in writes {
            let column = snapshot.required_column(Table::Projects, header)?;
            self.ledger
                .store
                .update_cell(Table::Projects, record.row_index, column, value)?;
        }
        info!(project_id = %record.project_id, "reservation submitted for approval");

        self.ledger
            .lock_manager()
            .release(&self.identity.credential)?;
        Ok(record)
    }

    /// # Errors
    /// Returns [`LedgerError::NoReservation`] when the caller has no Reserved
    /// row and [`LedgerError::Store`] on store failure.
    pub fn cancel(&self) -> Result<ProjectRecord, LedgerError> {
        let snapshot = self.ledger.projects_snapshot()?;
        let mut record = self.require_reserved(&snapshot)?;
        let status = self.transition(&record, WorkflowAction::Cancel)?;

        let column = snapshot.required_column(Table::Projects, STATUS)?;
        self.ledger
            .store
            .update_cell(Table::Projects, record.row_index, column, status.as_str())?;
        record.status = Some(status);
        info!(project_id = %record.project_id, "reservation cancelled");

        self.ledger
            .lock_manager()
            .release(&self.identity.credential)?;
        Ok(record)
    }

    /// Every record whose applicant is the caller, in table order.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the Projects table cannot be read.
    pub fn history(&self) -> Result<Vec<ProjectRecord>, LedgerError> {
        Ok(self
            .ledger
            .projects()?
            .into_iter()
            .filter(|record| record.applicant == self.identity.display_name)
            .collect())
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Lock table cannot be updated.
    pub fn logout(&self) -> Result<(), LedgerError> {
        self.ledger
            .lock_manager()
            .release(&self.identity.credential)?;
        Ok(())
    }

    fn find_reserved(&self, snapshot: &TableSnapshot) -> Option<ProjectRecord> {
        snapshot.rows.iter().enumerate().find_map(|(position, row)| {
            (cell(row, APPLICANT) == self.identity.display_name
                && ProjectStatus::parse(cell(row, STATUS)) == Some(ProjectStatus::Reserved))
            .then(|| ProjectRecord::from_row(position, row))
        })
    }

    fn require_reserved(&self, snapshot: &TableSnapshot) -> Result<ProjectRecord, LedgerError> {
        self.find_reserved(snapshot)
            .ok_or_else(|| LedgerError::NoReservation(self.identity.display_name.clone()))
    }

    fn transition(
        &self,
        record: &ProjectRecord,
        action: WorkflowAction,
    ) -> Result<ProjectStatus, LedgerError> {
        let from = record.status.ok_or_else(|| {
            LedgerError::Validation(format!("{} has no recognised status", record.project_id))
        })?;
        ensure_actor(&self.identity, action)?;
        next_status(from, action)
    }
}

/// Rejects an action the identity's role may not perform.
fn ensure_actor(identity: &Identity, action: WorkflowAction) -> Result<(), LedgerError> {
    if action.actor() == identity.role {
        return Ok(());
    }
    Err(LedgerError::Validation(format!(
        "{} is a {} and cannot {action}",
        identity.credential, identity.role
    )))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    NotPending,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRow {
    pub project_id: String,
    pub reason: SkipReason,
}

/// Per-row results of an approve or reject batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub action: WorkflowAction,
    pub approver: String,
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedRow>,
}

pub struct ApproverDesk<'a> {
    ledger: Ledger<'a>,
    identity: Identity,
}

impl ApproverDesk<'_> {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] when the Projects table cannot be read.
    pub fn pending(&self) -> Result<Vec<ProjectRecord>, LedgerError> {
        Ok(self
            .ledger
            .projects()?
            .into_iter()
            .filter(|record| record.status == Some(ProjectStatus::PendingApproval))
            .collect())
    }

    /// # Errors
    /// Returns [`LedgerError::Store`] on store failure.
    pub fn approve(&self, project_ids: &[String]) -> Result<BatchReport, LedgerError> {
        self.decide(project_ids, WorkflowAction::Approve)
    }

    /// Sends each row back to `Reserved`. The approver cell keeps the
    /// rejecting approver's name until a later decision overwrites it.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] on store failure.
    pub fn reject(&self, project_ids: &[String]) -> Result<BatchReport, LedgerError> {
        self.decide(project_ids, WorkflowAction::Reject)
    }

    fn decide(
        &self,
        project_ids: &[String],
        action: WorkflowAction,
    ) -> Result<BatchReport, LedgerError> {
        ensure_actor(&self.identity, action)?;
        let snapshot = self.ledger.projects_snapshot()?;
        let status_column = snapshot.required_column(Table::Projects, STATUS)?;
        let approver_column = snapshot.required_column(Table::Projects, APPROVER)?;

        let mut report = BatchReport {
            action,
            approver: self.identity.display_name.clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        let mut seen = BTreeSet::new();

        for project_id in project_ids {
            if !seen.insert(project_id.as_str()) {
                report.skipped.push(SkippedRow {
                    project_id: project_id.clone(),
                    reason: SkipReason::Duplicate,
                });
                continue;
            }

            let found = snapshot
                .rows
                .iter()
                .position(|row| cell(row, PROJECT_ID) == project_id.as_str());
            let Some(position) = found else {
                debug!(%project_id, action = action.as_str(), "project not found, skipped");
                report.skipped.push(SkippedRow {
                    project_id: project_id.clone(),
                    reason: SkipReason::NotFound,
                });
                continue;
            };

            let status = ProjectStatus::parse(cell(&snapshot.rows[position], STATUS));
            let Some(Ok(next)) = status.map(|from| next_status(from, action)) else {
                debug!(%project_id, action = action.as_str(), "project not pending, skipped");
                report.skipped.push(SkippedRow {
                    project_id: project_id.clone(),
                    reason: SkipReason::NotPending,
                });
                continue;
            };

            let row_index = TableSnapshot::row_index(position);
            self.ledger
                .store
                .update_cell(Table::Projects, row_index, status_column, next.as_str())?;
            self.ledger.store.update_cell(
                Table::Projects,
                row_index,
                approver_column,
                &self.identity.display_name,
            )?;
            info!(
                %project_id,
                action = action.as_str(),
                approver = %self.identity.display_name,
                "approval decision recorded"
            );
            report.applied.push(project_id.clone());
        }

        Ok(report)
    }
}
