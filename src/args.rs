use clap::Parser;

use crate::constants::{DEFAULT_DDINS_BASE_URL, DEFAULT_DNOA_BASE_URL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PortalKind {
    Dnoa,
    Ddins,
}

impl PortalKind {
    pub fn id(&self) -> &'static str {
        match self {
            Self::Dnoa => "dnoa",
            Self::Ddins => "ddins",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "eligibility_extractor")]
#[command(
    about = "Run bulk dental eligibility/benefits extractions against a provider portal with a shared, self-refreshing session"
)]
pub struct Args {
    /// Portal to extract from.
    #[arg(long, value_enum)]
    pub portal: PortalKind,

    /// Patient roster path. One patient per line:
    /// subscriber_id, date_of_birth[, first_name, last_name].
    #[arg(long)]
    pub input_path: std::path::PathBuf,

    /// Run report CSV output path. Defaults to data/<portal>-run-report.csv.
    #[arg(long)]
    pub output_csv: Option<std::path::PathBuf>,

    /// Full JSON report output path. Defaults to data/<portal>-run-report.json.
    #[arg(long)]
    pub output_json: Option<std::path::PathBuf>,

    /// SQLite database holding persisted portal sessions.
    #[arg(long)]
    pub session_db: Option<std::path::PathBuf>,

    /// Ignore any stored session and force a fresh login for this run.
    #[arg(long, default_value_t = false)]
    pub fresh_login: bool,

    /// Max concurrent in-flight extractions at run start.
    #[arg(long, default_value_t = 2)]
    pub concurrency: usize,

    /// Concurrency floor the pool degrades to after repeated failures.
    #[arg(long, default_value_t = 1)]
    pub min_concurrency: usize,

    /// Consecutive failures that trigger the degrade to the floor.
    #[arg(long, default_value_t = 3)]
    pub consecutive_failure_threshold: u32,

    /// Fixed delay in milliseconds before the second job starts, so the
    /// first two workers never hit the portal simultaneously.
    #[arg(long, default_value_t = 4000)]
    pub startup_stagger_ms: u64,

    /// Base for the randomized dispatch jitter in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub dispatch_jitter_ms: u64,

    /// Cooldown in milliseconds inserted after a rate-limit response.
    #[arg(long, default_value_t = 2000)]
    pub rate_limit_cooldown_ms: u64,

    /// Per-patient extraction timeout in seconds.
    #[arg(long, default_value_t = 120)]
    pub job_timeout_secs: u64,

    /// Login timeout in seconds. Interactive logins (Okta, MFA) are slow.
    #[arg(long, default_value_t = 180)]
    pub login_timeout_secs: u64,

    /// Optional cap on patients taken from the roster this run.
    #[arg(long)]
    pub max_jobs: Option<usize>,

    /// Portal username. Falls back to DNOA_USERNAME for --portal dnoa.
    #[arg(long)]
    pub username: Option<String>,

    /// Portal password. Falls back to DNOA_PASSWORD for --portal dnoa.
    #[arg(long)]
    pub password: Option<String>,

    /// DNOA API base URL.
    #[arg(long, default_value = DEFAULT_DNOA_BASE_URL)]
    pub dnoa_base_url: String,

    /// DDINS API base URL.
    #[arg(long, default_value = DEFAULT_DDINS_BASE_URL)]
    pub ddins_base_url: String,

    /// Storage-state JSON the DDINS login command refreshes.
    /// Falls back to DDINS_SESSION_PATH, then data/ddins-storage-state.json.
    #[arg(long)]
    pub ddins_storage_state: Option<std::path::PathBuf>,

    /// External command that performs the DDINS browser login and rewrites
    /// the storage-state file. Falls back to DDINS_LOGIN_COMMAND.
    #[arg(long)]
    pub ddins_login_command: Option<String>,

    /// pt-userid header for DDINS API calls. Falls back to DDINS_PT_USERID.
    #[arg(long)]
    pub ddins_pt_userid: Option<String>,
}
