mod args;
mod bulk;
mod common;
mod constants;
mod ddins;
mod dnoa;
mod error;
mod events;
mod portal;
mod report;
mod roster;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::MultiProgress;
use reqwest::Client;
use std::{
    env, fs,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};
use tokio::sync::mpsc::unbounded_channel;

use args::{Args, PortalKind};
use bulk::{BulkConfig, run_bulk};
use common::{default_report_paths, install_ctrlc_handler, project_root};
use ddins::DdinsAdapter;
use dnoa::DnoaAdapter;
use events::ProgressEvent;
use portal::PortalAdapter;
use roster::read_roster_file;
use session::{SessionManager, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let portal_id = args.portal.id();

    let data_dir = project_root().join("data");
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed creating data directory {}", data_dir.display()))?;

    let mut patients = read_roster_file(&args.input_path)?;
    println!(
        "Loaded {} patients from {}",
        patients.len(),
        args.input_path.display()
    );
    if let Some(cap) = args.max_jobs {
        if patients.len() > cap {
            println!("Applying --max-jobs={} (from {}).", cap, patients.len());
            patients.truncate(cap);
        }
    }

    let (default_csv, default_json) = default_report_paths(portal_id, &data_dir);
    let output_csv = args.output_csv.clone().unwrap_or(default_csv);
    let output_json = args.output_json.clone().unwrap_or(default_json);
    let session_db = args
        .session_db
        .clone()
        .unwrap_or_else(|| data_dir.join("portal_sessions.sqlite"));

    let client = Client::builder()
        .user_agent("eligibility-extractor/0.1")
        .cookie_store(true)
        .build()
        .context("Failed creating HTTP client")?;

    let adapter: Arc<dyn PortalAdapter> = match args.portal {
        PortalKind::Dnoa => {
            let username = args
                .username
                .clone()
                .or_else(|| env::var("DNOA_USERNAME").ok());
            let password = args
                .password
                .clone()
                .or_else(|| env::var("DNOA_PASSWORD").ok());
            Arc::new(DnoaAdapter::new(
                client.clone(),
                args.dnoa_base_url.clone(),
                username,
                password,
            ))
        }
        PortalKind::Ddins => {
            let storage_state = args
                .ddins_storage_state
                .clone()
                .or_else(|| env::var("DDINS_SESSION_PATH").ok().map(Into::into))
                .unwrap_or_else(|| data_dir.join("ddins-storage-state.json"));
            let login_command = args
                .ddins_login_command
                .clone()
                .or_else(|| env::var("DDINS_LOGIN_COMMAND").ok());
            let pt_user_id = args
                .ddins_pt_userid
                .clone()
                .or_else(|| env::var("DDINS_PT_USERID").ok());
            Arc::new(DdinsAdapter::new(
                client.clone(),
                args.ddins_base_url.clone(),
                storage_state,
                login_command,
                pt_user_id,
            ))
        }
    };

    // A broken store only costs persistence across runs, never the run.
    let store = match SessionStore::open(&session_db) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            println!(
                "Could not open session store {} ({err:#}); continuing without persistence",
                session_db.display()
            );
            None
        }
    };

    let session = Arc::new(SessionManager::new(
        Arc::clone(&adapter),
        store,
        Duration::from_secs(args.login_timeout_secs),
    ));
    if args.fresh_login {
        println!("--fresh-login set; ignoring any stored {portal_id} session.");
        session.invalidate().await;
    }

    let config = BulkConfig {
        initial_concurrency: args.concurrency,
        min_concurrency: args.min_concurrency,
        consecutive_failure_threshold: args.consecutive_failure_threshold,
        startup_stagger: Duration::from_millis(args.startup_stagger_ms),
        dispatch_jitter: Duration::from_millis(args.dispatch_jitter_ms),
        rate_limit_cooldown: Duration::from_millis(args.rate_limit_cooldown_ms),
        job_timeout: Duration::from_secs(args.job_timeout_secs),
        ..BulkConfig::default()
    };

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(Arc::clone(&shutdown_requested));

    let progress_hub = Arc::new(MultiProgress::new());
    let (events_tx, mut events_rx) = unbounded_channel();
    let failure_log = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let ProgressEvent::JobFailed {
                index,
                subscriber_id,
                kind,
                message,
            } = event
            {
                lines.push(format!("  [{}] {subscriber_id} {kind}: {message}", index + 1));
            }
        }
        lines
    });

    let report = run_bulk(
        session,
        adapter,
        patients,
        &config,
        Some(progress_hub),
        Some(events_tx),
        shutdown_requested,
    )
    .await?;

    let failure_lines = failure_log.await.unwrap_or_default();
    if !failure_lines.is_empty() {
        println!("Failed patients:");
        for line in failure_lines.iter().take(20) {
            println!("{line}");
        }
        if failure_lines.len() > 20 {
            println!("  ... and {} more (see the report)", failure_lines.len() - 20);
        }
    }

    report.export_csv(&output_csv)?;
    println!("Wrote run report CSV {}", output_csv.display());
    report.export_json(&output_json)?;
    println!("Wrote run report JSON {}", output_json.display());

    report.print_summary_table();
    Ok(())
}
