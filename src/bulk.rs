use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::time::{Instant, sleep, timeout};

use crate::error::{ClassifiedError, RunError};
use crate::events::{EventSender, ProgressEvent, emit};
use crate::portal::{JobInput, PortalAdapter};
use crate::report::{JobRecord, RunReport};
use crate::session::SessionManager;

#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// In-flight extractions at run start.
    pub initial_concurrency: usize,
    /// Floor the pool degrades to after repeated failures.
    pub min_concurrency: usize,
    /// Consecutive failures that trigger the degrade. Never restored within
    /// a run; every run starts back at `initial_concurrency`.
    pub consecutive_failure_threshold: u32,
    /// Fixed delay before the second dispatched job starts network work.
    pub startup_stagger: Duration,
    /// Base for the randomized delay on later dispatches, drawn from
    /// [0.5x, 1.5x) so workers never fall into lockstep.
    pub dispatch_jitter: Duration,
    /// Pause inserted before the next dispatch after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Bound on a single extraction attempt.
    pub job_timeout: Duration,
    /// Completions between throughput reports.
    pub progress_every: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 2,
            min_concurrency: 1,
            consecutive_failure_threshold: 3,
            startup_stagger: Duration::from_secs(4),
            dispatch_jitter: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(2),
            job_timeout: Duration::from_secs(120),
            progress_every: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

/// One unit of bulk work. Owned by the queue while Pending, by exactly one
/// pool slot while Running, and moved into the report when terminal.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub index: usize,
    pub input: JobInput,
    /// Dispatch number, 1-based once the job first enters a slot. A job is
    /// re-dispatched at most once (rate-limit requeue), so this caps at 2.
    pub attempt: u32,
    /// Extraction calls across all dispatches, including managed auth
    /// retries inside a dispatch.
    pub extract_calls: u32,
    pub state: JobState,
}

impl ExtractionJob {
    fn new(index: usize, input: JobInput) -> Self {
        Self {
            index,
            input,
            attempt: 0,
            extract_calls: 0,
            state: JobState::Pending,
        }
    }
}

struct JobOutcome {
    job: ExtractionJob,
    result: Result<Value, ClassifiedError>,
}

/// Run every roster entry against one shared portal session.
///
/// All run state mutation (counters, concurrency level, records) lives in
/// the completion arm of the loop below; job futures only compute their own
/// outcome, so no two jobs ever race on shared state. Job-level errors are
/// captured into the report; the only propagated failure is the very first
/// session acquisition.
pub async fn run_bulk(
    session: Arc<SessionManager>,
    adapter: Arc<dyn PortalAdapter>,
    inputs: Vec<JobInput>,
    config: &BulkConfig,
    progress_hub: Option<Arc<MultiProgress>>,
    events: Option<EventSender>,
    shutdown_requested: Arc<AtomicBool>,
) -> Result<RunReport, RunError> {
    let started = Instant::now();
    let portal_id = session.portal_id().to_string();
    let total = inputs.len();

    if total == 0 {
        println!("Roster is empty; nothing to extract.");
        return Ok(RunReport::empty(portal_id));
    }

    let min_concurrency = config.min_concurrency.max(1);
    let mut current_concurrency = config.initial_concurrency.max(min_concurrency);
    let progress_every = config.progress_every.max(1);

    emit(
        &events,
        ProgressEvent::RunStarted {
            portal: portal_id.clone(),
            total,
            concurrency: current_concurrency,
        },
    );

    // One session for the whole run, established before any job dispatches.
    session
        .ensure_session()
        .await
        .map_err(|source| RunError::InitialAuth {
            portal: portal_id.clone(),
            source,
        })?;
    emit(
        &events,
        ProgressEvent::SessionEstablished {
            portal: portal_id.clone(),
        },
    );

    println!(
        "Starting extraction of {total} patients with {current_concurrency} workers on {portal_id}."
    );

    let progress = match &progress_hub {
        Some(hub) => hub.add(ProgressBar::new(total as u64)),
        None => ProgressBar::new(total as u64),
    };
    progress.set_prefix("BULK");
    apply_bulk_progress_style(&progress);
    progress.enable_steady_tick(Duration::from_millis(250));
    progress.set_message("starting extractions");

    let mut queue: VecDeque<ExtractionJob> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| ExtractionJob::new(index, input))
        .collect();
    let mut in_flight = FuturesUnordered::new();
    let mut records: Vec<Option<JobRecord>> = std::iter::repeat_with(|| None).take(total).collect();

    let mut launch_seq = 0usize;
    let mut processed = 0usize;
    let mut successes = 0usize;
    let mut failures = 0usize;
    let mut consecutive_failures = 0u32;
    let mut cooldowns_applied = 0usize;
    let mut pending_cooldown: Option<Duration> = None;

    while in_flight.len() < current_concurrency && !queue.is_empty() {
        if shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
        if let Some(mut job) = queue.pop_front() {
            let delay = dispatch_delay(config, launch_seq);
            launch_seq += 1;
            job.attempt += 1;
            in_flight.push(run_one_job(
                Arc::clone(&session),
                Arc::clone(&adapter),
                job,
                delay,
                config.job_timeout,
            ));
        }
    }

    while let Some(outcome) = in_flight.next().await {
        let JobOutcome { mut job, result } = outcome;
        debug_assert_eq!(job.state, JobState::Running);

        match result {
            Ok(payload) => {
                job.state = JobState::Succeeded;
                consecutive_failures = 0;
                successes += 1;
                processed += 1;
                emit(
                    &events,
                    ProgressEvent::JobSucceeded {
                        index: job.index,
                        subscriber_id: job.input.subscriber_id.clone(),
                    },
                );
                records[job.index] = Some(JobRecord::success(
                    job.index,
                    &job.input,
                    job.extract_calls,
                    payload,
                ));
                progress.inc(1);
            }
            Err(err) => {
                consecutive_failures += 1;
                if err.is_rate_limited() {
                    let cooldown = config
                        .rate_limit_cooldown
                        .max(err.rate_limit_hint().unwrap_or(Duration::ZERO));
                    pending_cooldown =
                        Some(cooldown.max(pending_cooldown.unwrap_or(Duration::ZERO)));
                }
                let requeue = err.is_rate_limited()
                    && job.attempt < 2
                    && !shutdown_requested.load(Ordering::SeqCst);
                if requeue {
                    job.state = JobState::FailedRetryable;
                    println!(
                        "[{}/{}] {} was rate limited; requeueing once after cooldown",
                        job.index + 1,
                        total,
                        job.input.subscriber_id
                    );
                    emit(
                        &events,
                        ProgressEvent::JobRequeued {
                            index: job.index,
                            subscriber_id: job.input.subscriber_id.clone(),
                        },
                    );
                    queue.push_front(job);
                } else {
                    job.state = JobState::FailedTerminal;
                    failures += 1;
                    processed += 1;
                    emit(
                        &events,
                        ProgressEvent::JobFailed {
                            index: job.index,
                            subscriber_id: job.input.subscriber_id.clone(),
                            kind: err.kind(),
                            message: err.to_string(),
                        },
                    );
                    records[job.index] = Some(JobRecord::failure(
                        job.index,
                        &job.input,
                        job.extract_calls,
                        &err,
                    ));
                    progress.inc(1);
                }
            }
        }

        if consecutive_failures >= config.consecutive_failure_threshold
            && current_concurrency > min_concurrency
        {
            println!(
                "{consecutive_failures} consecutive failures; dropping concurrency to {min_concurrency} for the rest of the run"
            );
            emit(
                &events,
                ProgressEvent::ConcurrencyReduced {
                    from: current_concurrency,
                    to: min_concurrency,
                },
            );
            current_concurrency = min_concurrency;
        }

        progress.set_message(format!(
            "ok={successes} failed={failures} in_flight={} queued={}",
            in_flight.len(),
            queue.len()
        ));

        if processed > 0 && processed % progress_every == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            let per_minute = if elapsed > 0.0 {
                processed as f64 / (elapsed / 60.0)
            } else {
                0.0
            };
            let eta_seconds = if per_minute > 0.0 {
                ((total - processed) as f64 / per_minute * 60.0) as u64
            } else {
                0
            };
            emit(
                &events,
                ProgressEvent::Throughput {
                    processed,
                    total,
                    per_minute,
                    eta_seconds,
                },
            );
        }

        if shutdown_requested.load(Ordering::SeqCst) {
            // Drain in-flight work without starting anything new.
            continue;
        }

        if let Some(cooldown) = pending_cooldown.take() {
            if !queue.is_empty() || !in_flight.is_empty() {
                cooldowns_applied += 1;
                println!(
                    "Rate limit detected; cooling down for {cooldown:?} before the next dispatch"
                );
                emit(
                    &events,
                    ProgressEvent::CooldownApplied { duration: cooldown },
                );
                sleep(cooldown).await;
            }
        }

        while in_flight.len() < current_concurrency && !queue.is_empty() {
            if let Some(mut job) = queue.pop_front() {
                let delay = dispatch_delay(config, launch_seq);
                launch_seq += 1;
                job.attempt += 1;
                in_flight.push(run_one_job(
                    Arc::clone(&session),
                    Arc::clone(&adapter),
                    job,
                    delay,
                    config.job_timeout,
                ));
            }
        }
    }

    let mut interrupted = 0usize;
    while let Some(job) = queue.pop_front() {
        interrupted += 1;
        records[job.index] = Some(JobRecord::interrupted(job.index, &job.input));
    }

    let duration = started.elapsed();
    let duration_seconds = duration.as_secs();
    let jobs_per_minute = if duration.as_secs_f64() > 0.0 {
        processed as f64 / (duration.as_secs_f64() / 60.0)
    } else {
        0.0
    };

    if interrupted > 0 {
        progress.abandon_with_message(format!(
            "graceful stop: ok={successes} failed={failures} interrupted={interrupted}"
        ));
    } else {
        progress.finish_with_message(format!(
            "done: ok={successes} failed={failures} in {duration_seconds}s"
        ));
    }
    emit(
        &events,
        ProgressEvent::RunFinished {
            successes,
            failures,
            interrupted,
            duration_seconds,
        },
    );

    let records = records.into_iter().flatten().collect::<Vec<_>>();
    let report = RunReport {
        portal_id,
        total,
        successes,
        failures,
        interrupted,
        duration_seconds,
        jobs_per_minute,
        final_concurrency: current_concurrency,
        cooldowns_applied,
        records,
    };
    // Every input must have settled into exactly one record.
    debug_assert!(report.is_complete());
    Ok(report)
}

/// Startup pacing: the first job goes immediately, the second waits a fixed
/// stagger, everything after gets randomized jitter so parallel workers do
/// not issue synchronized request bursts.
fn dispatch_delay(config: &BulkConfig, launch_seq: usize) -> Duration {
    match launch_seq {
        0 => Duration::ZERO,
        1 => config.startup_stagger,
        _ => {
            if config.dispatch_jitter.is_zero() {
                Duration::ZERO
            } else {
                config.dispatch_jitter.mul_f64(0.5 + rand::random::<f64>())
            }
        }
    }
}

async fn run_one_job(
    session: Arc<SessionManager>,
    adapter: Arc<dyn PortalAdapter>,
    mut job: ExtractionJob,
    delay: Duration,
    job_timeout: Duration,
) -> JobOutcome {
    if !delay.is_zero() {
        sleep(delay).await;
    }
    job.state = JobState::Running;

    let calls = Arc::new(AtomicU32::new(0));
    let input = job.input.clone();
    let result = session
        .with_retry_on_auth_failure(|handle| {
            let adapter = Arc::clone(&adapter);
            let input = input.clone();
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match timeout(job_timeout, adapter.extract(&handle, &input)).await {
                    Ok(result) => result,
                    Err(_) => Err(ClassifiedError::Timeout(job_timeout)),
                }
            }
        })
        .await;

    job.extract_calls += calls.load(Ordering::SeqCst);
    JobOutcome { job, result }
}

fn apply_bulk_progress_style(progress: &ProgressBar) {
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:32.cyan/blue}] \
{pos}/{len} ({percent}%) {per_sec} eta {eta_precise} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
}
