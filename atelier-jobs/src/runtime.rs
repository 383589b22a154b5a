use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;
use uuid::Uuid;

use atelier_store::AdvisoryLocks;
use atelier_telemetry::OpsTelemetry;
use atelier_tenancy::TenantContext;

use crate::BACKOFF_CAP;
use crate::Job;
use crate::JobError;
use crate::JobHandler;
use crate::JobResult;
use crate::JobSpec;
use crate::backoff_delay;

#[derive(Default)]
struct QueueState {
    ready: Vec<Job>,
    delayed: Vec<(DateTime<Utc>, Job)>,
    completed: Vec<Job>,
}

#[derive(Default)]
struct RuntimeState {
    queues: BTreeMap<String, QueueState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub name: String,
    pub every: Duration,
    pub lock_key: String,
}

#[async_trait]
pub trait ScheduledHandler: Send + Sync {
    async fn run(&self) -> JobResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledOutcome {
    Ran,
    /// Another replica holds the schedule's advisory lock.
    Skipped,
}

type HandlerMap = StdRwLock<BTreeMap<String, Arc<dyn JobHandler>>>;
type ScheduleMap = StdRwLock<BTreeMap<String, (Schedule, Arc<dyn ScheduledHandler>)>>;

/// In-process job runtime. Queue state is durable for the life of the
/// process; the production deployment maps the same contract onto a
/// store-backed queue without touching queue owners.
pub struct JobRuntime {
    state: AsyncMutex<RuntimeState>,
    handlers: HandlerMap,
    schedules: ScheduleMap,
    advisory: Arc<AdvisoryLocks>,
    telemetry: OpsTelemetry,
    attempt_timeout: Duration,
    work_available: Notify,
    went_idle: Notify,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
}

impl JobRuntime {
    #[must_use]
    pub fn new(advisory: Arc<AdvisoryLocks>, telemetry: OpsTelemetry) -> Arc<Self> {
        Arc::new(Self {
            state: AsyncMutex::new(RuntimeState::default()),
            handlers: StdRwLock::new(BTreeMap::new()),
            schedules: StdRwLock::new(BTreeMap::new()),
            advisory,
            telemetry,
            attempt_timeout: Duration::from_secs(30),
            work_available: Notify::new(),
            went_idle: Notify::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn register(&self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let queue = queue.into();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue, handler);
    }

    pub fn register_scheduled(&self, schedule: Schedule, handler: Arc<dyn ScheduledHandler>) {
        self.schedules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schedule.name.clone(), (schedule, handler));
    }

    /// Enqueues a job, capturing the ambient tenant context so the worker
    /// re-establishes it per attempt.
    pub async fn enqueue(&self, spec: JobSpec) -> JobResult<Uuid> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(JobError::ShuttingDown);
        }
        let job = Job {
            id: Uuid::new_v4(),
            spec,
            attempts: 0,
            context: TenantContext::current(),
            enqueued_at: Utc::now(),
            last_error: None,
        };
        let id = job.id;
        let mut state = self.state.lock().await;
        state.queues.entry(job.spec.queue.clone()).or_default().ready.push(job);
        drop(state);
        self.work_available.notify_waiters();
        Ok(id)
    }

    fn promote_due(state: &mut RuntimeState, now: DateTime<Utc>) {
        for queue in state.queues.values_mut() {
            let mut still_delayed = Vec::new();
            queue.delayed.sort_by_key(|(due, _)| *due);
            for (due, job) in queue.delayed.drain(..) {
                if due <= now {
                    queue.ready.push(job);
                } else {
                    still_delayed.push((due, job));
                }
            }
            queue.delayed = still_delayed;
        }
    }

    fn pop_ready(state: &mut RuntimeState) -> Option<Job> {
        for queue in state.queues.values_mut() {
            if !queue.ready.is_empty() {
                return Some(queue.ready.remove(0));
            }
        }
        None
    }

    /// Processes every ready and currently-due job across all queues,
    /// including retries that fall due while draining. Returns the number
    /// of attempts executed.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        loop {
            let next = {
                let mut state = self.state.lock().await;
                Self::promote_due(&mut state, Utc::now());
                Self::pop_ready(&mut state)
            };
            let Some(job) = next else {
                break;
            };
            self.process(job).await;
            processed += 1;
        }
        self.went_idle.notify_waiters();
        processed
    }

    /// Promotes every delayed job to ready regardless of its due time.
    /// Test hook for exercising retry ladders without wall-clock waits.
    pub async fn force_retries(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut promoted = 0;
        for queue in state.queues.values_mut() {
            queue.delayed.sort_by_key(|(due, _)| *due);
            for (_, job) in queue.delayed.drain(..) {
                queue.ready.push(job);
                promoted += 1;
            }
        }
        drop(state);
        if promoted > 0 {
            self.work_available.notify_waiters();
        }
        promoted
    }

    async fn process(&self, mut job: Job) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job.spec.queue)
            .cloned();
        let Some(handler) = handler else {
            error!(queue = %job.spec.queue, name = %job.spec.name, "dropping job without handler");
            return;
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        job.attempts += 1;

        let budget = self.attempt_timeout;
        let attempt = async {
            match tokio::time::timeout(budget, handler.handle(&job)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::TimedOut(budget)),
            }
        };
        let result = match job.context.clone() {
            Some(context) => TenantContext::scope(context, attempt).await,
            None => attempt.await,
        };

        match result {
            Ok(()) => {
                debug!(queue = %job.spec.queue, name = %job.spec.name, attempts = job.attempts, "job complete");
                if !job.spec.remove_on_complete {
                    let mut state = self.state.lock().await;
                    state
                        .queues
                        .entry(job.spec.queue.clone())
                        .or_default()
                        .completed
                        .push(job);
                }
            }
            Err(err) if job.attempts >= job.spec.max_attempts => {
                warn!(
                    queue = %job.spec.queue,
                    name = %job.spec.name,
                    attempts = job.attempts,
                    error = %err,
                    "job exhausted"
                );
                self.telemetry.record_job_exhausted();
                let hook = handler.exhausted(&job, &err);
                match job.context.clone() {
                    Some(context) => TenantContext::scope(context, hook).await,
                    None => hook.await,
                }
            }
            Err(err) => {
                let delay = backoff_delay(job.spec.backoff_base, BACKOFF_CAP, job.attempts);
                debug!(
                    queue = %job.spec.queue,
                    name = %job.spec.name,
                    attempts = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "job attempt failed"
                );
                job.last_error = Some(err.to_string());
                let due = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let mut state = self.state.lock().await;
                state
                    .queues
                    .entry(job.spec.queue.clone())
                    .or_default()
                    .delayed
                    .push((due, job));
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Long-running worker loop for one consumer. Multiple loops may run
    /// concurrently; they share the queue state.
    pub async fn run_worker_loop(self: Arc<Self>) {
        while !self.shutting_down.load(Ordering::SeqCst) {
            self.run_until_idle().await;
            let wait = {
                let state = self.state.lock().await;
                state
                    .queues
                    .values()
                    .flat_map(|queue| queue.delayed.iter().map(|(due, _)| *due))
                    .min()
                    .and_then(|due| (due - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::from_millis(250))
            };
            let wait = wait.clamp(Duration::from_millis(5), Duration::from_millis(500));
            tokio::select! {
                () = self.work_available.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Runs one schedule now, under its advisory lock. A second replica
    /// invoking the same schedule while it runs observes the held lock
    /// and returns immediately.
    pub async fn run_scheduled_once(&self, name: &str) -> JobResult<ScheduledOutcome> {
        let entry = self
            .schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|(schedule, handler)| (schedule.clone(), Arc::clone(handler)));
        let Some((schedule, handler)) = entry else {
            return Err(JobError::UnknownSchedule(name.to_string()));
        };

        let Some(_guard) = self.advisory.try_acquire(schedule.lock_key.clone()) else {
            debug!(schedule = %schedule.name, "schedule skipped, lock held elsewhere");
            return Ok(ScheduledOutcome::Skipped);
        };
        handler.run().await?;
        Ok(ScheduledOutcome::Ran)
    }

    /// Spawns one ticking task per registered schedule.
    #[must_use]
    pub fn spawn_scheduler(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let schedules: Vec<Schedule> = self
            .schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(schedule, _)| schedule.clone())
            .collect();

        schedules
            .into_iter()
            .map(|schedule| {
                let runtime = Arc::clone(self);
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(schedule.every).await;
                        if runtime.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(err) = runtime.run_scheduled_once(&schedule.name).await {
                            warn!(schedule = %schedule.name, error = %err, "scheduled run failed");
                        }
                    }
                })
            })
            .collect()
    }

    /// Stops accepting work and waits up to `drain` for in-flight
    /// attempts. Anything still queued stays queued for the next start.
    pub async fn shutdown(&self, drain: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.work_available.notify_waiters();
        let deadline = tokio::time::Instant::now() + drain;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::timeout_at(deadline, self.went_idle.notified())
                .await
                .is_err()
            {
                warn!(
                    in_flight = self.in_flight.load(Ordering::SeqCst),
                    "drain deadline reached with jobs still in flight"
                );
                break;
            }
        }
    }

    pub async fn ready_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub async fn delayed_len(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.delayed.len())
    }

    pub async fn completed(&self, queue: &str) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.completed.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use atelier_tenancy::ActiveContext;
    use pretty_assertions::assert_eq;

    struct Flaky {
        failures_before_success: u32,
        attempts: AtomicU32,
        exhausted_count: AtomicU32,
    }

    impl Flaky {
        fn new(failures_before_success: u32) -> Arc<Self> {
            Arc::new(Self {
                failures_before_success,
                attempts: AtomicU32::new(0),
                exhausted_count: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> JobResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures_before_success {
                return Err(JobError::Failed(format!("attempt {attempt}")));
            }
            Ok(())
        }

        async fn exhausted(&self, _job: &Job, _error: &JobError) {
            self.exhausted_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime() -> Arc<JobRuntime> {
        JobRuntime::new(AdvisoryLocks::new(), OpsTelemetry::new())
    }

    #[tokio::test]
    async fn retries_until_success() {
        let runtime = runtime();
        let handler = Flaky::new(2);
        runtime.register("email", handler.clone());
        runtime
            .enqueue(JobSpec::new("email", "send", serde_json::json!({})))
            .await
            .expect("enqueue");

        runtime.run_until_idle().await;
        assert_eq!(runtime.delayed_len("email").await, 1);

        runtime.force_retries().await;
        runtime.run_until_idle().await;
        runtime.force_retries().await;
        runtime.run_until_idle().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted_count.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.delayed_len("email").await, 0);
    }

    #[tokio::test]
    async fn exhaustion_hook_fires_once() {
        let runtime = runtime();
        let handler = Flaky::new(u32::MAX);
        runtime.register("email", handler.clone());
        runtime
            .enqueue(JobSpec::new("email", "send", serde_json::json!({})))
            .await
            .expect("enqueue");

        for _ in 0..3 {
            runtime.run_until_idle().await;
            runtime.force_retries().await;
        }
        runtime.run_until_idle().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(handler.exhausted_count.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.delayed_len("email").await, 0);
    }

    struct ContextProbe {
        seen_tenant: std::sync::Mutex<Option<atelier_tenancy::TenantId>>,
    }

    #[async_trait]
    impl JobHandler for ContextProbe {
        async fn handle(&self, _job: &Job) -> JobResult<()> {
            let context = TenantContext::require().map_err(|err| JobError::Failed(err.to_string()))?;
            *self
                .seen_tenant
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(context.tenant_id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn producing_context_is_reinstalled_per_attempt() {
        let runtime = runtime();
        let probe = Arc::new(ContextProbe {
            seen_tenant: std::sync::Mutex::new(None),
        });
        runtime.register("audit", probe.clone());

        let tenant = Uuid::new_v4();
        TenantContext::scope(ActiveContext::new(tenant), async {
            runtime
                .enqueue(JobSpec::new("audit", "append", serde_json::json!({})))
                .await
                .expect("enqueue");
        })
        .await;

        runtime.run_until_idle().await;
        let seen = *probe
            .seen_tenant
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert_eq!(seen, Some(tenant));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let runtime = runtime();
        runtime.register("email", Flaky::new(0));
        runtime.shutdown(Duration::from_millis(10)).await;

        let err = runtime
            .enqueue(JobSpec::new("email", "send", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));
    }

    struct CountingSchedule {
        runs: AtomicU32,
    }

    #[async_trait]
    impl ScheduledHandler for CountingSchedule {
        async fn run(&self) -> JobResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn schedule_skips_when_lock_is_held() {
        let advisory = AdvisoryLocks::new();
        let runtime = JobRuntime::new(Arc::clone(&advisory), OpsTelemetry::new());
        let handler = Arc::new(CountingSchedule {
            runs: AtomicU32::new(0),
        });
        runtime.register_scheduled(
            Schedule {
                name: "payroll".into(),
                every: Duration::from_secs(3600),
                lock_key: "payroll:all".into(),
            },
            handler.clone(),
        );

        let guard = advisory.try_acquire("payroll:all").expect("hold lock");
        let outcome = runtime
            .run_scheduled_once("payroll")
            .await
            .expect("scheduled run");
        assert_eq!(outcome, ScheduledOutcome::Skipped);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

        drop(guard);
        let outcome = runtime
            .run_scheduled_once("payroll")
            .await
            .expect("scheduled run");
        assert_eq!(outcome, ScheduledOutcome::Ran);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_jobs_can_be_kept() {
        let runtime = runtime();
        runtime.register("email", Flaky::new(0));
        runtime
            .enqueue(JobSpec::new("email", "send", serde_json::json!({"to": "a"})).keep_on_complete())
            .await
            .expect("enqueue");

        runtime.run_until_idle().await;
        let kept = runtime.completed("email").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].attempts, 1);
    }
}
