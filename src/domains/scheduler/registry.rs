use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domains::export::service::{ExportRunner, JobStatusWriter};
use crate::domains::history::repository::RunHistoryStore;
use crate::domains::history::types::RunOutcome;
use crate::errors::{DomainError, ServiceError, ServiceResult};

use super::cron_engine::{CronEngine, TriggerListener};
use super::lock::{job_lock_key, LeasedLock};
use super::repository::JobDefinitionRepository;
use super::types::{JobDefinition, JobStatus, NewJobDefinition, UpdateJobDefinition};

/// Reason stored on runs that a previous process left unfinalized
pub const INTERRUPTED_RUN_REASON: &str = "interrupted";

/// Owns job definitions and their live triggers.
///
/// Registration (`schedule`) is serialized by a process-local lock that is
/// only ever tried, never awaited: a concurrent caller gets
/// [`ServiceError::RegistrationInProgress`] straight away. Firings are
/// guarded separately by a per-job lease so that instances sharing the
/// database do not run the same job twice.
pub struct JobRegistry {
    self_ref: Weak<JobRegistry>,
    jobs: Arc<dyn JobDefinitionRepository>,
    runner: Arc<dyn ExportRunner>,
    run_store: Arc<dyn RunHistoryStore>,
    lease: LeasedLock,
    engine: CronEngine,
    registration_lock: Mutex<()>,
    /// Held while a trigger change and its stored status are written
    status_lock: Mutex<()>,
}

impl JobRegistry {
    pub fn new(
        jobs: Arc<dyn JobDefinitionRepository>,
        runner: Arc<dyn ExportRunner>,
        run_store: Arc<dyn RunHistoryStore>,
        lease: LeasedLock,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            jobs,
            runner,
            run_store,
            lease,
            engine: CronEngine::new(),
            registration_lock: Mutex::new(()),
            status_lock: Mutex::new(()),
        })
    }

    fn listener(&self) -> Weak<dyn TriggerListener> {
        self.self_ref.clone()
    }

    pub async fn create_job(&self, new_job: &NewJobDefinition) -> ServiceResult<JobDefinition> {
        let job = self.jobs.create(new_job).await?;
        log::info!("Created job {} ({})", job.name, job.id);
        Ok(job)
    }

    /// Metadata only; a live trigger keeps its old timing until stop + schedule.
    pub async fn update_job(&self, id: Uuid, update: &UpdateJobDefinition) -> ServiceResult<JobDefinition> {
        Ok(self.jobs.update(id, update).await?)
    }

    pub async fn delete_job(&self, id: Uuid) -> ServiceResult<()> {
        let job = self.jobs.find_by_id(id).await?;
        if self.engine.is_registered(&job.name).await {
            return Err(ServiceError::JobStillScheduled(job.name));
        }
        self.jobs.delete(id).await?;
        log::info!("Deleted job {} ({})", job.name, id);
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> ServiceResult<JobDefinition> {
        Ok(self.jobs.find_by_id(id).await?)
    }

    pub async fn list_jobs(&self) -> ServiceResult<Vec<JobDefinition>> {
        Ok(self.jobs.find_all().await?)
    }

    pub async fn schedule(&self, job: &JobDefinition) -> ServiceResult<()> {
        let _registration = self
            .registration_lock
            .try_lock()
            .map_err(|_| ServiceError::RegistrationInProgress)?;

        self.register_trigger(job).await
    }

    async fn register_trigger(&self, job: &JobDefinition) -> ServiceResult<()> {
        // Trigger and stored status change together with respect to `stop`
        let _status = self.status_lock.lock().await;
        self.engine.register(job.trigger(), self.listener()).await?;

        match self.jobs.set_status(job.id, JobStatus::Active).await {
            Ok(true) => {
                log::info!("Scheduled job {} with '{}'", job.name, job.cron_expression);
                Ok(())
            }
            Ok(false) => {
                self.engine.unregister(&job.name).await;
                Err(ServiceError::JobNotFound(job.name.clone()))
            }
            Err(e) => {
                self.engine.unregister(&job.name).await;
                Err(e.into())
            }
        }
    }

    /// Prevents future firings; a run already in progress completes.
    pub async fn stop(&self, job_name: &str) -> ServiceResult<()> {
        let _status = self.status_lock.lock().await;
        if !self.engine.unregister(job_name).await {
            return Err(ServiceError::JobNotFound(job_name.to_string()));
        }

        match self.jobs.find_by_name(job_name).await? {
            Some(job) => {
                self.jobs.set_status(job.id, JobStatus::Stopped).await?;
            }
            None => log::warn!("Stopped trigger {} has no stored definition", job_name),
        }
        log::info!("Stopped job {}", job_name);
        Ok(())
    }

    /// Forces a stored status without touching the trigger.
    pub async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> ServiceResult<()> {
        if !self.jobs.set_status(job_id, status).await? {
            return Err(DomainError::EntityNotFound("JobDefinition".to_string(), job_id).into());
        }
        log::info!("Job {} status forced to {}", job_id, status.as_str());
        Ok(())
    }

    pub async fn is_scheduled(&self, job_name: &str) -> bool {
        self.engine.is_registered(job_name).await
    }

    pub async fn scheduled_jobs(&self) -> Vec<String> {
        self.engine.registered_jobs().await
    }

    /// Start-up recovery: fails runs a crashed process left open, then
    /// re-registers every stored Active job. Returns how many were restored.
    ///
    /// An open run whose job lease is still held is left alone, as is any
    /// run started after the sweep began.
    pub async fn restore_active_jobs(&self) -> ServiceResult<usize> {
        // Runs whose job lease is held belong to a live instance
        let sweep_from = Utc::now();
        let mut live_jobs = Vec::new();
        for job in self.jobs.find_all().await? {
            if self.lease.is_locked(&job_lock_key(&job.name)).await? {
                live_jobs.push(job.name);
            }
        }
        let stale = self
            .run_store
            .mark_stale_runs_failed(INTERRUPTED_RUN_REASON, sweep_from, &live_jobs)
            .await?;
        if stale > 0 {
            log::warn!("Marked {} interrupted runs as failed", stale);
        }

        let _registration = self.registration_lock.lock().await;
        let mut restored = 0;
        for job in self.jobs.find_by_status(JobStatus::Active).await? {
            match self.register_trigger(&job).await {
                Ok(()) => restored += 1,
                Err(ServiceError::AlreadyScheduled(_)) => restored += 1,
                Err(e) => {
                    log::error!("Cannot restore trigger for {}: {}", job.name, e);
                    if let Err(e) = self.jobs.set_status(job.id, JobStatus::Stopped).await {
                        log::error!("Cannot mark {} stopped: {}", job.name, e);
                    }
                }
            }
        }
        log::info!("Restored {} active jobs", restored);
        Ok(restored)
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

#[async_trait]
impl TriggerListener for JobRegistry {
    async fn on_fire(&self, job_name: &str, scheduled_for: DateTime<Utc>) {
        let job = match self.jobs.find_by_name(job_name).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                log::warn!("Trigger {} fired but the job no longer exists", job_name);
                return;
            }
            Err(e) => {
                log::error!("Cannot load job {} for firing: {}", job_name, e);
                return;
            }
        };

        let key = job_lock_key(job_name);
        let lease = match self.lease.try_acquire(&key).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                log::info!("Skipping {} firing at {}: lease held elsewhere", job_name, scheduled_for);
                return;
            }
            Err(e) => {
                log::error!("Skipping {} firing at {}: {}", job_name, scheduled_for, e);
                return;
            }
        };

        let run = self.runner.execute(&job, self);
        tokio::pin!(run);
        let mut renewal = tokio::time::interval(self.lease.renew_interval());
        renewal.tick().await;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = renewal.tick() => {
                    if let Err(e) = self.lease.renew(&lease).await {
                        log::warn!("Cannot renew lease for {}: {}", job_name, e);
                    }
                }
            }
        };

        match result {
            Ok(summary) => log::debug!("Run {} of {} returned {:?}", summary.run_id, job_name, summary.outcome),
            Err(e) => log::error!("Run of {} could not be recorded: {}", job_name, e),
        }

        if let Err(e) = self.lease.finish(lease).await {
            log::warn!("Lease for {} not returned cleanly: {}", job_name, e);
        }
    }

    async fn on_trigger_exhausted(&self, job_name: &str) {
        let _status = self.status_lock.lock().await;
        // A schedule that re-registered the name since keeps it Active
        if self.engine.is_registered(job_name).await {
            return;
        }
        match self.jobs.find_by_name(job_name).await {
            Ok(Some(job)) => {
                if let Err(e) = self.jobs.set_status(job.id, JobStatus::Stopped).await {
                    log::error!("Cannot mark exhausted job {} stopped: {}", job_name, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("Cannot load exhausted job {}: {}", job_name, e),
        }
    }
}

#[async_trait]
impl JobStatusWriter for JobRegistry {
    async fn record_run_completion(
        &self,
        job: &JobDefinition,
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        // A stop during the run wins over the run's write-back
        let _status = self.status_lock.lock().await;
        let still_scheduled = self.engine.is_registered(&job.name).await;
        self.jobs
            .record_run_outcome(job.id, outcome, finished_at, still_scheduled)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::export::types::{ExportRunSummary, RunCounters};
    use crate::domains::history::repository::SqliteRunHistoryStore;
    use crate::domains::history::types::NewRun;
    use crate::domains::scheduler::lock::{DistributedLock, InMemoryDistributedLock, LeasePolicy, SqliteDistributedLock};
    use crate::errors::DomainResult;
    use crate::domains::scheduler::repository::SqliteJobDefinitionRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ExportRunner for CountingRunner {
        async fn execute(&self, job: &JobDefinition, status: &dyn JobStatusWriter) -> ServiceResult<ExportRunSummary> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            status.record_run_completion(job, RunOutcome::Success, Utc::now()).await?;
            Ok(ExportRunSummary {
                run_id: Uuid::new_v4(),
                job_name: job.name.clone(),
                counters: RunCounters::default(),
                outcome: RunOutcome::Success,
                error_text: None,
                duration_seconds: 0,
                files: vec![],
            })
        }
    }

    struct Fixture {
        registry: Arc<JobRegistry>,
        runner: Arc<CountingRunner>,
        lock: Arc<InMemoryDistributedLock>,
        pool: sqlx::SqlitePool,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let runner = Arc::new(CountingRunner::default());
        let lock = Arc::new(InMemoryDistributedLock::new());
        let registry = JobRegistry::new(
            Arc::new(SqliteJobDefinitionRepository::new(pool.clone())),
            runner.clone(),
            Arc::new(SqliteRunHistoryStore::new(pool.clone())),
            LeasedLock::new(lock.clone(), LeasePolicy::new(Duration::ZERO, Duration::from_secs(5))),
        );
        Fixture { registry, runner, lock, pool }
    }

    /// Runner that takes a while, recording when it is inside a run
    struct SlowRunner {
        delay: Duration,
        inner: CountingRunner,
    }

    #[async_trait]
    impl ExportRunner for SlowRunner {
        async fn execute(&self, job: &JobDefinition, status: &dyn JobStatusWriter) -> ServiceResult<ExportRunSummary> {
            tokio::time::sleep(self.delay).await;
            self.inner.execute(job, status).await
        }
    }

    /// Job store whose Active status writes land late
    struct SlowActivation {
        inner: SqliteJobDefinitionRepository,
        delay: Duration,
    }

    #[async_trait]
    impl JobDefinitionRepository for SlowActivation {
        async fn create(&self, new_job: &NewJobDefinition) -> DomainResult<JobDefinition> {
            self.inner.create(new_job).await
        }
        async fn update(&self, id: Uuid, update: &UpdateJobDefinition) -> DomainResult<JobDefinition> {
            self.inner.update(id, update).await
        }
        async fn delete(&self, id: Uuid) -> DomainResult<()> {
            self.inner.delete(id).await
        }
        async fn find_by_id(&self, id: Uuid) -> DomainResult<JobDefinition> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_name(&self, name: &str) -> DomainResult<Option<JobDefinition>> {
            self.inner.find_by_name(name).await
        }
        async fn find_all(&self) -> DomainResult<Vec<JobDefinition>> {
            self.inner.find_all().await
        }
        async fn find_by_status(&self, status: JobStatus) -> DomainResult<Vec<JobDefinition>> {
            self.inner.find_by_status(status).await
        }
        async fn set_status(&self, id: Uuid, status: JobStatus) -> DomainResult<bool> {
            if status == JobStatus::Active {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.set_status(id, status).await
        }
        async fn record_run_outcome(
            &self,
            id: Uuid,
            outcome: RunOutcome,
            finished_at: DateTime<Utc>,
            reassert_active: bool,
        ) -> DomainResult<()> {
            self.inner.record_run_outcome(id, outcome, finished_at, reassert_active).await
        }
    }

    fn sqlite_registry(pool: &sqlx::SqlitePool, owner: &str) -> Arc<JobRegistry> {
        JobRegistry::new(
            Arc::new(SqliteJobDefinitionRepository::new(pool.clone())),
            Arc::new(CountingRunner::default()),
            Arc::new(SqliteRunHistoryStore::new(pool.clone())),
            LeasedLock::new(
                Arc::new(SqliteDistributedLock::new(pool.clone()).with_owner(owner)),
                LeasePolicy::default(),
            ),
        )
    }

    async fn create(registry: &JobRegistry, name: &str, cron: &str) -> JobDefinition {
        registry
            .create_job(&NewJobDefinition::new(name, cron, "Scheduler1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_schedule_twice_fails_second_call() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;

        f.registry.schedule(&job).await.unwrap();
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Active);
        assert!(matches!(
            f.registry.schedule(&job).await,
            Err(ServiceError::AlreadyScheduled(_))
        ));
        assert_eq!(f.registry.scheduled_jobs().await, vec!["NIGHTLY".to_string()]);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_fails_fast_while_registration_runs() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;

        let held = f.registry.registration_lock.try_lock().unwrap();
        let err = f.registry.schedule(&job).await.unwrap_err();
        assert!(matches!(err, ServiceError::RegistrationInProgress));
        assert!(err.is_retryable());
        assert!(!f.registry.is_scheduled("NIGHTLY").await);

        drop(held);
        f.registry.schedule(&job).await.unwrap();
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected_and_lock_released() {
        let f = fixture().await;
        let mut job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;
        job.cron_expression = "every night".into();

        assert!(matches!(
            f.registry.schedule(&job).await,
            Err(ServiceError::InvalidCronExpression { .. })
        ));
        assert!(f.registry.registration_lock.try_lock().is_ok());
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_unknown_job_has_no_side_effects() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;

        assert!(matches!(
            f.registry.stop("NOPE").await,
            Err(ServiceError::JobNotFound(name)) if name == "NOPE"
        ));
        assert!(matches!(f.registry.stop("NIGHTLY").await, Err(ServiceError::JobNotFound(_))));
        assert_eq!(f.registry.get_job(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_stop_removes_future_firings() {
        let f = fixture().await;
        let job = create(&f.registry, "TICK", "* * * * * *").await;
        f.registry.schedule(&job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(f.runner.runs.load(Ordering::SeqCst) >= 1);

        f.registry.stop("TICK").await.unwrap();
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_stop = f.runner.runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.runner.runs.load(Ordering::SeqCst), after_stop);

        // re-schedule brings firings back
        let job = f.registry.get_job(job.id).await.unwrap();
        f.registry.schedule(&job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(f.runner.runs.load(Ordering::SeqCst) > after_stop);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_firing_skipped_while_lease_held() {
        let f = fixture().await;
        let job = create(&f.registry, "TICK", "* * * * * *").await;
        let foreign = f
            .lock
            .acquire(&job_lock_key("TICK"), Duration::from_secs(30))
            .await
            .unwrap();

        f.registry.schedule(&job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(f.runner.runs.load(Ordering::SeqCst), 0);

        f.lock.release(foreign).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(f.runner.runs.load(Ordering::SeqCst) >= 1);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_completion_keeps_status_and_outcome_apart() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;
        f.registry.schedule(&job).await.unwrap();

        f.registry
            .record_run_completion(&job, RunOutcome::Failure, Utc::now())
            .await
            .unwrap();
        let stored = f.registry.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.last_run_outcome, Some(RunOutcome::Failure));

        // a stop that lands during a run is not undone by its write-back
        f.registry.stop("NIGHTLY").await.unwrap();
        f.registry
            .record_run_completion(&job, RunOutcome::Success, Utc::now())
            .await
            .unwrap();
        let stored = f.registry.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Stopped);
        assert_eq!(stored.last_run_outcome, Some(RunOutcome::Success));
    }

    #[tokio::test]
    async fn test_delete_refused_while_scheduled() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;
        f.registry.schedule(&job).await.unwrap();

        assert!(matches!(
            f.registry.delete_job(job.id).await,
            Err(ServiceError::JobStillScheduled(_))
        ));
        f.registry.stop("NIGHTLY").await.unwrap();
        f.registry.delete_job(job.id).await.unwrap();
        assert!(f.registry.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_job_status() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;

        f.registry.update_job_status(job.id, JobStatus::Active).await.unwrap();
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Active);
        assert!(!f.registry.is_scheduled("NIGHTLY").await);

        assert!(matches!(
            f.registry.update_job_status(Uuid::new_v4(), JobStatus::Stopped).await,
            Err(ServiceError::Domain(DomainError::EntityNotFound(_, _)))
        ));
    }

    #[tokio::test]
    async fn test_update_job_leaves_trigger_alone() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;
        f.registry.schedule(&job).await.unwrap();

        let update = UpdateJobDefinition {
            cron_expression: Some("0 0 4 * * ?".into()),
            ..Default::default()
        };
        let updated = f.registry.update_job(job.id, &update).await.unwrap();
        assert_eq!(updated.cron_expression, "0 0 4 * * ?");
        let live = f.registry.engine.registered_trigger("NIGHTLY").await.unwrap();
        assert_eq!(live.cron_expression, "0 0 2 * * ?");
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_active_jobs() {
        let f = fixture().await;
        let good = create(&f.registry, "GOOD", "0 0 2 * * ?").await;
        let broken = create(&f.registry, "BROKEN", "0 0 2 * * ?").await;
        let idle = create(&f.registry, "IDLE", "0 0 2 * * ?").await;
        f.registry.update_job_status(good.id, JobStatus::Active).await.unwrap();
        f.registry.update_job_status(broken.id, JobStatus::Active).await.unwrap();
        sqlx::query("UPDATE export_jobs SET cron_expression = 'garbage' WHERE id = ?")
            .bind(broken.id.to_string())
            .execute(&f.pool)
            .await
            .unwrap();

        let runs = SqliteRunHistoryStore::new(f.pool.clone());
        let open = runs
            .start_run(&NewRun { job_id: good.id, job_name: "GOOD".into(), started_at: Utc::now() })
            .await
            .unwrap();

        assert_eq!(f.registry.restore_active_jobs().await.unwrap(), 1);
        assert_eq!(f.registry.scheduled_jobs().await, vec!["GOOD".to_string()]);
        assert_eq!(f.registry.get_job(broken.id).await.unwrap().status, JobStatus::Stopped);
        assert_eq!(f.registry.get_job(idle.id).await.unwrap().status, JobStatus::Stopped);

        let interrupted = runs.find_by_id(open.id).await.unwrap();
        assert_eq!(interrupted.outcome, Some(RunOutcome::Failure));
        assert_eq!(interrupted.error_text.as_deref(), Some(INTERRUPTED_RUN_REASON));
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_during_schedule_leaves_job_stopped_without_trigger() {
        let pool = test_pool().await;
        let registry = JobRegistry::new(
            Arc::new(SlowActivation {
                inner: SqliteJobDefinitionRepository::new(pool.clone()),
                delay: Duration::from_millis(300),
            }),
            Arc::new(CountingRunner::default()),
            Arc::new(SqliteRunHistoryStore::new(pool.clone())),
            LeasedLock::new(Arc::new(InMemoryDistributedLock::new()), LeasePolicy::default()),
        );
        let job = create(&registry, "NIGHTLY", "0 0 2 * * ?").await;

        let scheduling = {
            let registry = registry.clone();
            let job = job.clone();
            tokio::spawn(async move { registry.schedule(&job).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped = registry.stop("NIGHTLY").await;
        scheduling.await.unwrap().unwrap();

        // stop waits for the registration to settle, then wins
        assert!(stopped.is_ok());
        assert_eq!(registry.get_job(job.id).await.unwrap().status, JobStatus::Stopped);
        assert!(!registry.is_scheduled("NIGHTLY").await);
    }

    #[tokio::test]
    async fn test_exhaustion_does_not_stop_a_re_registered_job() {
        let f = fixture().await;
        let job = create(&f.registry, "NIGHTLY", "0 0 2 * * ?").await;
        f.registry.schedule(&job).await.unwrap();

        // a stale exhaustion notice arrives after the name was scheduled again
        f.registry.on_trigger_exhausted("NIGHTLY").await;
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Active);
        assert!(f.registry.is_scheduled("NIGHTLY").await);

        f.registry.engine.unregister("NIGHTLY").await;
        f.registry.on_trigger_exhausted("NIGHTLY").await;
        assert_eq!(f.registry.get_job(job.id).await.unwrap().status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_long_run_keeps_its_lease() {
        let pool = test_pool().await;
        let lock = Arc::new(InMemoryDistributedLock::new());
        let policy = LeasePolicy::new(Duration::ZERO, Duration::from_millis(300));
        let runner = Arc::new(SlowRunner {
            delay: Duration::from_millis(900),
            inner: CountingRunner::default(),
        });
        let registry = JobRegistry::new(
            Arc::new(SqliteJobDefinitionRepository::new(pool.clone())),
            runner.clone(),
            Arc::new(SqliteRunHistoryStore::new(pool.clone())),
            LeasedLock::new(lock.clone(), policy),
        );
        create(&registry, "SLOW", "0 0 2 * * ?").await;

        let firing = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.on_fire("SLOW", Utc::now()).await })
        };

        // well past at_most, another instance still cannot take the job
        let other = LeasedLock::new(lock.clone(), policy);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(other.try_acquire(&job_lock_key("SLOW")).await.unwrap().is_none());

        firing.await.unwrap();
        assert_eq!(runner.inner.runs.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked(&job_lock_key("SLOW")).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_spares_runs_of_another_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("shared.sqlite").display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        crate::db_migration::initialize_database(&pool).await.unwrap();

        let first = sqlite_registry(&pool, "instance-a");
        let busy = create(&first, "NIGHTLY", "0 0 2 * * ?").await;
        let crashed = create(&first, "HOURLY", "0 0 * * * ?").await;

        // instance a is mid-run on NIGHTLY; HOURLY's run lost its process
        let lease = SqliteDistributedLock::new(pool.clone())
            .with_owner("instance-a")
            .acquire(&job_lock_key("NIGHTLY"), Duration::from_secs(120))
            .await
            .unwrap();
        let runs = SqliteRunHistoryStore::new(pool.clone());
        let live = runs
            .start_run(&NewRun { job_id: busy.id, job_name: "NIGHTLY".into(), started_at: Utc::now() })
            .await
            .unwrap();
        let orphan = runs
            .start_run(&NewRun { job_id: crashed.id, job_name: "HOURLY".into(), started_at: Utc::now() })
            .await
            .unwrap();

        let second = sqlite_registry(&pool, "instance-b");
        second.restore_active_jobs().await.unwrap();

        let swept = runs.find_by_id(orphan.id).await.unwrap();
        assert_eq!(swept.error_text.as_deref(), Some(INTERRUPTED_RUN_REASON));

        let ended_at = Utc::now();
        let finished = runs
            .finalize_run(
                live.id,
                &crate::domains::history::types::RunCompletion {
                    ended_at,
                    tables_attempted: 2,
                    files_succeeded: 2,
                    files_failed: 0,
                    outcome: RunOutcome::Success,
                    error_text: None,
                    duration_seconds: (ended_at - live.started_at).num_seconds(),
                },
            )
            .await
            .unwrap();
        assert_eq!(finished.outcome, Some(RunOutcome::Success));
        drop(lease);
    }
}
