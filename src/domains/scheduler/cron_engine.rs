use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::{ServiceError, ServiceResult};

use super::types::TriggerDefinition;

/// Accepts Quartz-style (seconds first, optional year, `?` wildcards) and
/// classic five-field expressions.
pub fn normalize_cron_expression(expression: &str) -> String {
    let fields: Vec<String> = expression
        .split_whitespace()
        .map(|field| if field == "?" { "*".to_string() } else { field.to_string() })
        .collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub fn parse_cron_expression(expression: &str) -> ServiceResult<Schedule> {
    Schedule::from_str(&normalize_cron_expression(expression))
        .map_err(|e| ServiceError::invalid_cron(expression, e))
}

/// Next fire instant strictly after `after`, bounded by the trigger window
fn next_fire_time(
    schedule: &Schedule,
    trigger: &TriggerDefinition,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let from = if trigger.start_at > after {
        trigger.start_at - ChronoDuration::milliseconds(1)
    } else {
        after
    };
    let next = schedule.after(&from).next()?;
    match trigger.end_at {
        Some(end) if next > end => None,
        _ => Some(next),
    }
}

/// Callbacks from the engine into whoever registered the trigger
#[async_trait]
pub trait TriggerListener: Send + Sync {
    async fn on_fire(&self, job_name: &str, scheduled_for: DateTime<Utc>);
    /// The trigger has no fire time left inside its window and was removed.
    async fn on_trigger_exhausted(&self, job_name: &str);
}

struct TriggerHandle {
    generation: u64,
    cancel: CancellationToken,
    trigger: TriggerDefinition,
}

/// In-process cron engine: one tokio task per registered trigger.
///
/// Fires are spawned, so a long run never delays the trigger's next tick.
/// Unregistering cancels future fires only; a run already in flight
/// completes.
pub struct CronEngine {
    triggers: Arc<Mutex<HashMap<String, TriggerHandle>>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl CronEngine {
    pub fn new() -> Self {
        Self {
            triggers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn register(
        &self,
        trigger: TriggerDefinition,
        listener: Weak<dyn TriggerListener>,
    ) -> ServiceResult<()> {
        let schedule = parse_cron_expression(&trigger.cron_expression)?;

        let mut triggers = self.triggers.lock().await;
        if triggers.contains_key(&trigger.job_name) {
            return Err(ServiceError::AlreadyScheduled(trigger.job_name.clone()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();

        tokio::spawn(run_trigger(
            schedule,
            trigger.clone(),
            generation,
            cancel.clone(),
            listener,
            Arc::clone(&self.triggers),
        ));

        log::info!(
            "Registered trigger for {} ({}), window {} .. {}",
            trigger.job_name,
            trigger.cron_expression,
            trigger.start_at,
            trigger.end_at.map(|e| e.to_string()).unwrap_or_else(|| "open".to_string())
        );
        triggers.insert(
            trigger.job_name.clone(),
            TriggerHandle {
                generation,
                cancel,
                trigger,
            },
        );
        Ok(())
    }

    /// Returns false when no trigger was registered under `job_name`.
    pub async fn unregister(&self, job_name: &str) -> bool {
        match self.triggers.lock().await.remove(job_name) {
            Some(handle) => {
                handle.cancel.cancel();
                log::info!("Unregistered trigger for {}", job_name);
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, job_name: &str) -> bool {
        self.triggers.lock().await.contains_key(job_name)
    }

    pub async fn registered_trigger(&self, job_name: &str) -> Option<TriggerDefinition> {
        self.triggers
            .lock()
            .await
            .get(job_name)
            .map(|handle| handle.trigger.clone())
    }

    pub async fn registered_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.triggers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let removed = {
            let mut triggers = self.triggers.lock().await;
            let count = triggers.len();
            triggers.clear();
            count
        };
        log::info!("Cron engine stopped, {} triggers cancelled", removed);
    }
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_trigger(
    schedule: Schedule,
    trigger: TriggerDefinition,
    generation: u64,
    cancel: CancellationToken,
    listener: Weak<dyn TriggerListener>,
    triggers: Arc<Mutex<HashMap<String, TriggerHandle>>>,
) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let after = match last_fired {
            Some(fired) => fired.max(Utc::now()),
            None => Utc::now(),
        };
        let Some(next) = next_fire_time(&schedule, &trigger, after) else {
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fired = Some(next);

        let Some(listener) = listener.upgrade() else {
            return;
        };
        let job_name = trigger.job_name.clone();
        log::debug!("Trigger {} fired for {}", job_name, next);
        tokio::spawn(async move {
            listener.on_fire(&job_name, next).await;
        });
    }

    // Exhausted: drop our own entry unless it was replaced meanwhile
    let removed = {
        let mut triggers = triggers.lock().await;
        match triggers.get(&trigger.job_name) {
            Some(handle) if handle.generation == generation => {
                triggers.remove(&trigger.job_name);
                true
            }
            _ => false,
        }
    };

    if removed {
        log::info!("Trigger for {} has no fire time left, removed", trigger.job_name);
        if let Some(listener) = listener.upgrade() {
            listener.on_trigger_exhausted(&trigger.job_name).await;
        }
    }
}
