use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::aggregate::{aggregate, fill_declared, from_totals, retain_recent};
use crate::alerts::{derive_alerts, AlertPolicy};
use crate::config::DomainConfig;
use crate::error::{ConfigError, FetchError};
use crate::fetch::{FetchPayload, Fetcher};
use crate::models::{Aggregate, Snapshot};
use crate::store::{DomainSlot, SnapshotStore};

struct DomainRuntime {
    config: DomainConfig,
    policy: AlertPolicy,
    fetcher: Arc<dyn Fetcher>,
}

impl DomainRuntime {
    fn build_aggregates(&self, payload: FetchPayload, fetched_at: DateTime<Utc>) -> Vec<Aggregate> {
        let thresholds = &self.config.thresholds;
        let mut aggregates = match payload {
            FetchPayload::Records(records) => {
                let since = self
                    .config
                    .window
                    .and_then(|window| chrono::Duration::from_std(window).ok())
                    .and_then(|window| fetched_at.checked_sub_signed(window));
                let records = match since {
                    Some(since) => retain_recent(records, since),
                    None => records,
                };
                aggregate(&records, |r| self.config.group_by.key(r), thresholds)
            }
            FetchPayload::Totals(totals) => from_totals(&totals, thresholds),
        };
        fill_declared(&mut aggregates, &self.config.declared_groups, thresholds);
        aggregates
    }
}

/// Runs one fetch → aggregate → classify → publish loop per domain and owns
/// the snapshot store those loops write to.
pub struct RefreshScheduler {
    store: SnapshotStore,
    runtimes: HashMap<String, Arc<DomainRuntime>>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Validates every domain up front; nothing is spawned until
    /// [`RefreshScheduler::start`].
    pub fn new(domains: Vec<(DomainConfig, Arc<dyn Fetcher>)>) -> Result<Self, ConfigError> {
        let mut runtimes = HashMap::new();
        for (config, fetcher) in domains {
            config.validate()?;
            let policy = config.alert_policy()?;
            let name = config.name.clone();
            if runtimes.contains_key(&name) {
                return Err(ConfigError::DuplicateDomain(name));
            }
            runtimes.insert(
                name,
                Arc::new(DomainRuntime {
                    config,
                    policy,
                    fetcher,
                }),
            );
        }

        let store = SnapshotStore::new(runtimes.keys().map(String::as_str));
        Ok(Self {
            store,
            runtimes,
            loops: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> SnapshotStore {
        self.store.clone()
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.runtimes.keys().map(String::as_str)
    }

    pub fn snapshot(&self, domain: &str) -> Option<Arc<Snapshot>> {
        self.store.snapshot(domain)
    }

    pub fn subscribe(&self, domain: &str) -> Option<watch::Receiver<Arc<Snapshot>>> {
        self.store.subscribe(domain)
    }

    /// Calls `callback` with every snapshot published for `domain` from now
    /// on. Abort the returned handle to unsubscribe.
    pub fn on_snapshot_change<F>(&self, domain: &str, mut callback: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(Arc<Snapshot>) + Send + 'static,
    {
        let mut rx = self.store.subscribe(domain)?;
        Some(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(snapshot);
            }
        }))
    }

    /// Starts every domain that is not already running. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        for name in self.runtimes.keys() {
            self.start_domain(name);
        }
    }

    /// Returns `false` for unknown, stopped or already running domains.
    pub fn start_domain(&self, domain: &str) -> bool {
        let (Some(runtime), Some(slot)) = (self.runtimes.get(domain), self.store.slot(domain))
        else {
            return false;
        };
        if slot.is_closed() {
            return false;
        }

        let mut loops = self.loops();
        if loops.get(domain).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        loops.insert(
            domain.to_string(),
            tokio::spawn(run_domain(Arc::clone(runtime), slot)),
        );
        true
    }

    /// Fetches immediately, outside the regular period. A fetch still in
    /// flight for the same domain is not cancelled; whichever was requested
    /// last wins once both complete.
    pub fn refresh_now(&self, domain: &str) -> bool {
        let (Some(runtime), Some(slot)) = (self.runtimes.get(domain), self.store.slot(domain))
        else {
            return false;
        };
        if slot.is_closed() {
            return false;
        }
        tokio::spawn(refresh(Arc::clone(runtime), slot));
        true
    }

    /// Idempotent. After this returns no fetch, including one already in
    /// flight, writes the domain's snapshot again.
    pub fn stop(&self, domain: &str) -> bool {
        let Some(slot) = self.store.slot(domain) else {
            return false;
        };
        slot.close();
        let running = self.loops().remove(domain);
        if let Some(handle) = &running {
            handle.abort();
        }
        if running.is_some() {
            tracing::info!(domain, "refresh loop stopped");
        }
        true
    }

    pub fn stop_all(&self) {
        for name in self.runtimes.keys() {
            self.stop(name);
        }
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn run_domain(runtime: Arc<DomainRuntime>, slot: Arc<DomainSlot>) {
    let name = runtime.config.name.clone();
    let Some(period) = runtime.config.period else {
        tracing::info!(domain = %name, "fetching once");
        if let Err(err) = tokio::spawn(refresh(runtime, slot)).await {
            tracing::error!(domain = %name, error = %err, "refresh task failed");
        }
        return;
    };

    tracing::info!(
        domain = %name,
        period_ms = period.as_millis() as u64,
        timeout_ms = runtime.config.fetch_timeout.as_millis() as u64,
        "refresh loop started"
    );

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if slot.is_closed() {
            break;
        }
        // Each fetch runs on its own task so a slow response never holds up
        // the next tick; the sequence gate sorts out overlaps.
        tokio::spawn(refresh(Arc::clone(&runtime), Arc::clone(&slot)));
    }
}

async fn refresh(runtime: Arc<DomainRuntime>, slot: Arc<DomainSlot>) {
    let config = &runtime.config;
    let seq = slot.issue();
    tracing::debug!(domain = %config.name, seq, "fetch started");

    // A panic in the collaborator or while aggregating surfaces as a JoinError
    // and takes the failure path below.
    let worker = Arc::clone(&runtime);
    let mut attempt = tokio::spawn(async move {
        let payload = worker.fetcher.fetch().await?;
        let fetched_at = Utc::now();
        Ok::<_, FetchError>((worker.build_aggregates(payload, fetched_at), fetched_at))
    });
    let outcome = match timeout(config.fetch_timeout, &mut attempt).await {
        Ok(joined) => joined.map_err(FetchError::from).and_then(|result| result),
        Err(_) => {
            attempt.abort();
            Err(FetchError::Timeout(config.fetch_timeout))
        }
    };

    let applied = match outcome {
        Ok((aggregates, fetched_at)) => {
            slot.apply(seq, |current| {
                let alerts = derive_alerts(
                    &config.name,
                    &aggregates,
                    current.last_good(),
                    &runtime.policy,
                    fetched_at,
                );
                if !alerts.is_empty() {
                    tracing::info!(domain = %config.name, seq, count = alerts.len(), "new alerts");
                }
                Snapshot {
                    domain: config.name.clone(),
                    seq,
                    aggregates,
                    alerts,
                    fetched_at: Some(fetched_at),
                    stale: false,
                    last_error: None,
                }
            })
        }
        Err(err) => {
            if err.is_malformed() {
                tracing::error!(
                    domain = %config.name,
                    seq,
                    kind = err.kind(),
                    error = %err,
                    "malformed response, keeping last good snapshot"
                );
            } else {
                tracing::warn!(
                    domain = %config.name,
                    seq,
                    kind = err.kind(),
                    error = %err,
                    "fetch failed, keeping last good snapshot"
                );
            }
            let message = err.to_string();
            slot.apply(seq, |current| Snapshot {
                seq,
                stale: true,
                last_error: Some(message),
                ..current.clone()
            })
        }
    };

    if applied {
        tracing::debug!(domain = %config.name, seq, "snapshot published");
    } else {
        tracing::debug!(domain = %config.name, seq, "discarded superseded result");
    }
}
