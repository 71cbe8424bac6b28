use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, Timings};
use crate::decoder::{self, LogRecord, Metrics, RelayState, METRIC_KEYS};
use crate::device_client::DeviceClient;
use crate::error::{Error, Result};
use crate::events::{Clock, Command, Event, SystemClock};
use crate::request_queue::RequestQueue;
use crate::session::{DeviceInfo, SessionManager};
use crate::state_store::{Snapshot, StateStore};

/// Session-authenticated poller for one Overvis meter.
///
/// Cheap to clone; all clones drive the same device. Every device call goes
/// through one [`RequestQueue`], so a re-login never interleaves with a call
/// that would carry the old token.
#[derive(Clone)]
pub struct Overvis {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    clock: Arc<dyn Clock>,
    queue: RequestQueue,
    session: Arc<SessionManager>,
    state: StateStore,
    status: StateStore,
    events: broadcast::Sender<Event>,
    authenticated: watch::Sender<bool>,
    recovery: Notify,
    running: AtomicBool,
    online: Mutex<Option<bool>>,
    cursor: Mutex<Option<i64>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Overvis {
    /// Builds an idle engine. Nothing talks to the device until [`start`](Self::start).
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let (events, _) = broadcast::channel(64);
        let (authenticated, _) = watch::channel(false);
        let client = DeviceClient::new(&config.host, config.timings.request_timeout)?;
        let session = SessionManager::new(client, &config.password);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                queue: RequestQueue::new(),
                session: Arc::new(session),
                state: StateStore::new("state"),
                status: StateStore::new("status"),
                events,
                authenticated,
                recovery: Notify::new(),
                running: AtomicBool::new(false),
                online: Mutex::new(None),
                cursor: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        self.inner.session.info()
    }

    pub fn state(&self) -> Snapshot {
        self.inner.state.get()
    }

    pub fn status(&self) -> Snapshot {
        self.inner.status.get()
    }

    /// Timestamp (seconds) of the newest log record emitted so far.
    pub fn cursor(&self) -> Option<i64> {
        *lock(&self.inner.cursor)
    }

    fn timings(&self) -> &Timings {
        &self.inner.config.timings
    }

    /// Logs in, then runs the refresh, report, re-login and idle cycles until
    /// [`stop`](Self::stop). Failed logins are retried indefinitely.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting Overvis poller for {}", self.inner.config.host);

        let mut tasks = vec![
            self.spawn_store_forwarder(&self.inner.state, Event::State),
            self.spawn_store_forwarder(&self.inner.status, Event::Status),
        ];

        let engine = self.clone();
        tasks.push(tokio::spawn(async move { engine.recovery_loop().await }));

        let engine = self.clone();
        tasks.push(tokio::spawn(async move { engine.run().await }));

        lock(&self.inner.tasks).extend(tasks);
    }

    /// Cancels every cycle. Calls already queued still complete.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        info!("Stopped Overvis poller");
    }

    async fn run(&self) {
        let mut authenticated = self.inner.authenticated.subscribe();
        let _ = self.login().await;

        // Failed attempts are retried by the recovery loop
        let ready = authenticated.wait_for(|ok| *ok).await.is_ok();
        if !ready {
            return;
        }

        tokio::join!(
            self.refresh_loop(),
            self.report_loop(),
            self.relogin_loop(),
            self.idle_loop(),
        );
    }

    fn spawn_store_forwarder(
        &self,
        store: &StateStore,
        wrap: fn(Snapshot) -> Event,
    ) -> JoinHandle<()> {
        let mut changes = store.subscribe();
        let name = store.name();
        let engine = self.clone();

        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(snapshot) => engine.emit(wrap(snapshot)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {skipped} {name} changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn recovery_loop(&self) {
        loop {
            self.inner.recovery.notified().await;
            sleep(self.timings().retry_delay).await;
            let _ = self.login().await;
        }
    }

    async fn refresh_loop(&self) {
        let mut ticker = interval(self.inner.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                self.handle_error(e);
            }
        }
    }

    async fn report_loop(&self) {
        loop {
            if let Err(e) = self.report().await {
                self.handle_error(e);
            }

            let now = self.inner.clock.now_millis();
            let delay = next_report_delay(self.cursor(), now, self.timings());
            debug!("Next log read in {delay:?}");
            sleep(delay).await;
        }
    }

    async fn relogin_loop(&self) {
        let period = self.timings().relogin_interval;
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            debug!("Scheduled re-login");
            let _ = self.login().await;
        }
    }

    async fn idle_loop(&self) {
        let idle = self.timings().idle_timeout;
        let mut next_check = Instant::now() + idle;

        loop {
            sleep_until(next_check).await;

            match self.inner.session.idle_deadline(idle) {
                Some(deadline) if deadline > Instant::now() => next_check = deadline,
                _ => {
                    info!("No request for {idle:?}, re-authenticating");
                    let _ = self.login().await;
                    next_check = Instant::now() + idle;
                }
            }
        }
    }

    /// Reports a failure and schedules a re-login after the retry delay.
    /// Failures arriving before that login runs share it.
    fn handle_error(&self, error: Error) {
        if error.is_transport() {
            warn!("Device unreachable: {error}");
        } else {
            warn!("Overvis error: {error}");
        }
        self.emit(Event::Error(Arc::new(error)));
        self.inner.recovery.notify_one();
    }

    fn emit(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }

    fn set_online(&self, online: bool) {
        let changed = lock(&self.inner.online).replace(online) != Some(online);
        if !changed {
            return;
        }

        let info = if online { self.info() } else { None };
        if online {
            info!("Connected to {}", self.inner.config.host);
        } else {
            warn!("Disconnected from {}", self.inner.config.host);
        }
        self.emit(Event::Connection { online, info });
    }

    /// Runs a bare API path through the queue with the current session.
    async fn call(&self, path: impl Into<String>) -> Result<Map<String, Value>> {
        let session = self.inner.session.clone();
        let path = path.into();
        self.inner
            .queue
            .enqueue(async move { session.request(&path).await })
            .await
    }

    /// Full login handshake as one queued task. Failures go to recovery.
    pub async fn login(&self) -> bool {
        let session = self.inner.session.clone();
        match self
            .inner
            .queue
            .enqueue(async move { session.login().await })
            .await
        {
            Ok(_) => {
                self.set_online(true);
                self.inner.authenticated.send_replace(true);
                true
            }
            Err(e) => {
                self.set_online(false);
                self.handle_error(e);
                false
            }
        }
    }

    /// Reads current metrics and merges them into the stores.
    pub async fn refresh(&self) -> Result<()> {
        let fields = self
            .call(format!("/all/get?{}", METRIC_KEYS.join("&")))
            .await?;
        let metrics: Metrics = serde_json::from_value(Value::Object(fields)).map_err(|e| {
            Error::Malformed {
                path: "/all/get".to_string(),
                message: e.to_string(),
            }
        })?;

        let snapshot = decoder::decode_snapshot(&metrics);
        self.inner.state.merge_from(&snapshot.state);
        self.inner.status.merge_from(&snapshot.status);
        Ok(())
    }

    /// Emits a report for every log record newer than the cursor.
    /// Returns how many were emitted.
    pub async fn report(&self) -> Result<usize> {
        let fields = self.call("/loger/get?offset=0").await?;

        let entries = match fields.get("LOGS") {
            None | Some(Value::Null) => return Ok(0),
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                return Err(Error::Malformed {
                    path: "/loger/get".to_string(),
                    message: format!("LOGS is not an array: {other}"),
                })
            }
        };

        let records = entries.iter().filter_map(|entry| match LogRecord::try_from(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping log entry: {e}");
                None
            }
        });

        let fresh = {
            let mut cursor = lock(&self.inner.cursor);
            let (next, fresh) = select_new_records(*cursor, records);
            *cursor = next;
            fresh
        };

        for record in &fresh {
            self.emit(Event::Report(decoder::decode_log_record(record)));
        }
        Ok(fresh.len())
    }

    /// Switches the relay. Does nothing if the known state already matches.
    pub async fn set_state(&self, on: bool) -> Result<()> {
        let current = self.inner.state.get().get("on").and_then(Value::as_bool);
        if current == Some(on) {
            return Ok(());
        }

        self.call(if on { "/utils/ctrl?on" } else { "/utils/ctrl?off" })
            .await?;
        self.inner.state.merge_from(&RelayState { on });
        Ok(())
    }

    pub async fn clear_logs(&self) -> Result<()> {
        self.call("/loger/delall").await.map(|_| ())
    }

    pub async fn reboot(&self) -> Result<()> {
        self.call("/utils/reboot").await.map(|_| ())
    }

    /// Applies a bridge command. Failures go to recovery like any other.
    pub async fn handle(&self, command: Command) {
        let result = match command {
            Command::Set { state } => self.set_state(state).await,
        };
        if let Err(e) = result {
            self.handle_error(e);
        }
    }
}

/// Keeps records newer than `cursor` and moves the cursor to the first of
/// them. The device lists its log newest first.
pub fn select_new_records(
    cursor: Option<i64>,
    records: impl IntoIterator<Item = LogRecord>,
) -> (Option<i64>, Vec<LogRecord>) {
    let fresh: Vec<LogRecord> = records
        .into_iter()
        .filter(|record| cursor.map_or(true, |seen| record.timestamp > seen))
        .collect();

    match fresh.first() {
        Some(newest) => (Some(newest.timestamp), fresh),
        None => (cursor, fresh),
    }
}

/// Time until the device should have written the record after `cursor`.
/// Falls back to the fixed retry when there is no cursor or that moment
/// has already passed.
pub fn next_report_delay(cursor: Option<i64>, now_millis: i64, timings: &Timings) -> Duration {
    let Some(cursor) = cursor else {
        return timings.report_fallback;
    };

    let due = cursor
        .saturating_mul(1000)
        .saturating_add(timings.log_period.as_millis() as i64)
        .saturating_add(timings.report_slack.as_millis() as i64)
        .saturating_sub(now_millis);

    if due > 0 {
        Duration::from_millis(due as u64)
    } else {
        timings.report_fallback
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
