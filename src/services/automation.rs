//! Scheduled automation: light-alarm ramps and HVAC relay control.
//!
//! Every light group with an alarm gets its own loop thread, registered in an
//! [`AlarmRegistry`] so a new rule for the same group replaces the running
//! loop. HVAC rules are evaluated by one worker thread that owns its own
//! store handle and runs on a steady cadence.
//!
//! Device failures never leave a loop: they are logged and the next tick
//! simply tries again.
//!
//! A thermostat gets at most one plan per tick. When several active rules
//! resolve to the same controller, the owner's own rules beat delegated
//! (child) rules and, among equals, the oldest task wins. Once no rule
//! covers a controller any more, its relays are switched off.

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, TimeDelta};
use log::{debug, info, warn};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::client::{DeviceControl, HvacSystem};
use crate::config::Config;
use crate::db::models::{role_names, ScheduleTask};
use crate::error::{ServiceError, ServiceResult};
use crate::models::api::{HvacMode, TaskType};
use crate::services::accounts::{effective_owner_id, resolve_device_endpoint};
use crate::store::Store;
use crate::utils::{scheduled_at, DaySet, TimeWindow};

/// Half-width of the window around an alarm's trigger time.
pub const ALARM_WINDOW_RADIUS_MINUTES: i64 = 10;
const BRIGHTNESS_STEP: u16 = 2;
const BRIGHTNESS_CEILING: u16 = 254;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicked loop must not take the registry down with it
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Cancellation token shared between a loop and whoever owns it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<(Mutex<bool>, Condvar)>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (flag, cvar) = &*self.0;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.0.0)
    }

    /// Sleep for `timeout` or until stopped. Returns true when stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.0;
        let guard = lock(flag);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

/// Sleep out the rest of `interval` measured from `tick_start`.
fn wait_for_next_tick(stop: &StopSignal, tick_start: Instant, interval: Duration) -> bool {
    let remaining = interval.saturating_sub(tick_start.elapsed());
    if remaining.is_zero() {
        return stop.is_stopped();
    }
    stop.wait(remaining)
}

// ---------------------------------------------------------------------------
// Light alarms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LightAlarm {
    pub task_id: i64,
    pub hub: String,
    pub group: String,
    pub days: DaySet,
    pub trigger: NaiveTime,
    pub window: TimeWindow,
}

impl LightAlarm {
    pub fn new(task_id: i64, hub: String, group: String, days: DaySet, trigger: NaiveTime) -> Self {
        LightAlarm {
            task_id,
            hub,
            group,
            days,
            trigger,
            window: TimeWindow::around(trigger, TimeDelta::minutes(ALARM_WINDOW_RADIUS_MINUTES)),
        }
    }

    /// `None` unless `task` is a complete light-alarm rule.
    pub fn for_task(task: &ScheduleTask, hub: String) -> Option<Self> {
        if task.kind()? != TaskType::LightAlarm {
            return None;
        }
        let trigger = task.alarm_time?;
        let group = task.light_group.clone()?;
        Some(LightAlarm::new(task.id, hub, group, task.day_set(), trigger))
    }
}

/// Brightness ramp state of one alarm.
#[derive(Debug, Clone)]
pub struct AlarmRuntime {
    alarm: LightAlarm,
    counter: u16,
}

impl AlarmRuntime {
    pub fn new(alarm: LightAlarm) -> Self {
        AlarmRuntime { alarm, counter: 0 }
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// Advance the ramp. Returns the brightness to push, if any. The day
    /// check uses the trigger's day, so a window that starts before midnight
    /// ramps on the eve of a scheduled day.
    pub fn tick(&mut self, now: NaiveDateTime) -> Option<u8> {
        let alarm = &self.alarm;
        if scheduled_at(alarm.days, &alarm.window, alarm.trigger, now) && self.counter <= BRIGHTNESS_CEILING {
            self.counter += BRIGHTNESS_STEP;
            Some(u8::try_from(self.counter).unwrap_or(u8::MAX))
        } else {
            self.counter = 0;
            None
        }
    }
}

fn run_alarm(
    mut runtime: AlarmRuntime,
    control: Arc<dyn DeviceControl>,
    api_key: String,
    tick: Duration,
    stop: StopSignal,
    done: Sender<()>,
) {
    let alarm = runtime.alarm.clone();
    debug!("Alarm loop for group {} (task {}) started", alarm.group, alarm.task_id);
    loop {
        let tick_start = Instant::now();
        if stop.is_stopped() {
            break;
        }
        if let Some(brightness) = runtime.tick(local_now()) {
            debug!("Group {}: brightness {}", alarm.group, brightness);
            if let Err(e) = control.set_group_state(&alarm.hub, &api_key, &alarm.group, true, brightness) {
                warn!("Light alarm push to group {} on {} failed: {}", alarm.group, alarm.hub, e);
            }
        }
        if wait_for_next_tick(&stop, tick_start, tick) {
            break;
        }
    }
    debug!("Alarm loop for group {} (task {}) stopped", alarm.group, alarm.task_id);
    let _ = done.send(());
}

struct AlarmHandle {
    task_id: i64,
    stop: StopSignal,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

impl AlarmHandle {
    /// Signal the loop and wait up to `timeout` for it to exit. A loop that
    /// overruns is left to finish on its own.
    fn stop_and_join(self, group: &str, timeout: Duration) {
        self.stop.stop();
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Alarm loop for group {} (task {}) did not stop within {:?}; detaching it",
                    group, self.task_id, timeout
                );
            }
        }
    }
}

/// Live light-alarm loops keyed by `(hub, group)`. At most one per key.
pub struct AlarmRegistry {
    control: Arc<dyn DeviceControl>,
    api_key: String,
    tick: Duration,
    join_timeout: Duration,
    alarms: Mutex<HashMap<(String, String), AlarmHandle>>,
}

impl AlarmRegistry {
    pub fn new(control: Arc<dyn DeviceControl>, api_key: String, tick: Duration, join_timeout: Duration) -> Self {
        AlarmRegistry {
            control,
            api_key,
            tick,
            join_timeout,
            alarms: Mutex::new(HashMap::new()),
        }
    }

    /// Start a loop for `alarm`, stopping the group's current loop first.
    pub fn install(&self, alarm: LightAlarm) -> ServiceResult<()> {
        let key = (alarm.hub.clone(), alarm.group.clone());
        let mut alarms = lock(&self.alarms);
        if let Some(previous) = alarms.remove(&key) {
            info!("Replacing alarm for group {} (task {} -> {})", alarm.group, previous.task_id, alarm.task_id);
            previous.stop_and_join(&alarm.group, self.join_timeout);
        }

        let stop = StopSignal::new();
        let (done_tx, done_rx) = mpsc::channel();
        let task_id = alarm.task_id;
        let group = alarm.group.clone();
        let thread = {
            let runtime = AlarmRuntime::new(alarm);
            let control = Arc::clone(&self.control);
            let api_key = self.api_key.clone();
            let tick = self.tick;
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("alarm-{}", group))
                .spawn(move || run_alarm(runtime, control, api_key, tick, stop, done_tx))
                .map_err(|e| ServiceError::Internal(format!("spawning alarm loop failed: {}", e)))?
        };
        alarms.insert(
            key,
            AlarmHandle {
                task_id,
                stop,
                done: done_rx,
                thread,
            },
        );
        info!("Installed light alarm for group {} (task {})", group, task_id);
        Ok(())
    }

    /// Stop the loop driven by `task_id`, if one is running.
    pub fn cancel_task(&self, task_id: i64) -> bool {
        let mut alarms = lock(&self.alarms);
        let key = alarms
            .iter()
            .find(|(_, handle)| handle.task_id == task_id)
            .map(|(key, _)| key.clone());
        match key.and_then(|k| alarms.remove(&k).map(|h| (k, h))) {
            Some(((_, group), handle)) => {
                handle.stop_and_join(&group, self.join_timeout);
                info!("Cancelled light alarm for group {} (task {})", group, task_id);
                true
            }
            None => false,
        }
    }

    /// Task ids of the running loops, ascending.
    pub fn active_tasks(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.alarms).values().map(|h| h.task_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn shutdown(&self) {
        let drained: Vec<_> = lock(&self.alarms).drain().collect();
        for ((_, group), handle) in drained {
            handle.stop_and_join(&group, self.join_timeout);
        }
    }
}

impl Drop for AlarmRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install a loop for every enabled light-alarm rule in the store. Rules whose
/// owner has no lighting hub are skipped.
pub fn install_stored_alarms<S: Store>(store: &mut S, alarms: &AlarmRegistry) -> ServiceResult<usize> {
    let mut installed = 0;
    for task in store.enabled_schedule_tasks()? {
        if task.kind() != Some(TaskType::LightAlarm) {
            continue;
        }
        let hub = match resolve_device_endpoint(store, task.user_id, role_names::LIGHTING) {
            Ok(hub) => hub,
            Err(e) => {
                warn!("Skipping light alarm task {}: {}", task.id, e);
                continue;
            }
        };
        match LightAlarm::for_task(&task, hub) {
            Some(alarm) => {
                alarms.install(alarm)?;
                installed += 1;
            }
            None => warn!("Skipping incomplete light alarm task {}", task.id),
        }
    }
    Ok(installed)
}

// ---------------------------------------------------------------------------
// HVAC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HvacRule {
    pub task_id: i64,
    pub user_id: i64,
    pub days: DaySet,
    /// Comfort period; `start_temp` applies inside, `stop_temp` outside.
    pub period: TimeWindow,
    pub mode: HvacMode,
    pub start_temp: f64,
    pub stop_temp: f64,
}

impl HvacRule {
    pub fn for_task(task: &ScheduleTask) -> Option<Self> {
        if task.kind()? != TaskType::Hvac {
            return None;
        }
        Some(HvacRule {
            task_id: task.id,
            user_id: task.user_id,
            days: task.day_set(),
            period: TimeWindow::new(task.hvac_start?, task.hvac_stop?),
            mode: task.mode()?,
            start_temp: task.hvac_start_temp?,
            stop_temp: task.hvac_stop_temp?,
        })
    }

    pub fn desired_temperature(&self, at: NaiveTime) -> f64 {
        if self.period.contains(at) {
            self.start_temp
        } else {
            self.stop_temp
        }
    }
}

/// Relay states to push to a thermostat controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPlan {
    pub furnace: bool,
    pub air_conditioning: bool,
}

impl RelayPlan {
    pub const ALL_OFF: RelayPlan = RelayPlan {
        furnace: false,
        air_conditioning: false,
    };
}

pub fn plan_relays(mode: HvacMode, current: f64, desired: f64) -> RelayPlan {
    match mode {
        HvacMode::Heating => RelayPlan {
            furnace: current < desired,
            air_conditioning: false,
        },
        HvacMode::Cooling => RelayPlan {
            furnace: false,
            air_conditioning: current >= desired,
        },
        HvacMode::Off => RelayPlan::ALL_OFF,
    }
}

pub fn apply_plan(control: &dyn DeviceControl, endpoint: &str, plan: RelayPlan) {
    for (system, on) in [
        (HvacSystem::Furnace, plan.furnace),
        (HvacSystem::AirConditioning, plan.air_conditioning),
    ] {
        let result = if on {
            control.turn_on(endpoint, system)
        } else {
            control.turn_off(endpoint, system)
        };
        if let Err(e) = result {
            warn!("Switching {:?} {} on {} failed: {}", system, if on { "on" } else { "off" }, endpoint, e);
        }
    }
}

/// Enabled HVAC rules scheduled for `now`'s weekday, one per controller.
fn active_rules_by_endpoint<S: Store>(store: &mut S, now: NaiveDateTime) -> ServiceResult<BTreeMap<String, HvacRule>> {
    // (delegated, rule): lower sorts first and wins
    let mut chosen: BTreeMap<String, (bool, HvacRule)> = BTreeMap::new();
    for task in store.enabled_schedule_tasks()? {
        let Some(rule) = HvacRule::for_task(&task) else {
            continue;
        };
        if !rule.days.contains(now.weekday()) {
            continue;
        }
        let endpoint = match resolve_device_endpoint(store, rule.user_id, role_names::THERMOSTAT) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("HVAC task {}: {}", rule.task_id, e);
                continue;
            }
        };
        let delegated = effective_owner_id(store, rule.user_id)? != rule.user_id;
        match chosen.entry(endpoint) {
            Entry::Vacant(slot) => {
                slot.insert((delegated, rule));
            }
            Entry::Occupied(mut slot) => {
                let (held_delegated, held) = slot.get();
                let held_id = held.task_id;
                if (delegated, rule.task_id) < (*held_delegated, held_id) {
                    debug!("HVAC task {} overridden by task {} on {}", held_id, rule.task_id, slot.key());
                    slot.insert((delegated, rule));
                } else {
                    debug!("HVAC task {} overridden by task {} on {}", rule.task_id, held_id, slot.key());
                }
            }
        }
    }
    Ok(chosen.into_iter().map(|(endpoint, (_, rule))| (endpoint, rule)).collect())
}

/// HVAC evaluation that remembers which controllers it drove, so relays are
/// released when a rule's day ends or the rule is disabled or deleted.
#[derive(Debug, Default)]
pub struct HvacController {
    driven: BTreeSet<String>,
}

impl HvacController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one evaluation. Returns the number of controllers that were sent
    /// a rule's plan; released controllers are not counted.
    pub fn tick<S: Store>(&mut self, store: &mut S, control: &dyn DeviceControl, now: NaiveDateTime) -> ServiceResult<usize> {
        let rules = active_rules_by_endpoint(store, now)?;
        let mut applied = 0;
        for (endpoint, rule) in &rules {
            let plan = if rule.mode == HvacMode::Off {
                RelayPlan::ALL_OFF
            } else {
                let current = match control.read_temperature(endpoint) {
                    Ok(celsius) => celsius,
                    Err(e) => {
                        warn!("HVAC task {}: reading temperature from {} failed: {}", rule.task_id, endpoint, e);
                        continue;
                    }
                };
                let desired = rule.desired_temperature(now.time());
                debug!(
                    "HVAC task {}: {:?} current={} desired={}",
                    rule.task_id, rule.mode, current, desired
                );
                plan_relays(rule.mode, current, desired)
            };
            apply_plan(control, endpoint, plan);
            applied += 1;
        }

        for endpoint in self.driven.iter().filter(|e| !rules.contains_key(*e)) {
            info!("No HVAC rule covers {} any more; switching its relays off", endpoint);
            apply_plan(control, endpoint, RelayPlan::ALL_OFF);
        }
        self.driven = rules.into_keys().collect();
        Ok(applied)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

// One engine per process.
static ENGINE_RUNNING: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tick: Duration,
    pub join_timeout: Duration,
    pub light_hub_api_key: String,
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        EngineSettings {
            tick: cfg.automation_tick,
            join_timeout: cfg.alarm_join_timeout,
            light_hub_api_key: cfg.light_hub_api_key.clone(),
        }
    }
}

struct Worker {
    stop: StopSignal,
    thread: JoinHandle<()>,
}

pub struct AutomationEngine {
    settings: EngineSettings,
    control: Arc<dyn DeviceControl>,
    alarms: AlarmRegistry,
    worker: Mutex<Option<Worker>>,
}

impl AutomationEngine {
    pub fn new(settings: EngineSettings, control: Arc<dyn DeviceControl>) -> Self {
        let alarms = AlarmRegistry::new(
            Arc::clone(&control),
            settings.light_hub_api_key.clone(),
            settings.tick,
            settings.join_timeout,
        );
        AutomationEngine {
            settings,
            control,
            alarms,
            worker: Mutex::new(None),
        }
    }

    pub fn alarms(&self) -> &AlarmRegistry {
        &self.alarms
    }

    /// Switch both relays of a thermostat off right away. The worker would
    /// do the same on its next tick once no rule covers `endpoint`.
    pub fn release_thermostat(&self, endpoint: &str) {
        apply_plan(self.control.as_ref(), endpoint, RelayPlan::ALL_OFF);
        info!("Switched HVAC relays on {} off", endpoint);
    }

    /// Install stored light alarms, then hand `store` to the HVAC worker.
    pub fn start<S: Store + Send + 'static>(&self, mut store: S) -> ServiceResult<()> {
        if ENGINE_RUNNING
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::Internal("automation engine is already running".into()));
        }

        let spawned = install_stored_alarms(&mut store, &self.alarms).and_then(|installed| {
            info!("Restored {} light alarm(s)", installed);
            let stop = StopSignal::new();
            let control = Arc::clone(&self.control);
            let tick = self.settings.tick;
            let worker_stop = stop.clone();
            thread::Builder::new()
                .name("hvac-worker".into())
                .spawn(move || run_worker(store, control, tick, worker_stop))
                .map(|thread| Worker { stop, thread })
                .map_err(|e| ServiceError::Internal(format!("spawning HVAC worker failed: {}", e)))
        });

        match spawned {
            Ok(worker) => {
                *lock(&self.worker) = Some(worker);
                info!("Automation engine started (tick={}s)", self.settings.tick.as_secs_f64());
                Ok(())
            }
            Err(e) => {
                self.alarms.shutdown();
                ENGINE_RUNNING.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Block until the worker exits on its own or another thread calls
    /// [`shutdown`](Self::shutdown).
    pub fn wait(&self) {
        let stop = lock(&self.worker).as_ref().map(|w| w.stop.clone());
        if let Some(stop) = stop {
            while !stop.wait(Duration::from_secs(3600)) {}
        }
        self.shutdown();
    }

    pub fn shutdown(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.stop.stop();
            let _ = worker.thread.join();
            self.alarms.shutdown();
            ENGINE_RUNNING.store(false, Ordering::SeqCst);
            info!("Automation engine stopped");
        }
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<S: Store>(mut store: S, control: Arc<dyn DeviceControl>, tick: Duration, stop: StopSignal) {
    let mut hvac = HvacController::new();
    loop {
        let tick_start = Instant::now();
        match hvac.tick(&mut store, control.as_ref(), local_now()) {
            Ok(applied) => debug!("HVAC tick sent plans to {} controller(s)", applied),
            Err(e) => warn!("HVAC tick failed: {}", e),
        }
        if wait_for_next_tick(&stop, tick_start, tick) {
            break;
        }
    }
}
