//! Persisted schedule rules and their link to the automation runtime.
//!
//! Updating a rule replaces its row: the old task is deleted and the new one
//! gets a fresh id, which is what callers receive back. Removing or disabling
//! an HVAC rule switches its thermostat's relays off.

use log::{debug, info, warn};

use crate::db::models::{role_names, NewScheduleTask, ScheduleTask};
use crate::error::{ServiceError, ServiceResult};
use crate::models::api::{HvacMode, ScheduleRule, TaskType};
use crate::services::accounts::resolve_device_endpoint;
use crate::services::automation::{AutomationEngine, LightAlarm};
use crate::store::Store;
use crate::utils::DaySet;

/// Decode a rule from JSON, naming the offending field on failure.
pub fn parse_rule(json: &str) -> ServiceResult<ScheduleRule> {
    let de = &mut serde_json::Deserializer::from_str(json);
    serde_path_to_error::deserialize(de).map_err(|e| {
        ServiceError::bad_request(format!("invalid schedule rule at {}: {}", e.path(), e.inner()))
    })
}

fn required<T>(value: Option<T>, field: &str) -> ServiceResult<T> {
    value.ok_or_else(|| ServiceError::bad_request(format!("{} is required", field)))
}

/// Check `rule` and turn it into a row for `user_id`. Fields that do not
/// belong to the rule's type are dropped.
pub fn validate_rule(user_id: i64, rule: &ScheduleRule) -> ServiceResult<NewScheduleTask> {
    let days: DaySet = rule.days.iter().copied().collect();
    if days.is_empty() {
        return Err(ServiceError::bad_request("at least one day is required"));
    }

    let mut row = NewScheduleTask {
        user_id,
        task_type: rule.task_type.name(),
        days: days.bits(),
        alarm_time: None,
        light_group: None,
        hvac_start: None,
        hvac_stop: None,
        hvac_mode: None,
        hvac_start_temp: None,
        hvac_stop_temp: None,
        enabled: rule.enabled,
    };
    match rule.task_type {
        TaskType::LightAlarm => {
            row.alarm_time = Some(required(rule.alarm_time, "alarm_time")?);
            let group = required(rule.light_group.as_deref(), "light_group")?.trim();
            if group.is_empty() {
                return Err(ServiceError::bad_request("light_group is required"));
            }
            row.light_group = Some(group.to_string());
        }
        TaskType::Hvac => {
            let start = required(rule.hvac_start, "hvac_start")?;
            let stop = required(rule.hvac_stop, "hvac_stop")?;
            if start == stop {
                return Err(ServiceError::bad_request("hvac_start and hvac_stop must differ"));
            }
            let mode: HvacMode = required(rule.hvac_mode, "hvac_mode")?;
            let start_temp = required(rule.hvac_start_temp, "hvac_start_temp")?;
            let stop_temp = required(rule.hvac_stop_temp, "hvac_stop_temp")?;
            if !start_temp.is_finite() || !stop_temp.is_finite() {
                return Err(ServiceError::bad_request("temperatures must be finite numbers"));
            }
            row.hvac_start = Some(start);
            row.hvac_stop = Some(stop);
            row.hvac_mode = Some(mode.name());
            row.hvac_start_temp = Some(start_temp);
            row.hvac_stop_temp = Some(stop_temp);
        }
    }
    Ok(row)
}

fn drives_hvac(task: &ScheduleTask) -> bool {
    task.enabled && task.kind() == Some(TaskType::Hvac)
}

/// Switch off the thermostat `task` drove unless another enabled HVAC rule
/// still targets it.
fn release_thermostat<S: Store>(store: &mut S, engine: &AutomationEngine, task: &ScheduleTask) -> ServiceResult<()> {
    let endpoint = match resolve_device_endpoint(store, task.user_id, role_names::THERMOSTAT) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("HVAC task {}: {}", task.id, e);
            return Ok(());
        }
    };
    for other in store.enabled_schedule_tasks()? {
        if other.id == task.id || !drives_hvac(&other) {
            continue;
        }
        if resolve_device_endpoint(store, other.user_id, role_names::THERMOSTAT).ok().as_ref() == Some(&endpoint) {
            debug!("Thermostat {} stays with HVAC task {}", endpoint, other.id);
            return Ok(());
        }
    }
    engine.release_thermostat(&endpoint);
    Ok(())
}

/// Store `rule` for `user_id` and (re)install its light alarm. A rule naming
/// `task_id` replaces that task.
pub fn upsert_schedule_task<S: Store>(
    store: &mut S,
    engine: &AutomationEngine,
    user_id: i64,
    rule: &ScheduleRule,
) -> ServiceResult<ScheduleTask> {
    let row = validate_rule(user_id, rule)?;

    let (task, replaced, hub) = store.atomic(|s| {
        let replaced = match rule.task_id {
            Some(id) => {
                let old = s
                    .find_schedule_task(user_id, id)?
                    .ok_or_else(|| ServiceError::bad_request(format!("schedule task {} does not exist", id)))?;
                s.delete_schedule_task(user_id, id)?;
                Some(old)
            }
            None => None,
        };
        // a light alarm is useless without a hub to drive
        let hub = match rule.task_type {
            TaskType::LightAlarm => Some(resolve_device_endpoint(s, user_id, role_names::LIGHTING)?),
            TaskType::Hvac => None,
        };
        let task = s.insert_schedule_task(&row)?;
        Ok((task, replaced, hub))
    })?;

    if let Some(old) = &replaced {
        engine.alarms().cancel_task(old.id);
        if drives_hvac(old)
            && !drives_hvac(&task)
            && let Err(e) = release_thermostat(store, engine, old)
        {
            warn!("Releasing the thermostat of task {} failed: {}", old.id, e);
        }
        info!("Schedule task {} of user {} replaced by {}", old.id, user_id, task.id);
    } else {
        info!("Schedule task {} created for user {}", task.id, user_id);
    }
    if task.enabled
        && let Some(hub) = hub
        && let Some(alarm) = LightAlarm::for_task(&task, hub)
    {
        engine.alarms().install(alarm)?;
    }
    Ok(task)
}

pub fn delete_schedule_task<S: Store>(
    store: &mut S,
    engine: &AutomationEngine,
    user_id: i64,
    task_id: i64,
) -> ServiceResult<()> {
    let missing = || ServiceError::bad_request(format!("schedule task {} does not exist", task_id));
    let task = store.find_schedule_task(user_id, task_id)?.ok_or_else(missing)?;
    if store.delete_schedule_task(user_id, task_id)? == 0 {
        return Err(missing());
    }
    engine.alarms().cancel_task(task_id);
    if drives_hvac(&task)
        && let Err(e) = release_thermostat(store, engine, &task)
    {
        warn!("Releasing the thermostat of task {} failed: {}", task_id, e);
    }
    info!("Schedule task {} of user {} deleted", task_id, user_id);
    Ok(())
}

pub fn list_schedule_tasks<S: Store>(store: &mut S, user_id: i64) -> ServiceResult<Vec<ScheduleRule>> {
    Ok(store
        .schedule_tasks(user_id)?
        .iter()
        .filter_map(ScheduleTask::to_rule)
        .collect())
}
