//! Request and response shapes of the exposed operations.
//!
//! Routing is not part of this crate; these types are what a transport layer
//! serializes in and out.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::db::models::ScheduleTask;
use crate::utils::{parse_serde_enum, serde_enum_name, DaySet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: i64,
    pub ip: String,
    pub max_nodes: i32,
    pub nodes: Vec<NodeInfo>,
}

/// A role held by a user, with the device bound to it if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub name: String,
    pub device: Option<DeviceInfo>,
}

/// A user whose credentials have just been checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<RoleGrant>,
}

impl Identity {
    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRotation {
    pub user_id: i64,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub available_nodes: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildAccountSummary {
    pub user_name: String,
    pub user_id: i64,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    LightAlarm,
    Hvac,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Heating,
    Cooling,
    Off,
}

/// A schedule rule as submitted by a user. `task_id` names the task being
/// replaced, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRule {
    #[serde(default)]
    pub task_id: Option<i64>,
    pub task_type: TaskType,
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub alarm_time: Option<NaiveTime>,
    #[serde(default)]
    pub light_group: Option<String>,
    #[serde(default)]
    pub hvac_start: Option<NaiveTime>,
    #[serde(default)]
    pub hvac_stop: Option<NaiveTime>,
    #[serde(default)]
    pub hvac_mode: Option<HvacMode>,
    #[serde(default)]
    pub hvac_start_temp: Option<f64>,
    #[serde(default)]
    pub hvac_stop_temp: Option<f64>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ScheduleTask {
    pub fn kind(&self) -> Option<TaskType> {
        parse_serde_enum(&self.task_type)
    }

    pub fn mode(&self) -> Option<HvacMode> {
        self.hvac_mode.as_deref().and_then(parse_serde_enum)
    }

    pub fn day_set(&self) -> DaySet {
        DaySet::from_bits(self.days)
    }

    pub fn to_rule(&self) -> Option<ScheduleRule> {
        Some(ScheduleRule {
            task_id: Some(self.id),
            task_type: self.kind()?,
            days: self.day_set().iter().collect(),
            alarm_time: self.alarm_time,
            light_group: self.light_group.clone(),
            hvac_start: self.hvac_start,
            hvac_stop: self.hvac_stop,
            hvac_mode: self.mode(),
            hvac_start_temp: self.hvac_start_temp,
            hvac_stop_temp: self.hvac_stop_temp,
            enabled: self.enabled,
        })
    }
}

impl TaskType {
    pub fn name(&self) -> String {
        serde_enum_name(self).unwrap_or_default()
    }
}

impl HvacMode {
    pub fn name(&self) -> String {
        serde_enum_name(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_use_snake_case_names() {
        assert_eq!(TaskType::LightAlarm.name(), "light_alarm");
        assert_eq!(HvacMode::Cooling.name(), "cooling");
        assert_eq!(parse_serde_enum::<HvacMode>("heating"), Some(HvacMode::Heating));
        assert_eq!(parse_serde_enum::<HvacMode>("warm"), None);
    }

    #[test]
    fn rule_defaults_to_enabled() {
        let rule: ScheduleRule =
            serde_json::from_str(r#"{"task_type":"hvac","days":["Mon","Fri"]}"#).expect("parse rule");
        assert!(rule.enabled);
        assert_eq!(rule.days, vec![Weekday::Mon, Weekday::Fri]);
        assert_eq!(rule.task_id, None);
    }
}
