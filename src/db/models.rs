//! Diesel model structs for the identity, delegation and schedule tables.
//!
//! Row structs are shared by every `Store` implementation, so the in-memory
//! store used in tests hands out exactly the shapes Postgres would.

use chrono::{DateTime, NaiveTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

// Built-in role catalog, seeded at startup.
pub mod role_names {
    pub const GARAGE_DOOR: &str = "garage_door";
    pub const LIGHTING: &str = "lighting";
    pub const SECURITY: &str = "security";
    pub const THERMOSTAT: &str = "thermostat";

    pub const CATALOG: [&str; 4] = [GARAGE_DOOR, LIGHTING, SECURITY, THERMOSTAT];
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::users)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable, Insertable)]
#[diesel(table_name = schema::credentials)]
#[diesel(primary_key(user_id))]
#[diesel(belongs_to(User))]
pub struct Credential {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::roles)]
pub struct Role {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::roles)]
pub struct NewRole {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::role_assignments)]
#[diesel(belongs_to(User))]
#[diesel(belongs_to(Role))]
pub struct RoleAssignment {
    pub id: i64,
    pub user_id: i64,
    pub role_id: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::role_assignments)]
pub struct NewRoleAssignment {
    pub user_id: i64,
    pub role_id: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::devices)]
#[diesel(belongs_to(RoleAssignment))]
pub struct Device {
    pub id: i64,
    pub role_assignment_id: i64,
    pub ip: String,
    pub max_nodes: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub role_assignment_id: i64,
    pub ip: String,
    pub max_nodes: i32,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::device_nodes)]
#[diesel(belongs_to(Device))]
pub struct DeviceNode {
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::device_nodes)]
pub struct NewDeviceNode {
    pub device_id: i64,
    pub name: String,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::child_accounts)]
pub struct ChildAccount {
    pub parent_id: i64,
    pub child_id: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub remaining_uses: i32,
    pub expire_time: DateTime<Utc>,
}

impl RefreshToken {
    /// Live means unexpired with budget left; anything else is dead weight.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.remaining_uses > 0 && self.expire_time > now
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::refresh_tokens)]
pub struct NewRefreshToken {
    pub user_id: i64,
    pub token: String,
    pub remaining_uses: i32,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::preferences)]
#[diesel(primary_key(user_id))]
#[diesel(belongs_to(User))]
pub struct Preferences {
    pub user_id: i64,
    pub temperature_unit: String,
    pub measurement_unit: String,
    pub locale: String,
}

impl Preferences {
    pub fn defaults_for(user_id: i64) -> Self {
        Preferences {
            user_id,
            temperature_unit: "celsius".to_string(),
            measurement_unit: "metric".to_string(),
            locale: "en_US".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::schedule_tasks)]
#[diesel(belongs_to(User))]
pub struct ScheduleTask {
    pub id: i64,
    pub user_id: i64,
    pub task_type: String,
    pub days: i16,
    pub alarm_time: Option<NaiveTime>,
    pub light_group: Option<String>,
    pub hvac_start: Option<NaiveTime>,
    pub hvac_stop: Option<NaiveTime>,
    pub hvac_mode: Option<String>,
    pub hvac_start_temp: Option<f64>,
    pub hvac_stop_temp: Option<f64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::schedule_tasks)]
pub struct NewScheduleTask {
    pub user_id: i64,
    pub task_type: String,
    pub days: i16,
    pub alarm_time: Option<NaiveTime>,
    pub light_group: Option<String>,
    pub hvac_start: Option<NaiveTime>,
    pub hvac_stop: Option<NaiveTime>,
    pub hvac_mode: Option<String>,
    pub hvac_start_temp: Option<f64>,
    pub hvac_stop_temp: Option<f64>,
    pub enabled: bool,
}
