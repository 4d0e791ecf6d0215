//! Persistence gateway consumed by the request-path services.
//!
//! `PgConnection` implements [`Store`] directly (see `pg.rs`); tests use the
//! in-memory store in `memory.rs`. Every multi-step write goes through
//! [`Store::atomic`] so a failure leaves nothing behind.

pub mod pg;

#[cfg(test)]
pub mod memory;

use chrono::{DateTime, Utc};

use crate::db::models::{
    ChildAccount, Credential, Device, DeviceNode, NewDevice, NewDeviceNode, NewRefreshToken, NewRole,
    NewRoleAssignment, NewScheduleTask, NewUser, Preferences, RefreshToken, Role, RoleAssignment, ScheduleTask, User,
};
use crate::error::ServiceResult;

pub trait Store {
    /// Run `f` as one unit of work: committed when it returns `Ok`, rolled
    /// back on `Err`. Nested calls are allowed.
    fn atomic<T, F>(&mut self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&mut Self) -> ServiceResult<T>;

    fn find_user(&mut self, id: i64) -> ServiceResult<Option<User>>;
    fn insert_user(&mut self, row: &NewUser) -> ServiceResult<User>;
    /// Removes the user and everything it owns.
    fn delete_user(&mut self, id: i64) -> ServiceResult<usize>;

    fn find_credential(&mut self, username: &str) -> ServiceResult<Option<Credential>>;
    fn credential_for_user(&mut self, user_id: i64) -> ServiceResult<Option<Credential>>;
    fn insert_credential(&mut self, row: &Credential) -> ServiceResult<()>;
    fn update_password(&mut self, user_id: i64, password_hash: &str) -> ServiceResult<usize>;

    fn find_role(&mut self, name: &str) -> ServiceResult<Option<Role>>;
    fn insert_role(&mut self, row: &NewRole) -> ServiceResult<Role>;
    /// Assignments of one user joined with their role, in creation order.
    fn role_assignments(&mut self, user_id: i64) -> ServiceResult<Vec<(RoleAssignment, Role)>>;
    fn insert_role_assignment(&mut self, row: &NewRoleAssignment) -> ServiceResult<RoleAssignment>;

    fn find_device(&mut self, id: i64) -> ServiceResult<Option<Device>>;
    fn device_for_assignment(&mut self, role_assignment_id: i64) -> ServiceResult<Option<Device>>;
    fn insert_device(&mut self, row: &NewDevice) -> ServiceResult<Device>;
    /// Nodes of a device ordered by position.
    fn device_nodes(&mut self, device_id: i64) -> ServiceResult<Vec<DeviceNode>>;
    fn count_device_nodes(&mut self, device_id: i64) -> ServiceResult<i64>;
    fn insert_device_node(&mut self, row: &NewDeviceNode) -> ServiceResult<DeviceNode>;

    fn parent_of(&mut self, child_id: i64) -> ServiceResult<Option<i64>>;
    fn children_of(&mut self, parent_id: i64) -> ServiceResult<Vec<i64>>;
    fn insert_child_account(&mut self, row: &ChildAccount) -> ServiceResult<()>;
    fn delete_child_account(&mut self, row: &ChildAccount) -> ServiceResult<usize>;

    fn find_preferences(&mut self, user_id: i64) -> ServiceResult<Option<Preferences>>;
    fn insert_preferences(&mut self, row: &Preferences) -> ServiceResult<()>;

    fn find_refresh_token(&mut self, token: &str) -> ServiceResult<Option<RefreshToken>>;
    fn delete_refresh_tokens(&mut self, user_id: i64) -> ServiceResult<usize>;
    fn insert_refresh_token(&mut self, row: &NewRefreshToken) -> ServiceResult<RefreshToken>;
    /// Compare-and-swap on the token value: replaces `old` with `new`, sets the
    /// new expiry and spends one use, but only while `old` is still live at
    /// `now`. Returns false when another rotation got there first.
    fn rotate_refresh_token(
        &mut self,
        old: &str,
        new: &str,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool>;

    fn find_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<Option<ScheduleTask>>;
    fn schedule_tasks(&mut self, user_id: i64) -> ServiceResult<Vec<ScheduleTask>>;
    fn insert_schedule_task(&mut self, row: &NewScheduleTask) -> ServiceResult<ScheduleTask>;
    fn delete_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<usize>;
    fn enabled_schedule_tasks(&mut self) -> ServiceResult<Vec<ScheduleTask>>;
}
