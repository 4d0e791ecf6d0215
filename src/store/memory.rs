//! In-memory [`Store`] for unit tests.
//!
//! Mirrors the constraints of the Postgres schema that the services rely on
//! (unique usernames, one device per assignment, dense node positions, one
//! parent per child, one refresh token per user) and the cascade on user
//! deletion. `atomic` snapshots the tables and restores them on error.

use chrono::{DateTime, Utc};

use super::Store;
use crate::db::models::{
    ChildAccount, Credential, Device, DeviceNode, NewDevice, NewDeviceNode, NewRefreshToken, NewRole,
    NewRoleAssignment, NewScheduleTask, NewUser, Preferences, RefreshToken, Role, RoleAssignment, ScheduleTask, User,
};
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    users: Vec<User>,
    credentials: Vec<Credential>,
    roles: Vec<Role>,
    role_assignments: Vec<RoleAssignment>,
    devices: Vec<Device>,
    device_nodes: Vec<DeviceNode>,
    child_accounts: Vec<ChildAccount>,
    refresh_tokens: Vec<RefreshToken>,
    preferences: Vec<Preferences>,
    schedule_tasks: Vec<ScheduleTask>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    /// Role-assignment inserts left before the next one fails.
    fail_role_assignment_after: Option<usize>,
    /// Value a concurrent refresh rotates the next token to first.
    rival_rotation: Option<String>,
}

fn duplicate(what: &str) -> ServiceError {
    ServiceError::bad_request(format!("already exists: {}", what))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successful` more role-assignment inserts through, then fail one.
    pub fn fail_role_assignment_inserts_after(&mut self, successful: usize) {
        self.fail_role_assignment_after = Some(successful);
    }

    /// Make the next `rotate_refresh_token` lose its race: another caller
    /// rotates the same token to `winner` between the read and the swap.
    pub fn lose_next_rotation_to(&mut self, winner: &str) {
        self.rival_rotation = Some(winner.to_string());
    }

    pub fn user_count(&self) -> usize {
        self.tables.users.len()
    }

    pub fn credential_count(&self) -> usize {
        self.tables.credentials.len()
    }

    pub fn role_assignment_count(&self) -> usize {
        self.tables.role_assignments.len()
    }

    pub fn device_count(&self) -> usize {
        self.tables.devices.len()
    }

    pub fn child_account_count(&self) -> usize {
        self.tables.child_accounts.len()
    }

    pub fn refresh_token_for(&self, user_id: i64) -> Option<RefreshToken> {
        self.tables.refresh_tokens.iter().find(|t| t.user_id == user_id).cloned()
    }

    /// Overwrite a stored refresh token, e.g. to backdate its expiry.
    pub fn put_refresh_token(&mut self, token: RefreshToken) {
        self.tables.refresh_tokens.retain(|t| t.user_id != token.user_id);
        self.tables.refresh_tokens.push(token);
    }
}

impl Store for MemoryStore {
    fn atomic<T, F>(&mut self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&mut Self) -> ServiceResult<T>,
    {
        let snapshot = self.tables.clone();
        let result = f(self);
        if result.is_err() {
            self.tables = snapshot;
        }
        result
    }

    fn find_user(&mut self, id: i64) -> ServiceResult<Option<User>> {
        Ok(self.tables.users.iter().find(|u| u.id == id).cloned())
    }

    fn insert_user(&mut self, row: &NewUser) -> ServiceResult<User> {
        let user = User {
            id: self.tables.allocate_id(),
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            email: row.email.clone(),
        };
        self.tables.users.push(user.clone());
        Ok(user)
    }

    fn delete_user(&mut self, id: i64) -> ServiceResult<usize> {
        let t = &mut self.tables;
        let before = t.users.len();
        t.users.retain(|u| u.id != id);
        let removed = before - t.users.len();

        let assignment_ids: Vec<i64> = t
            .role_assignments
            .iter()
            .filter(|ra| ra.user_id == id)
            .map(|ra| ra.id)
            .collect();
        let device_ids: Vec<i64> = t
            .devices
            .iter()
            .filter(|d| assignment_ids.contains(&d.role_assignment_id))
            .map(|d| d.id)
            .collect();
        t.device_nodes.retain(|n| !device_ids.contains(&n.device_id));
        t.devices.retain(|d| !device_ids.contains(&d.id));
        t.role_assignments.retain(|ra| ra.user_id != id);
        t.credentials.retain(|c| c.user_id != id);
        t.child_accounts.retain(|l| l.parent_id != id && l.child_id != id);
        t.refresh_tokens.retain(|rt| rt.user_id != id);
        t.preferences.retain(|p| p.user_id != id);
        t.schedule_tasks.retain(|st| st.user_id != id);
        Ok(removed)
    }

    fn find_credential(&mut self, username: &str) -> ServiceResult<Option<Credential>> {
        Ok(self.tables.credentials.iter().find(|c| c.username == username).cloned())
    }

    fn credential_for_user(&mut self, user_id: i64) -> ServiceResult<Option<Credential>> {
        Ok(self.tables.credentials.iter().find(|c| c.user_id == user_id).cloned())
    }

    fn insert_credential(&mut self, row: &Credential) -> ServiceResult<()> {
        if !self.tables.users.iter().any(|u| u.id == row.user_id) {
            return Err(ServiceError::bad_request("unknown reference: user"));
        }
        if self
            .tables
            .credentials
            .iter()
            .any(|c| c.username == row.username || c.user_id == row.user_id)
        {
            return Err(duplicate("credential"));
        }
        self.tables.credentials.push(row.clone());
        Ok(())
    }

    fn update_password(&mut self, user_id: i64, password_hash: &str) -> ServiceResult<usize> {
        let mut updated = 0;
        for c in self.tables.credentials.iter_mut().filter(|c| c.user_id == user_id) {
            c.password_hash = password_hash.to_string();
            updated += 1;
        }
        Ok(updated)
    }

    fn find_role(&mut self, name: &str) -> ServiceResult<Option<Role>> {
        Ok(self.tables.roles.iter().find(|r| r.name == name).cloned())
    }

    fn insert_role(&mut self, row: &NewRole) -> ServiceResult<Role> {
        if self.tables.roles.iter().any(|r| r.name == row.name) {
            return Err(duplicate("role"));
        }
        let role = Role {
            id: self.tables.allocate_id(),
            name: row.name.clone(),
        };
        self.tables.roles.push(role.clone());
        Ok(role)
    }

    fn role_assignments(&mut self, user_id: i64) -> ServiceResult<Vec<(RoleAssignment, Role)>> {
        let t = &self.tables;
        Ok(t.role_assignments
            .iter()
            .filter(|ra| ra.user_id == user_id)
            .filter_map(|ra| {
                t.roles
                    .iter()
                    .find(|r| r.id == ra.role_id)
                    .map(|r| (ra.clone(), r.clone()))
            })
            .collect())
    }

    fn insert_role_assignment(&mut self, row: &NewRoleAssignment) -> ServiceResult<RoleAssignment> {
        if let Some(left) = self.fail_role_assignment_after.as_mut() {
            if *left == 0 {
                self.fail_role_assignment_after = None;
                return Err(ServiceError::Internal("injected role assignment failure".into()));
            }
            *left -= 1;
        }
        if !self.tables.users.iter().any(|u| u.id == row.user_id) {
            return Err(ServiceError::bad_request("unknown reference: user"));
        }
        if self
            .tables
            .role_assignments
            .iter()
            .any(|ra| ra.user_id == row.user_id && ra.role_id == row.role_id)
        {
            return Err(duplicate("role assignment"));
        }
        let assignment = RoleAssignment {
            id: self.tables.allocate_id(),
            user_id: row.user_id,
            role_id: row.role_id,
        };
        self.tables.role_assignments.push(assignment.clone());
        Ok(assignment)
    }

    fn find_device(&mut self, id: i64) -> ServiceResult<Option<Device>> {
        Ok(self.tables.devices.iter().find(|d| d.id == id).cloned())
    }

    fn device_for_assignment(&mut self, role_assignment_id: i64) -> ServiceResult<Option<Device>> {
        Ok(self
            .tables
            .devices
            .iter()
            .find(|d| d.role_assignment_id == role_assignment_id)
            .cloned())
    }

    fn insert_device(&mut self, row: &NewDevice) -> ServiceResult<Device> {
        if self
            .tables
            .devices
            .iter()
            .any(|d| d.role_assignment_id == row.role_assignment_id)
        {
            return Err(duplicate("device for role assignment"));
        }
        let device = Device {
            id: self.tables.allocate_id(),
            role_assignment_id: row.role_assignment_id,
            ip: row.ip.clone(),
            max_nodes: row.max_nodes,
        };
        self.tables.devices.push(device.clone());
        Ok(device)
    }

    fn device_nodes(&mut self, device_id: i64) -> ServiceResult<Vec<DeviceNode>> {
        let mut nodes: Vec<DeviceNode> = self
            .tables
            .device_nodes
            .iter()
            .filter(|n| n.device_id == device_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.position);
        Ok(nodes)
    }

    fn count_device_nodes(&mut self, device_id: i64) -> ServiceResult<i64> {
        Ok(self.tables.device_nodes.iter().filter(|n| n.device_id == device_id).count() as i64)
    }

    fn insert_device_node(&mut self, row: &NewDeviceNode) -> ServiceResult<DeviceNode> {
        if self
            .tables
            .device_nodes
            .iter()
            .any(|n| n.device_id == row.device_id && n.position == row.position)
        {
            return Err(duplicate("device node position"));
        }
        let node = DeviceNode {
            id: self.tables.allocate_id(),
            device_id: row.device_id,
            name: row.name.clone(),
            position: row.position,
        };
        self.tables.device_nodes.push(node.clone());
        Ok(node)
    }

    fn parent_of(&mut self, child_id: i64) -> ServiceResult<Option<i64>> {
        Ok(self
            .tables
            .child_accounts
            .iter()
            .find(|l| l.child_id == child_id)
            .map(|l| l.parent_id))
    }

    fn children_of(&mut self, parent_id: i64) -> ServiceResult<Vec<i64>> {
        let mut children: Vec<i64> = self
            .tables
            .child_accounts
            .iter()
            .filter(|l| l.parent_id == parent_id)
            .map(|l| l.child_id)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    fn insert_child_account(&mut self, row: &ChildAccount) -> ServiceResult<()> {
        if self.tables.child_accounts.iter().any(|l| l.child_id == row.child_id) {
            return Err(duplicate("child account"));
        }
        self.tables.child_accounts.push(*row);
        Ok(())
    }

    fn delete_child_account(&mut self, row: &ChildAccount) -> ServiceResult<usize> {
        let before = self.tables.child_accounts.len();
        self.tables.child_accounts.retain(|l| l != row);
        Ok(before - self.tables.child_accounts.len())
    }

    fn find_preferences(&mut self, user_id: i64) -> ServiceResult<Option<Preferences>> {
        Ok(self.tables.preferences.iter().find(|p| p.user_id == user_id).cloned())
    }

    fn insert_preferences(&mut self, row: &Preferences) -> ServiceResult<()> {
        if self.tables.preferences.iter().any(|p| p.user_id == row.user_id) {
            return Err(duplicate("preferences"));
        }
        self.tables.preferences.push(row.clone());
        Ok(())
    }

    fn find_refresh_token(&mut self, token: &str) -> ServiceResult<Option<RefreshToken>> {
        Ok(self.tables.refresh_tokens.iter().find(|t| t.token == token).cloned())
    }

    fn delete_refresh_tokens(&mut self, user_id: i64) -> ServiceResult<usize> {
        let before = self.tables.refresh_tokens.len();
        self.tables.refresh_tokens.retain(|t| t.user_id != user_id);
        Ok(before - self.tables.refresh_tokens.len())
    }

    fn insert_refresh_token(&mut self, row: &NewRefreshToken) -> ServiceResult<RefreshToken> {
        if self
            .tables
            .refresh_tokens
            .iter()
            .any(|t| t.user_id == row.user_id || t.token == row.token)
        {
            return Err(duplicate("refresh token"));
        }
        let token = RefreshToken {
            id: self.tables.allocate_id(),
            user_id: row.user_id,
            token: row.token.clone(),
            remaining_uses: row.remaining_uses,
            expire_time: row.expire_time,
        };
        self.tables.refresh_tokens.push(token.clone());
        Ok(token)
    }

    fn rotate_refresh_token(
        &mut self,
        old: &str,
        new: &str,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        if let Some(winner) = self.rival_rotation.take()
            && let Some(t) = self
                .tables
                .refresh_tokens
                .iter_mut()
                .find(|t| t.token == old && t.is_live(now))
        {
            t.token = winner;
            t.remaining_uses -= 1;
        }
        match self
            .tables
            .refresh_tokens
            .iter_mut()
            .find(|t| t.token == old && t.is_live(now))
        {
            Some(t) => {
                t.token = new.to_string();
                t.expire_time = expire_time;
                t.remaining_uses -= 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<Option<ScheduleTask>> {
        Ok(self
            .tables
            .schedule_tasks
            .iter()
            .find(|st| st.id == id && st.user_id == user_id)
            .cloned())
    }

    fn schedule_tasks(&mut self, user_id: i64) -> ServiceResult<Vec<ScheduleTask>> {
        Ok(self
            .tables
            .schedule_tasks
            .iter()
            .filter(|st| st.user_id == user_id)
            .cloned()
            .collect())
    }

    fn insert_schedule_task(&mut self, row: &NewScheduleTask) -> ServiceResult<ScheduleTask> {
        let task = ScheduleTask {
            id: self.tables.allocate_id(),
            user_id: row.user_id,
            task_type: row.task_type.clone(),
            days: row.days,
            alarm_time: row.alarm_time,
            light_group: row.light_group.clone(),
            hvac_start: row.hvac_start,
            hvac_stop: row.hvac_stop,
            hvac_mode: row.hvac_mode.clone(),
            hvac_start_temp: row.hvac_start_temp,
            hvac_stop_temp: row.hvac_stop_temp,
            enabled: row.enabled,
        };
        self.tables.schedule_tasks.push(task.clone());
        Ok(task)
    }

    fn delete_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<usize> {
        let before = self.tables.schedule_tasks.len();
        self.tables
            .schedule_tasks
            .retain(|st| !(st.id == id && st.user_id == user_id));
        Ok(before - self.tables.schedule_tasks.len())
    }

    fn enabled_schedule_tasks(&mut self) -> ServiceResult<Vec<ScheduleTask>> {
        Ok(self
            .tables
            .schedule_tasks
            .iter()
            .filter(|st| st.enabled)
            .cloned()
            .collect())
    }
}
