use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;

use super::Store;
use crate::db::models::{
    ChildAccount, Credential, Device, DeviceNode, NewDevice, NewDeviceNode, NewRefreshToken, NewRole,
    NewRoleAssignment, NewScheduleTask, NewUser, Preferences, RefreshToken, Role, RoleAssignment, ScheduleTask, User,
};
use crate::error::ServiceResult;
use crate::schema;

// Foreign keys cascade (see migrations), so deleting a user or device here
// also removes every row hanging off it.
impl Store for PgConnection {
    fn atomic<T, F>(&mut self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&mut Self) -> ServiceResult<T>,
    {
        self.transaction(f)
    }

    fn find_user(&mut self, id: i64) -> ServiceResult<Option<User>> {
        use schema::users::dsl as U;
        Ok(U::users
            .find(id)
            .select(User::as_select())
            .first(self)
            .optional()?)
    }

    fn insert_user(&mut self, row: &NewUser) -> ServiceResult<User> {
        use schema::users::dsl as U;
        Ok(diesel::insert_into(U::users)
            .values(row)
            .returning(User::as_returning())
            .get_result(self)?)
    }

    fn delete_user(&mut self, id: i64) -> ServiceResult<usize> {
        use schema::users::dsl as U;
        Ok(diesel::delete(U::users.find(id)).execute(self)?)
    }

    fn find_credential(&mut self, username: &str) -> ServiceResult<Option<Credential>> {
        use schema::credentials::dsl as C;
        Ok(C::credentials
            .filter(C::username.eq(username))
            .select(Credential::as_select())
            .first(self)
            .optional()?)
    }

    fn credential_for_user(&mut self, user_id: i64) -> ServiceResult<Option<Credential>> {
        use schema::credentials::dsl as C;
        Ok(C::credentials
            .find(user_id)
            .select(Credential::as_select())
            .first(self)
            .optional()?)
    }

    fn insert_credential(&mut self, row: &Credential) -> ServiceResult<()> {
        use schema::credentials::dsl as C;
        diesel::insert_into(C::credentials).values(row).execute(self)?;
        Ok(())
    }

    fn update_password(&mut self, user_id: i64, password_hash: &str) -> ServiceResult<usize> {
        use schema::credentials::dsl as C;
        Ok(diesel::update(C::credentials.find(user_id))
            .set(C::password_hash.eq(password_hash))
            .execute(self)?)
    }

    fn find_role(&mut self, name: &str) -> ServiceResult<Option<Role>> {
        use schema::roles::dsl as R;
        Ok(R::roles
            .filter(R::name.eq(name))
            .select(Role::as_select())
            .first(self)
            .optional()?)
    }

    fn insert_role(&mut self, row: &NewRole) -> ServiceResult<Role> {
        use schema::roles::dsl as R;
        Ok(diesel::insert_into(R::roles)
            .values(row)
            .returning(Role::as_returning())
            .get_result(self)?)
    }

    fn role_assignments(&mut self, user_id: i64) -> ServiceResult<Vec<(RoleAssignment, Role)>> {
        use schema::role_assignments::dsl as RA;
        use schema::roles::dsl as R;
        Ok(RA::role_assignments
            .inner_join(R::roles)
            .filter(RA::user_id.eq(user_id))
            .order(RA::id.asc())
            .select((RoleAssignment::as_select(), Role::as_select()))
            .load(self)?)
    }

    fn insert_role_assignment(&mut self, row: &NewRoleAssignment) -> ServiceResult<RoleAssignment> {
        use schema::role_assignments::dsl as RA;
        Ok(diesel::insert_into(RA::role_assignments)
            .values(row)
            .returning(RoleAssignment::as_returning())
            .get_result(self)?)
    }

    fn find_device(&mut self, id: i64) -> ServiceResult<Option<Device>> {
        use schema::devices::dsl as D;
        Ok(D::devices
            .find(id)
            .select(Device::as_select())
            .first(self)
            .optional()?)
    }

    fn device_for_assignment(&mut self, role_assignment_id: i64) -> ServiceResult<Option<Device>> {
        use schema::devices::dsl as D;
        Ok(D::devices
            .filter(D::role_assignment_id.eq(role_assignment_id))
            .select(Device::as_select())
            .first(self)
            .optional()?)
    }

    fn insert_device(&mut self, row: &NewDevice) -> ServiceResult<Device> {
        use schema::devices::dsl as D;
        Ok(diesel::insert_into(D::devices)
            .values(row)
            .returning(Device::as_returning())
            .get_result(self)?)
    }

    fn device_nodes(&mut self, device_id: i64) -> ServiceResult<Vec<DeviceNode>> {
        use schema::device_nodes::dsl as N;
        Ok(N::device_nodes
            .filter(N::device_id.eq(device_id))
            .order(N::position.asc())
            .select(DeviceNode::as_select())
            .load(self)?)
    }

    fn count_device_nodes(&mut self, device_id: i64) -> ServiceResult<i64> {
        use schema::device_nodes::dsl as N;
        Ok(N::device_nodes
            .filter(N::device_id.eq(device_id))
            .count()
            .get_result(self)?)
    }

    fn insert_device_node(&mut self, row: &NewDeviceNode) -> ServiceResult<DeviceNode> {
        use schema::device_nodes::dsl as N;
        Ok(diesel::insert_into(N::device_nodes)
            .values(row)
            .returning(DeviceNode::as_returning())
            .get_result(self)?)
    }

    fn parent_of(&mut self, child_id: i64) -> ServiceResult<Option<i64>> {
        use schema::child_accounts::dsl as CA;
        Ok(CA::child_accounts
            .filter(CA::child_id.eq(child_id))
            .select(CA::parent_id)
            .first(self)
            .optional()?)
    }

    fn children_of(&mut self, parent_id: i64) -> ServiceResult<Vec<i64>> {
        use schema::child_accounts::dsl as CA;
        Ok(CA::child_accounts
            .filter(CA::parent_id.eq(parent_id))
            .order(CA::child_id.asc())
            .select(CA::child_id)
            .load(self)?)
    }

    fn insert_child_account(&mut self, row: &ChildAccount) -> ServiceResult<()> {
        use schema::child_accounts::dsl as CA;
        diesel::insert_into(CA::child_accounts).values(row).execute(self)?;
        Ok(())
    }

    fn delete_child_account(&mut self, row: &ChildAccount) -> ServiceResult<usize> {
        use schema::child_accounts::dsl as CA;
        Ok(diesel::delete(CA::child_accounts.find((row.parent_id, row.child_id))).execute(self)?)
    }

    fn find_preferences(&mut self, user_id: i64) -> ServiceResult<Option<Preferences>> {
        use schema::preferences::dsl as P;
        Ok(P::preferences
            .find(user_id)
            .select(Preferences::as_select())
            .first(self)
            .optional()?)
    }

    fn insert_preferences(&mut self, row: &Preferences) -> ServiceResult<()> {
        use schema::preferences::dsl as P;
        diesel::insert_into(P::preferences).values(row).execute(self)?;
        Ok(())
    }

    fn find_refresh_token(&mut self, token: &str) -> ServiceResult<Option<RefreshToken>> {
        use schema::refresh_tokens::dsl as RT;
        Ok(RT::refresh_tokens
            .filter(RT::token.eq(token))
            .select(RefreshToken::as_select())
            .first(self)
            .optional()?)
    }

    fn delete_refresh_tokens(&mut self, user_id: i64) -> ServiceResult<usize> {
        use schema::refresh_tokens::dsl as RT;
        Ok(diesel::delete(RT::refresh_tokens.filter(RT::user_id.eq(user_id))).execute(self)?)
    }

    fn insert_refresh_token(&mut self, row: &NewRefreshToken) -> ServiceResult<RefreshToken> {
        use schema::refresh_tokens::dsl as RT;
        Ok(diesel::insert_into(RT::refresh_tokens)
            .values(row)
            .returning(RefreshToken::as_returning())
            .get_result(self)?)
    }

    // A single conditional UPDATE: the row lock serializes concurrent
    // rotations and the loser re-checks `token = old` against the new value.
    fn rotate_refresh_token(
        &mut self,
        old: &str,
        new: &str,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ServiceResult<bool> {
        use schema::refresh_tokens::dsl as RT;
        let updated = diesel::update(
            RT::refresh_tokens
                .filter(RT::token.eq(old))
                .filter(RT::remaining_uses.gt(0))
                .filter(RT::expire_time.gt(now)),
        )
        .set((
            RT::token.eq(new),
            RT::expire_time.eq(expire_time),
            RT::remaining_uses.eq(RT::remaining_uses - 1),
        ))
        .execute(self)?;
        Ok(updated == 1)
    }

    fn find_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<Option<ScheduleTask>> {
        use schema::schedule_tasks::dsl as ST;
        Ok(ST::schedule_tasks
            .filter(ST::id.eq(id).and(ST::user_id.eq(user_id)))
            .select(ScheduleTask::as_select())
            .first(self)
            .optional()?)
    }

    fn schedule_tasks(&mut self, user_id: i64) -> ServiceResult<Vec<ScheduleTask>> {
        use schema::schedule_tasks::dsl as ST;
        Ok(ST::schedule_tasks
            .filter(ST::user_id.eq(user_id))
            .order(ST::id.asc())
            .select(ScheduleTask::as_select())
            .load(self)?)
    }

    fn insert_schedule_task(&mut self, row: &NewScheduleTask) -> ServiceResult<ScheduleTask> {
        use schema::schedule_tasks::dsl as ST;
        Ok(diesel::insert_into(ST::schedule_tasks)
            .values(row)
            .returning(ScheduleTask::as_returning())
            .get_result(self)?)
    }

    fn delete_schedule_task(&mut self, user_id: i64, id: i64) -> ServiceResult<usize> {
        use schema::schedule_tasks::dsl as ST;
        Ok(diesel::delete(ST::schedule_tasks.filter(ST::id.eq(id).and(ST::user_id.eq(user_id)))).execute(self)?)
    }

    fn enabled_schedule_tasks(&mut self) -> ServiceResult<Vec<ScheduleTask>> {
        use schema::schedule_tasks::dsl as ST;
        Ok(ST::schedule_tasks
            .filter(ST::enabled.eq(true))
            .order(ST::id.asc())
            .select(ScheduleTask::as_select())
            .load(self)?)
    }
}
