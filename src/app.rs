//! Process-wide context built once in `main` and handed to whatever serves
//! requests. Every exposed operation is a method taking the caller's store.

use log::info;
use std::sync::Arc;

use crate::client::DeviceControl;
use crate::config::Config;
use crate::db::models::{ScheduleTask, User};
use crate::error::ServiceResult;
use crate::models::api::{ChildAccountSummary, NewAccount, NodeAllocation, ScheduleRule, TokenPair};
use crate::services::automation::{AutomationEngine, EngineSettings};
use crate::services::tokens::{self, Claims, TokenService};
use crate::services::{accounts, provisioning, schedule};
use crate::store::Store;

pub struct App {
    pub tokens: TokenService,
    pub engine: AutomationEngine,
}

impl App {
    pub fn new(cfg: &Config, control: Arc<dyn DeviceControl>) -> Self {
        App {
            tokens: TokenService::new(&cfg.token_secret),
            engine: AutomationEngine::new(EngineSettings::from(cfg), control),
        }
    }

    /// Claims of a valid `Authorization` header.
    pub fn authenticate(&self, header: Option<&str>) -> ServiceResult<Claims> {
        self.tokens.validate_access_token(header)
    }

    pub fn login<S: Store>(&self, store: &mut S, username: &str, password: &str) -> ServiceResult<TokenPair> {
        tokens::login(store, &self.tokens, username, password)
    }

    pub fn refresh<S: Store>(&self, store: &mut S, refresh_token: &str) -> ServiceResult<TokenPair> {
        tokens::refresh(store, &self.tokens, refresh_token)
    }

    pub fn logout<S: Store>(&self, store: &mut S, user_id: i64) -> ServiceResult<()> {
        tokens::logout(store, user_id)
    }

    pub fn signup<S: Store>(&self, store: &mut S, account: &NewAccount) -> ServiceResult<User> {
        accounts::signup(store, account)
    }

    pub fn grant_role<S: Store>(&self, store: &mut S, user_id: i64, role_name: &str) -> ServiceResult<()> {
        accounts::grant_role(store, user_id, role_name).map(|_| ())
    }

    pub fn change_password<S: Store>(&self, store: &mut S, user_id: i64, current: &str, new: &str) -> ServiceResult<()> {
        accounts::change_password(store, user_id, current, new)
    }

    pub fn register_device<S: Store>(&self, store: &mut S, user_id: i64, role_name: &str, ip: &str) -> ServiceResult<i64> {
        accounts::register_device(store, user_id, role_name, ip)
    }

    pub fn register_node<S: Store>(&self, store: &mut S, device_id: i64, name: &str) -> ServiceResult<NodeAllocation> {
        accounts::register_node(store, device_id, name)
    }

    /// Without `initial_password` a random one is generated; the caller gets
    /// it back alongside the parent's children.
    pub fn create_child_account<S: Store>(
        &self,
        store: &mut S,
        parent_id: i64,
        email: &str,
        roles: &[String],
        initial_password: Option<&str>,
    ) -> ServiceResult<(Vec<ChildAccountSummary>, String)> {
        let password = initial_password
            .map(str::to_string)
            .unwrap_or_else(provisioning::generate_initial_password);
        let children = provisioning::create_child_account(store, parent_id, email, roles, &password)?;
        Ok((children, password))
    }

    /// Deleting a child also stops any light alarm its rules were driving.
    pub fn delete_child_account<S: Store>(&self, store: &mut S, parent_id: i64, child_id: i64) -> ServiceResult<()> {
        let linked = store.children_of(parent_id)?.contains(&child_id);
        let tasks = if linked { store.schedule_tasks(child_id)? } else { Vec::new() };
        if provisioning::delete_child_account(store, parent_id, child_id)? {
            let cancelled = tasks
                .iter()
                .filter(|task| self.engine.alarms().cancel_task(task.id))
                .count();
            if cancelled > 0 {
                info!("Stopped {} light alarm(s) of deleted child {}", cancelled, child_id);
            }
        }
        Ok(())
    }

    pub fn list_child_accounts<S: Store>(&self, store: &mut S, parent_id: i64) -> ServiceResult<Vec<ChildAccountSummary>> {
        provisioning::list_child_accounts(store, parent_id)
    }

    pub fn upsert_schedule_task<S: Store>(&self, store: &mut S, user_id: i64, rule: &ScheduleRule) -> ServiceResult<ScheduleTask> {
        schedule::upsert_schedule_task(store, &self.engine, user_id, rule)
    }

    pub fn delete_schedule_task<S: Store>(&self, store: &mut S, user_id: i64, task_id: i64) -> ServiceResult<()> {
        schedule::delete_schedule_task(store, &self.engine, user_id, task_id)
    }

    pub fn list_schedule_tasks<S: Store>(&self, store: &mut S, user_id: i64) -> ServiceResult<Vec<ScheduleRule>> {
        schedule::list_schedule_tasks(store, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::recording::RecordingControl;
    use crate::db::models::role_names;
    use crate::error::ServiceError;
    use crate::services::fixtures::{account, seeded_store, with_device, PASSWORD};
    use std::time::Duration;

    fn config() -> Config {
        Config {
            database_url: String::new(),
            token_secret: "a-test-secret-of-at-least-thirty-two-bytes".into(),
            light_hub_api_key: "key".into(),
            automation_enabled: false,
            automation_tick: Duration::from_millis(20),
            alarm_join_timeout: Duration::from_secs(2),
            device_timeout: Duration::from_secs(1),
        }
    }

    fn app() -> App {
        App::new(&config(), Arc::new(RecordingControl::default()))
    }

    #[test]
    fn login_authenticates_requests() {
        let app = app();
        let mut store = seeded_store();
        let alice = account(&mut store, "alice");

        let pair = app.login(&mut store, "alice", PASSWORD).unwrap();
        let header = format!("Bearer {}", pair.access_token);
        assert_eq!(app.authenticate(Some(header.as_str())).unwrap().sub, alice);
        assert!(matches!(app.authenticate(None), Err(ServiceError::Unauthorized(_))));

        app.logout(&mut store, alice).unwrap();
        assert!(matches!(
            app.refresh(&mut store, &pair.refresh_token),
            Err(ServiceError::Forbidden(_))
        ));
    }

    #[test]
    fn deleting_a_child_stops_its_alarms() {
        let app = app();
        let mut store = seeded_store();
        let parent = account(&mut store, "parent");
        with_device(&mut store, parent, role_names::LIGHTING, "10.0.0.2", &[]);

        let (children, password) = app
            .create_child_account(&mut store, parent, "kid@example.com", &[role_names::LIGHTING.to_string()], None)
            .unwrap();
        assert_eq!(password.len(), 12);
        let child = children[0].user_id;
        assert!(app.login(&mut store, "kid@example.com", &password).is_ok());

        let rule: ScheduleRule = serde_json::from_str(
            r#"{"task_type":"light_alarm","days":["Wed"],"alarm_time":"06:00:00","light_group":"9"}"#,
        )
        .unwrap();
        let task = app.upsert_schedule_task(&mut store, child, &rule).unwrap();
        assert_eq!(app.engine.alarms().active_tasks(), vec![task.id]);

        app.delete_child_account(&mut store, parent, child).unwrap();
        assert!(app.engine.alarms().active_tasks().is_empty());
        assert!(app.list_child_accounts(&mut store, parent).unwrap().is_empty());

        // deleting again is a no-op
        app.delete_child_account(&mut store, parent, child).unwrap();
    }
}
