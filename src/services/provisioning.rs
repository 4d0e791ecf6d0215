//! Child accounts: delegated logins that share a subset of a parent's roles.
//!
//! A child gets copies of the requested role assignments, including each bound
//! device and its nodes, plus the parent's preferences. Children cannot have
//! children of their own.

use log::{debug, info};

use crate::db::models::{ChildAccount, Credential, NewDevice, NewDeviceNode, NewRoleAssignment, NewUser, Preferences};
use crate::error::{ServiceError, ServiceResult};
use crate::models::api::ChildAccountSummary;
use crate::services::password::hash_password;
use crate::store::Store;
use crate::utils::random_alphanumeric;

const INITIAL_PASSWORD_LEN: usize = 12;

pub fn generate_initial_password() -> String {
    random_alphanumeric(INITIAL_PASSWORD_LEN)
}

/// Create a child of `parent_id` logging in as `email`. Returns the parent's
/// children after the insert.
pub fn create_child_account<S: Store>(
    store: &mut S,
    parent_id: i64,
    email: &str,
    roles: &[String],
    initial_password: &str,
) -> ServiceResult<Vec<ChildAccountSummary>> {
    let email = email.trim();
    if email.is_empty() {
        return Err(ServiceError::bad_request("child account email is required"));
    }
    if initial_password.is_empty() {
        return Err(ServiceError::bad_request("initial password is required"));
    }
    let password_hash = hash_password(initial_password)?;

    let child_id = store.atomic(|s| {
        let parent = s
            .find_user(parent_id)?
            .ok_or_else(|| ServiceError::bad_request(format!("user {} does not exist", parent_id)))?;
        if s.parent_of(parent_id)?.is_some() {
            return Err(ServiceError::bad_request("a child account cannot create child accounts"));
        }
        if s.find_credential(email)?.is_some() {
            return Err(ServiceError::bad_request(format!("{} is already registered", email)));
        }

        let child = s.insert_user(&NewUser {
            first_name: parent.first_name.clone(),
            last_name: parent.last_name.clone(),
            email: Some(email.to_string()),
        })?;
        s.insert_credential(&Credential {
            user_id: child.id,
            username: email.to_string(),
            password_hash,
        })?;

        for (assignment, role) in s.role_assignments(parent_id)? {
            if !roles.iter().any(|r| *r == role.name) {
                continue;
            }
            let cloned = s.insert_role_assignment(&NewRoleAssignment {
                user_id: child.id,
                role_id: role.id,
            })?;
            if let Some(device) = s.device_for_assignment(assignment.id)? {
                let copy = s.insert_device(&NewDevice {
                    role_assignment_id: cloned.id,
                    ip: device.ip.clone(),
                    max_nodes: device.max_nodes,
                })?;
                for node in s.device_nodes(device.id)? {
                    s.insert_device_node(&NewDeviceNode {
                        device_id: copy.id,
                        name: node.name,
                        position: node.position,
                    })?;
                }
            }
            debug!("Child {} inherits role {} from {}", child.id, role.name, parent_id);
        }

        if let Some(prefs) = s.find_preferences(parent_id)? {
            s.insert_preferences(&Preferences {
                user_id: child.id,
                ..prefs
            })?;
        }

        s.insert_child_account(&ChildAccount {
            parent_id,
            child_id: child.id,
        })?;
        Ok(child.id)
    })?;

    info!("Created child account {} ({}) under {}", child_id, email, parent_id);
    list_child_accounts(store, parent_id)
}

/// Remove a child and everything it owns. Unknown links are ignored; the
/// return value says whether anything was deleted.
pub fn delete_child_account<S: Store>(store: &mut S, parent_id: i64, child_id: i64) -> ServiceResult<bool> {
    let deleted = store.atomic(|s| {
        let link = ChildAccount { parent_id, child_id };
        if s.delete_child_account(&link)? == 0 {
            return Ok(false);
        }
        s.delete_user(child_id)?;
        Ok(true)
    })?;
    if deleted {
        info!("Deleted child account {} of {}", child_id, parent_id);
    } else {
        debug!("No child account {} under {}, nothing to delete", child_id, parent_id);
    }
    Ok(deleted)
}

pub fn list_child_accounts<S: Store>(store: &mut S, parent_id: i64) -> ServiceResult<Vec<ChildAccountSummary>> {
    let mut children = Vec::new();
    for child_id in store.children_of(parent_id)? {
        let user_name = store
            .credential_for_user(child_id)?
            .map(|c| c.username)
            .unwrap_or_default();
        let roles = store
            .role_assignments(child_id)?
            .into_iter()
            .map(|(_, role)| role.name)
            .collect();
        children.push(ChildAccountSummary {
            user_name,
            user_id: child_id,
            roles,
        });
    }
    Ok(children)
}
