//! Users, credentials, roles and the devices bound to them.
//!
//! Child accounts act on their parent's devices: every lookup that needs a
//! device goes through [`effective_owner_id`].

use log::{debug, info};

use crate::db::models::role_names;
use crate::db::models::{Credential, NewDevice, NewDeviceNode, NewRole, NewRoleAssignment, NewUser, Preferences, RoleAssignment, User};
use crate::error::{ServiceError, ServiceResult};
use crate::models::api::{DeviceInfo, Identity, NewAccount, NodeAllocation, NodeInfo, RoleGrant};
use crate::services::password::{hash_password, verify_password};
use crate::store::Store;

/// Capacity given to every newly registered device.
pub const DEFAULT_MAX_NODES: i32 = 2;

/// Make sure every built-in role exists. Returns how many were created.
pub fn seed_role_catalog<S: Store>(store: &mut S) -> ServiceResult<usize> {
    store.atomic(|s| {
        let mut created = 0;
        for name in role_names::CATALOG {
            if s.find_role(name)?.is_none() {
                s.insert_role(&NewRole { name: name.to_string() })?;
                created += 1;
            }
        }
        Ok(created)
    })
}

pub fn signup<S: Store>(store: &mut S, account: &NewAccount) -> ServiceResult<User> {
    if account.username.trim().is_empty() || account.password.is_empty() {
        return Err(ServiceError::bad_request("username and password are required"));
    }
    if account.first_name.trim().is_empty() || account.last_name.trim().is_empty() {
        return Err(ServiceError::bad_request("first and last name are required"));
    }
    let password_hash = hash_password(&account.password)?;

    let user = store.atomic(|s| {
        if s.find_credential(&account.username)?.is_some() {
            return Err(ServiceError::bad_request("username already taken"));
        }
        let user = s.insert_user(&NewUser {
            first_name: account.first_name.clone(),
            last_name: account.last_name.clone(),
            email: account.email.clone(),
        })?;
        s.insert_credential(&Credential {
            user_id: user.id,
            username: account.username.clone(),
            password_hash,
        })?;
        s.insert_preferences(&Preferences::defaults_for(user.id))?;
        Ok(user)
    })?;
    info!("Created account {} for {}", user.id, account.username);
    Ok(user)
}

pub fn grant_role<S: Store>(store: &mut S, user_id: i64, role_name: &str) -> ServiceResult<RoleAssignment> {
    store.atomic(|s| {
        s.find_user(user_id)?
            .ok_or_else(|| ServiceError::bad_request(format!("user {} does not exist", user_id)))?;
        let role = s
            .find_role(role_name)?
            .ok_or_else(|| ServiceError::bad_request(format!("unknown role {}", role_name)))?;
        let held = s.role_assignments(user_id)?;
        if held.iter().any(|(_, r)| r.id == role.id) {
            return Err(ServiceError::bad_request(format!("user already holds role {}", role_name)));
        }
        s.insert_role_assignment(&NewRoleAssignment {
            user_id,
            role_id: role.id,
        })
    })
}

pub fn change_password<S: Store>(store: &mut S, user_id: i64, current: &str, new: &str) -> ServiceResult<()> {
    if new.is_empty() {
        return Err(ServiceError::bad_request("new password is required"));
    }
    let credential = store
        .credential_for_user(user_id)?
        .ok_or_else(|| ServiceError::unauthorized("unknown account"))?;
    if !verify_password(current, &credential.password_hash)? {
        return Err(ServiceError::unauthorized("current password does not match"));
    }
    let password_hash = hash_password(new)?;
    store.atomic(|s| {
        s.update_password(user_id, &password_hash)?;
        // outstanding sessions must log in again with the new password
        s.delete_refresh_tokens(user_id)?;
        Ok(())
    })?;
    info!("Password changed for user {}", user_id);
    Ok(())
}

pub fn validate_credentials<S: Store>(store: &mut S, username: &str, password: &str) -> ServiceResult<Identity> {
    let credential = store
        .find_credential(username)?
        .ok_or_else(|| ServiceError::unauthorized("invalid username or password"))?;
    if !verify_password(password, &credential.password_hash)? {
        return Err(ServiceError::unauthorized("invalid username or password"));
    }
    identity_for(store, credential.user_id)
}

/// The identity and role list of an existing user.
pub fn identity_for<S: Store>(store: &mut S, user_id: i64) -> ServiceResult<Identity> {
    let user = store
        .find_user(user_id)?
        .ok_or_else(|| ServiceError::unauthorized(format!("user {} no longer exists", user_id)))?;
    Ok(Identity {
        user_id: user.id,
        first_name: user.first_name,
        last_name: user.last_name,
        roles: role_grants(store, user_id)?,
    })
}

pub fn role_grants<S: Store>(store: &mut S, user_id: i64) -> ServiceResult<Vec<RoleGrant>> {
    let mut grants = Vec::new();
    for (assignment, role) in store.role_assignments(user_id)? {
        let device = match store.device_for_assignment(assignment.id)? {
            Some(device) => {
                let nodes = store
                    .device_nodes(device.id)?
                    .into_iter()
                    .map(|n| NodeInfo {
                        name: n.name,
                        position: n.position,
                    })
                    .collect();
                Some(DeviceInfo {
                    id: device.id,
                    ip: device.ip,
                    max_nodes: device.max_nodes,
                    nodes,
                })
            }
            None => None,
        };
        grants.push(RoleGrant {
            name: role.name,
            device,
        });
    }
    Ok(grants)
}

/// The account whose devices `user_id` acts on: the parent for a child
/// account, the user itself otherwise.
pub fn effective_owner_id<S: Store>(store: &mut S, user_id: i64) -> ServiceResult<i64> {
    Ok(store.parent_of(user_id)?.unwrap_or(user_id))
}

fn owner_assignment<S: Store>(store: &mut S, owner_id: i64, role_name: &str) -> ServiceResult<Option<RoleAssignment>> {
    Ok(store
        .role_assignments(owner_id)?
        .into_iter()
        .find(|(_, role)| role.name == role_name)
        .map(|(assignment, _)| assignment))
}

pub fn resolve_device_endpoint<S: Store>(store: &mut S, user_id: i64, role_name: &str) -> ServiceResult<String> {
    let owner = effective_owner_id(store, user_id)?;
    let assignment = owner_assignment(store, owner, role_name)?
        .ok_or_else(|| ServiceError::bad_request(format!("no {} role for user {}", role_name, user_id)))?;
    let device = store
        .device_for_assignment(assignment.id)?
        .ok_or_else(|| ServiceError::bad_request(format!("no {} device registered for user {}", role_name, user_id)))?;
    Ok(device.ip)
}

/// Bind a new device to the caller's (or parent's) assignment for `role_name`.
pub fn register_device<S: Store>(store: &mut S, user_id: i64, role_name: &str, ip: &str) -> ServiceResult<i64> {
    if ip.trim().is_empty() {
        return Err(ServiceError::bad_request("device ip is required"));
    }
    let device = store.atomic(|s| {
        let owner = effective_owner_id(s, user_id)?;
        let assignment = owner_assignment(s, owner, role_name)?
            .ok_or_else(|| ServiceError::unauthorized(format!("user {} does not hold role {}", user_id, role_name)))?;
        if s.device_for_assignment(assignment.id)?.is_some() {
            return Err(ServiceError::bad_request(format!("a {} device is already registered", role_name)));
        }
        s.insert_device(&NewDevice {
            role_assignment_id: assignment.id,
            ip: ip.trim().to_string(),
            max_nodes: DEFAULT_MAX_NODES,
        })
    })?;
    info!("Registered {} device {} at {} for owner of user {}", role_name, device.id, device.ip, user_id);
    Ok(device.id)
}

/// Allocate the next node position on a device. Positions stay dense
/// (1..=count) and a full device rejects the node instead of overwriting.
pub fn register_node<S: Store>(store: &mut S, device_id: i64, name: &str) -> ServiceResult<NodeAllocation> {
    if name.trim().is_empty() {
        return Err(ServiceError::bad_request("node name is required"));
    }
    store.atomic(|s| {
        let device = s
            .find_device(device_id)?
            .ok_or_else(|| ServiceError::unauthorized(format!("device {} does not exist", device_id)))?;
        let count = s.count_device_nodes(device_id)?;
        if count >= i64::from(device.max_nodes) {
            return Err(ServiceError::bad_request(format!(
                "device {} already has {} of {} nodes",
                device_id, count, device.max_nodes
            )));
        }
        let position = (count + 1) as i32;
        s.insert_device_node(&NewDeviceNode {
            device_id,
            name: name.trim().to_string(),
            position,
        })?;
        debug!("Device {}: node {:?} at position {}", device_id, name, position);
        Ok(NodeAllocation {
            available_nodes: device.max_nodes - position,
        })
    })
}
