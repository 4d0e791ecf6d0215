//! Builders for test graphs on top of the in-memory store.

use std::sync::OnceLock;

use crate::db::models::{ChildAccount, Credential, NewUser, Preferences};
use crate::services::accounts::{grant_role, register_device, register_node, seed_role_catalog};
use crate::services::password::hash_password;
use crate::store::memory::MemoryStore;
use crate::store::Store;

pub const PASSWORD: &str = "pw";

// Argon2 is slow in debug builds; hash the shared password once.
fn password_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).expect("hash fixture password"))
        .clone()
}

pub fn seeded_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    seed_role_catalog(&mut store).expect("seed roles");
    store
}

/// A user named after `username` whose password is [`PASSWORD`].
pub fn account(store: &mut MemoryStore, username: &str) -> i64 {
    let user = store
        .insert_user(&NewUser {
            first_name: username.to_string(),
            last_name: "Doe".to_string(),
            email: None,
        })
        .expect("insert user");
    store
        .insert_credential(&Credential {
            user_id: user.id,
            username: username.to_string(),
            password_hash: password_hash(),
        })
        .expect("insert credential");
    store
        .insert_preferences(&Preferences {
            user_id: user.id,
            temperature_unit: "fahrenheit".to_string(),
            measurement_unit: "imperial".to_string(),
            locale: "en_US".to_string(),
        })
        .expect("insert preferences");
    user.id
}

pub fn with_role(store: &mut MemoryStore, user_id: i64, role: &str) -> i64 {
    grant_role(store, user_id, role).expect("grant role").id
}

/// Role plus a device at `ip` carrying `nodes`. Returns the device id.
pub fn with_device(store: &mut MemoryStore, user_id: i64, role: &str, ip: &str, nodes: &[&str]) -> i64 {
    with_role(store, user_id, role);
    let device = register_device(store, user_id, role, ip).expect("register device");
    for name in nodes {
        register_node(store, device, name).expect("register node");
    }
    device
}

pub fn link_child(store: &mut MemoryStore, parent_id: i64, child_id: i64) {
    store
        .insert_child_account(&ChildAccount { parent_id, child_id })
        .expect("link child");
}
