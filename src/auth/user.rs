//! # Users
//!
//! The user record, the storage trait the engines work against, and an
//! in-memory store. Uniqueness of email and username is the store's job and
//! must hold atomically with the insert, so the in-memory implementation
//! keeps its secondary indexes under the same write lock as the rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

use super::errors::{AuthError, AuthResult};

// ==================
// User Record
// ==================

/// A user account
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Assigned by federated provisioning; local registrations start without one
    pub username: Option<String>,
    /// Absent for accounts that only ever signed in through a provider
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub image: Option<String>,
    pub two_factor_enabled: bool,
    /// Present iff two-factor is enabled
    pub totp_secret: Option<String>,
    /// One-use recovery codes; the set shrinks as codes are consumed
    pub backup_codes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The view of the account that is safe to serialize into responses
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            image: self.image.clone(),
            two_factor_enabled: self.two_factor_enabled,
        }
    }
}

/// Public projection of a user (no hashes, no secrets)
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    pub username: Option<String>,
    pub image: Option<String>,
    pub two_factor_enabled: bool,
}

/// Fields for creating a user; the store assigns id and timestamps
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub image: Option<String>,
    pub is_active: bool,
}

// ==================
// Store Trait
// ==================

/// Persistence for user accounts
pub trait UserStore: Send + Sync {
    fn find_by_id(&self, id: i64) -> AuthResult<Option<User>>;

    fn find_by_email(&self, email: &str) -> AuthResult<Option<User>>;

    /// Create a user, enforcing email and username uniqueness atomically
    fn create(&self, new_user: NewUser) -> AuthResult<User>;

    /// Replace the stored row for `user.id`
    fn update(&self, user: &User) -> AuthResult<User>;
}

// ==================
// In-Memory Store
// ==================

#[derive(Default)]
struct Rows {
    users: HashMap<i64, User>,
    email_index: HashMap<String, i64>,
    username_index: HashMap<String, i64>,
    next_id: i64,
}

/// In-memory user store
pub struct InMemoryUserStore {
    rows: RwLock<Rows>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
        }
    }
}

impl Default for InMemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for InMemoryUserStore {
    fn find_by_id(&self, id: i64) -> AuthResult<Option<User>> {
        let rows = self.rows.read().unwrap();
        Ok(rows.users.get(&id).cloned())
    }

    fn find_by_email(&self, email: &str) -> AuthResult<Option<User>> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .email_index
            .get(email)
            .and_then(|id| rows.users.get(id))
            .cloned())
    }

    fn create(&self, new_user: NewUser) -> AuthResult<User> {
        let mut rows = self.rows.write().unwrap();

        if rows.email_index.contains_key(&new_user.email) {
            return Err(AuthError::EmailExists(new_user.email));
        }
        if let Some(username) = &new_user.username {
            if rows.username_index.contains_key(username) {
                return Err(AuthError::UsernameExists(username.clone()));
            }
        }

        rows.next_id += 1;
        let now = Utc::now();
        let user = User {
            id: rows.next_id,
            email: new_user.email,
            username: new_user.username,
            password_hash: new_user.password_hash,
            is_active: new_user.is_active,
            image: new_user.image,
            two_factor_enabled: false,
            totp_secret: None,
            backup_codes: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        rows.email_index.insert(user.email.clone(), user.id);
        if let Some(username) = &user.username {
            rows.username_index.insert(username.clone(), user.id);
        }
        rows.users.insert(user.id, user.clone());
        Ok(user)
    }

    fn update(&self, user: &User) -> AuthResult<User> {
        let mut rows = self.rows.write().unwrap();

        let existing = rows
            .users
            .get(&user.id)
            .cloned()
            .ok_or(AuthError::UserNotFound(user.id))?;

        if user.email != existing.email {
            if rows.email_index.contains_key(&user.email) {
                return Err(AuthError::EmailExists(user.email.clone()));
            }
            rows.email_index.remove(&existing.email);
            rows.email_index.insert(user.email.clone(), user.id);
        }
        if user.username != existing.username {
            if let Some(username) = &user.username {
                if rows.username_index.contains_key(username) {
                    return Err(AuthError::UsernameExists(username.clone()));
                }
            }
            if let Some(old) = &existing.username {
                rows.username_index.remove(old);
            }
            if let Some(username) = &user.username {
                rows.username_index.insert(username.clone(), user.id);
            }
        }

        let mut updated = user.clone();
        updated.updated_at = Utc::now();
        rows.users.insert(updated.id, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            username: None,
            password_hash: Some("$argon2id$fake".to_string()),
            image: None,
            is_active: true,
        }
    }

    #[test]
    fn test_create_and_find() {
        let store = InMemoryUserStore::new();
        let created = store.create(new_user("a@example.com")).unwrap();
        assert_eq!(created.id, 1);
        assert!(!created.two_factor_enabled);

        let by_id = store.find_by_id(created.id).unwrap().unwrap();
        assert_eq!(by_id.email, "a@example.com");

        let by_email = store.find_by_email("a@example.com").unwrap().unwrap();
        assert_eq!(by_email.id, created.id);

        assert!(store.find_by_email("missing@example.com").unwrap().is_none());
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = InMemoryUserStore::new();
        let a = store.create(new_user("a@example.com")).unwrap();
        let b = store.create(new_user("b@example.com")).unwrap();
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let store = InMemoryUserStore::new();
        store.create(new_user("a@example.com")).unwrap();
        let err = store.create(new_user("a@example.com")).unwrap_err();
        assert!(matches!(err, AuthError::EmailExists(_)));
    }

    #[test]
    fn test_duplicate_username_rejected() {
        let store = InMemoryUserStore::new();
        let mut first = new_user("a@example.com");
        first.username = Some("alice".to_string());
        store.create(first).unwrap();

        let mut second = new_user("b@example.com");
        second.username = Some("alice".to_string());
        let err = store.create(second).unwrap_err();
        assert!(matches!(err, AuthError::UsernameExists(_)));
    }

    #[test]
    fn test_update_round_trip() {
        let store = InMemoryUserStore::new();
        let mut user = store.create(new_user("a@example.com")).unwrap();

        user.two_factor_enabled = true;
        user.totp_secret = Some("SECRET".to_string());
        user.backup_codes = vec!["code1".to_string(), "code2".to_string()];
        let updated = store.update(&user).unwrap();
        assert!(updated.updated_at >= user.updated_at);

        let reread = store.find_by_id(user.id).unwrap().unwrap();
        assert!(reread.two_factor_enabled);
        assert_eq!(reread.backup_codes.len(), 2);
    }

    #[test]
    fn test_update_missing_user() {
        let store = InMemoryUserStore::new();
        let mut user = store.create(new_user("a@example.com")).unwrap();
        user.id = 999;
        let err = store.update(&user).unwrap_err();
        assert!(matches!(err, AuthError::UserNotFound(999)));
    }

    #[test]
    fn test_update_username_collision() {
        let store = InMemoryUserStore::new();
        let mut taken = new_user("a@example.com");
        taken.username = Some("alice".to_string());
        store.create(taken).unwrap();

        let mut user = store.create(new_user("b@example.com")).unwrap();
        user.username = Some("alice".to_string());
        let err = store.update(&user).unwrap_err();
        assert!(matches!(err, AuthError::UsernameExists(_)));
    }

    #[test]
    fn test_profile_hides_secrets() {
        let store = InMemoryUserStore::new();
        let mut user = store.create(new_user("a@example.com")).unwrap();
        user.totp_secret = Some("SECRET".to_string());
        let user = store.update(&user).unwrap();

        let json = serde_json::to_value(user.profile()).unwrap();
        assert!(json.get("password_hash").is_none());
        assert!(json.get("totp_secret").is_none());
        assert!(json.get("backup_codes").is_none());
        assert_eq!(json["email"], "a@example.com");
    }
}
