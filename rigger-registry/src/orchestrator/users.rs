//! Registry users and their bcrypt password hashes

use super::secrets::random_string;
use rigger_core::error::{RiggerError, RiggerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PASSWORD_LENGTH: usize = 20;
pub const BCRYPT_COST: u32 = 10;

pub const USER_RO: &str = "ro";
pub const USER_RW: &str = "rw";
pub const USER_MIRROR_PULLER: &str = "mirror-puller";
pub const USER_MIRROR_PUSHER: &str = "mirror-pusher";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "name")]
    pub user_name: String,
    pub password: String,
    #[serde(rename = "passwordHash")]
    pub hashed_password: String,
}

impl User {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            hashed_password: String::new(),
        }
    }

    /// Fresh user with a random password and a matching hash
    pub fn generate(user_name: &str) -> RiggerResult<Self> {
        let mut user = Self::new(user_name, random_string(PASSWORD_LENGTH));
        user.update_password_hash()?;
        Ok(user)
    }

    pub fn is_valid(&self) -> bool {
        !self.user_name.is_empty() && !self.password.is_empty()
    }

    pub fn is_password_hash_valid(&self) -> bool {
        if self.password.is_empty() || self.hashed_password.is_empty() {
            return false;
        }
        bcrypt::verify(&self.password, &self.hashed_password).unwrap_or(false)
    }

    pub fn update_password_hash(&mut self) -> RiggerResult<()> {
        self.hashed_password = bcrypt::hash(&self.password, BCRYPT_COST)
            .map_err(|e| RiggerError::security(format!("cannot hash password: {}", e)))?;
        Ok(())
    }
}

/// Make `user` usable: generate credentials when incomplete and rehash when
/// the hash does not match the password.
pub fn process_user(name: &str, user: &mut User) -> RiggerResult<()> {
    if !user.is_valid() {
        *user = User::generate(name)?;
        return Ok(());
    }
    if !user.is_password_hash_valid() {
        user.update_password_hash()?;
    }
    Ok(())
}

/// Which users the current mode needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Params {
    pub ro: bool,
    pub rw: bool,
    pub mirror_puller: bool,
    pub mirror_pusher: bool,
}

/// Users found in `registry-user-*` secrets, keyed by name
pub type Inputs = BTreeMap<String, User>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ro: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_puller: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_pusher: Option<User>,
}

impl State {
    pub fn params(&self) -> Params {
        Params {
            ro: self.ro.is_some(),
            rw: self.rw.is_some(),
            mirror_puller: self.mirror_puller.is_some(),
            mirror_pusher: self.mirror_pusher.is_some(),
        }
    }

    /// Ensure every requested user exists and drop the others. A user kept in
    /// state wins over the one found in the cluster.
    pub fn process(&mut self, params: Params, inputs: &Inputs) -> RiggerResult<()> {
        let slots = [
            (USER_RO, params.ro, &mut self.ro),
            (USER_RW, params.rw, &mut self.rw),
            (USER_MIRROR_PULLER, params.mirror_puller, &mut self.mirror_puller),
            (USER_MIRROR_PUSHER, params.mirror_pusher, &mut self.mirror_pusher),
        ];

        for (name, wanted, slot) in slots {
            if !wanted {
                *slot = None;
                continue;
            }
            let mut user = slot
                .take()
                .or_else(|| inputs.get(name).cloned())
                .unwrap_or_default();
            process_user(name, &mut user)?;
            *slot = Some(user);
        }
        Ok(())
    }

    /// Users to publish, keyed by name
    pub fn named(&self) -> Vec<(&'static str, &User)> {
        [
            (USER_RO, self.ro.as_ref()),
            (USER_RW, self.rw.as_ref()),
            (USER_MIRROR_PULLER, self.mirror_puller.as_ref()),
            (USER_MIRROR_PUSHER, self.mirror_pusher.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, user)| user.map(|u| (name, u)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_user_generates_and_rehashes() {
        let mut empty = User::default();
        process_user(USER_RO, &mut empty).unwrap();
        assert_eq!(empty.user_name, "ro");
        assert!(empty.is_password_hash_valid());

        let mut stale = User {
            user_name: "ro".to_string(),
            password: "secret".to_string(),
            hashed_password: "not-a-hash".to_string(),
        };
        process_user(USER_RO, &mut stale).unwrap();
        assert_eq!(stale.password, "secret");
        assert!(stale.is_password_hash_valid());

        let hash = stale.hashed_password.clone();
        process_user(USER_RO, &mut stale).unwrap();
        assert_eq!(stale.hashed_password, hash);
    }

    #[test]
    fn test_state_process_uses_inputs_and_drops_unwanted() {
        let mut from_cluster = User::new("ro", "cluster-pass");
        from_cluster.update_password_hash().unwrap();
        let inputs = Inputs::from([(USER_RO.to_string(), from_cluster.clone())]);

        let mut state = State {
            rw: Some(User::generate(USER_RW).unwrap()),
            ..Default::default()
        };
        state
            .process(
                Params {
                    ro: true,
                    ..Default::default()
                },
                &inputs,
            )
            .unwrap();

        assert_eq!(state.ro, Some(from_cluster));
        assert!(state.rw.is_none());
        assert_eq!(state.named().len(), 1);
    }
}
