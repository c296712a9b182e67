use crate::config::{AuthClientEntry, Config};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::HashMap;

/// One configured client credential.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: u64,
    pub username: String,
    pub password: String,
    pub pre_encoded_basic: String,
}

/// Process-wide, immutable-after-load credential directory. Supports the four
/// lookups the handshake coordinator needs: by (username, password) pair (SOCKS5
/// RFC 1929), by username alone (SOCKS4 USERID), by pre-encoded Basic string
/// (HTTP fast path), and by id (admin surfacing).
pub struct AuthDirectory {
    by_id: Vec<AuthUser>,
    by_username: HashMap<String, usize>,
    by_pair: HashMap<(String, String), usize>,
    by_basic: HashMap<String, usize>,
}

impl AuthDirectory {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.auth_client_info)
    }

    pub fn new(entries: &[AuthClientEntry]) -> Self {
        let mut by_id = Vec::with_capacity(entries.len());
        let mut by_username = HashMap::new();
        let mut by_pair = HashMap::new();
        let mut by_basic = HashMap::new();

        for (idx, entry) in entries.iter().enumerate() {
            let pre_encoded_basic =
                BASE64.encode(format!("{}:{}", entry.user, entry.pwd).as_bytes());
            by_username.insert(entry.user.clone(), idx);
            by_pair.insert((entry.user.clone(), entry.pwd.clone()), idx);
            by_basic.insert(pre_encoded_basic.clone(), idx);
            by_id.push(AuthUser {
                id: idx as u64,
                username: entry.user.clone(),
                password: entry.pwd.clone(),
                pre_encoded_basic,
            });
        }

        Self {
            by_id,
            by_username,
            by_pair,
            by_basic,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn by_username_password(&self, username: &str, password: &str) -> Option<&AuthUser> {
        self.by_pair
            .get(&(username.to_string(), password.to_string()))
            .map(|&idx| &self.by_id[idx])
    }

    /// SOCKS4 USERID match: username alone, no password check.
    pub fn by_username(&self, username: &str) -> Option<&AuthUser> {
        self.by_username.get(username).map(|&idx| &self.by_id[idx])
    }

    /// HTTP fast path: match the raw `Basic <b64>` payload directly.
    pub fn by_pre_encoded_basic(&self, basic_payload: &str) -> Option<&AuthUser> {
        self.by_basic
            .get(basic_payload)
            .map(|&idx| &self.by_id[idx])
    }

    /// HTTP slow path: decode `user:pwd` then match the pair.
    pub fn by_basic_payload_decoded(&self, basic_payload: &str) -> Option<&AuthUser> {
        let decoded = BASE64.decode(basic_payload).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pwd) = decoded.split_once(':')?;
        self.by_username_password(user, pwd)
    }

    pub fn by_id(&self, id: u64) -> Option<&AuthUser> {
        self.by_id.get(id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> AuthDirectory {
        AuthDirectory::new(&[AuthClientEntry {
            user: "alice".to_string(),
            pwd: "secret123".to_string(),
        }])
    }

    #[test]
    fn test_lookup_by_pair() {
        let d = dir();
        assert!(d.by_username_password("alice", "secret123").is_some());
        assert!(d.by_username_password("alice", "wrong").is_none());
    }

    #[test]
    fn test_lookup_by_username_only() {
        let d = dir();
        assert_eq!(d.by_username("alice").unwrap().username, "alice");
    }

    #[test]
    fn test_lookup_by_pre_encoded_basic() {
        let d = dir();
        let basic = BASE64.encode(b"alice:secret123");
        assert!(d.by_pre_encoded_basic(&basic).is_some());
    }

    #[test]
    fn test_basic_roundtrip() {
        let d = dir();
        let user = d.by_username("alice").unwrap();
        let basic = &user.pre_encoded_basic;
        let decoded = BASE64.decode(basic).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "alice:secret123");
        assert!(d.by_basic_payload_decoded(basic).is_some());
    }
}
