use serde::{Deserialize, Serialize};

use super::UserRecord;

/// Authenticated identity. Only `id` is guaranteed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl User {
    /// Combine a server record with the previously known user.
    ///
    /// Fields present in `record` win; fields it omits keep their previous
    /// value. Returns `None` when neither side carries an id.
    pub fn merge(previous: Option<&User>, record: UserRecord) -> Option<User> {
        let id = record.id.or_else(|| previous.map(|p| p.id.clone()))?;
        Some(User {
            id,
            email: pick(record.email, previous.and_then(|p| p.email.as_ref())),
            first_name: pick(record.first_name, previous.and_then(|p| p.first_name.as_ref())),
            last_name: pick(record.last_name, previous.and_then(|p| p.last_name.as_ref())),
            role: pick(record.role, previous.and_then(|p| p.role.as_ref())),
            avatar_url: pick(record.avatar_url, previous.and_then(|p| p.avatar_url.as_ref())),
        })
    }

    /// Name for display, falling back to email and then id
    pub fn display_name(&self) -> String {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();

        if !parts.is_empty() {
            parts.join(" ")
        } else if let Some(ref email) = self.email {
            email.clone()
        } else {
            self.id.clone()
        }
    }
}

fn pick(new: Option<String>, old: Option<&String>) -> Option<String> {
    new.or_else(|| old.cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known_user() -> User {
        User {
            id: "u-1".into(),
            email: Some("old@example.com".into()),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            role: Some("admin".into()),
            avatar_url: None,
        }
    }

    #[test]
    fn test_merge_new_overrides_old() {
        let record = UserRecord {
            id: Some("u-1".into()),
            email: Some("new@example.com".into()),
            avatar_url: Some("https://cdn/a.png".into()),
            ..Default::default()
        };
        let merged = User::merge(Some(&known_user()), record).expect("merged");
        assert_eq!(merged.email.as_deref(), Some("new@example.com"));
        assert_eq!(merged.avatar_url.as_deref(), Some("https://cdn/a.png"));
        // Gaps filled from the previous record
        assert_eq!(merged.first_name.as_deref(), Some("Ada"));
        assert_eq!(merged.role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_merge_keeps_previous_id_when_omitted() {
        let merged = User::merge(Some(&known_user()), UserRecord::default()).expect("merged");
        assert_eq!(merged, known_user());
    }

    #[test]
    fn test_merge_without_any_id_fails() {
        let record = UserRecord {
            email: Some("who@example.com".into()),
            ..Default::default()
        };
        assert!(User::merge(None, record).is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(known_user().display_name(), "Ada Lovelace");

        let mut user = known_user();
        user.first_name = None;
        user.last_name = None;
        assert_eq!(user.display_name(), "old@example.com");

        user.email = None;
        assert_eq!(user.display_name(), "u-1");
    }
}
