// File: models/message.rs

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// A chat message in a project room.
///
/// Sender facts are copied at send time and never follow later profile changes.
/// `content` is `None` once the message is deleted for everyone; the record
/// itself is kept so every client can render a placeholder in its place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_image_url: Option<String>,
    #[serde(default)]
    pub is_creator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted_for_everyone: bool,
    /// Users who hid this message for themselves. Only ever grows.
    #[serde(default)]
    pub deleted_for: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteScope {
    ForMe,
    ForEveryone,
}

/// How a message presents to one particular viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    /// Viewer hid it; not rendered at all.
    MaskedForViewer,
    /// Deleted for everyone; rendered as a placeholder.
    MaskedForAll,
}

/// Denormalized facts about the sender, resolved when the message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub user_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub is_creator: bool,
}

impl Message {
    pub fn new(
        id: String,
        project_id: &str,
        sender: &SenderProfile,
        content: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Message {
            id,
            project_id: project_id.to_string(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.name.clone(),
            sender_image_url: sender.image_url.clone(),
            is_creator: sender.is_creator,
            content: Some(content),
            created_at,
            is_edited: false,
            is_deleted_for_everyone: false,
            deleted_for: BTreeSet::new(),
        }
    }

    /// Canonical room order: `created_at`, then `id`.
    pub fn order(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn cursor(&self) -> HistoryCursor {
        HistoryCursor {
            created_at: self.created_at,
            id: self.id.clone(),
        }
    }

    pub fn is_hidden_for(&self, user_id: &str) -> bool {
        self.deleted_for.contains(user_id)
    }

    pub fn visibility(&self, viewer_id: &str) -> Visibility {
        if self.is_hidden_for(viewer_id) {
            Visibility::MaskedForViewer
        } else if self.is_deleted_for_everyone {
            Visibility::MaskedForAll
        } else {
            Visibility::Visible
        }
    }

    /// The copy handed to `viewer_id` by history reads. Other users' hides
    /// are not disclosed, and a message the viewer hid keeps its place but
    /// loses its content.
    pub fn for_viewer(mut self, viewer_id: &str) -> Message {
        let hidden = self.deleted_for.remove(viewer_id);
        self.deleted_for.clear();
        if hidden {
            self.content = None;
            self.deleted_for.insert(viewer_id.to_string());
        }
        self
    }

    /// Adds `user_id` to `deleted_for`. Returns false when it was already there.
    pub fn hide_for(&mut self, user_id: &str) -> bool {
        self.deleted_for.insert(user_id.to_string())
    }

    /// Sets the global mask and drops the content. Returns false when already masked.
    pub fn mask_for_everyone(&mut self) -> bool {
        self.content = None;
        if self.is_deleted_for_everyone {
            return false;
        }
        self.is_deleted_for_everyone = true;
        true
    }

    pub fn apply_delete(&mut self, scope: DeleteScope, acting_user_id: &str) -> bool {
        match scope {
            DeleteScope::ForMe => self.hide_for(acting_user_id),
            DeleteScope::ForEveryone => self.mask_for_everyone(),
        }
    }

    /// Folds the one-way masks of another copy of the same message into this one.
    /// Arrival order of copies does not matter.
    pub fn absorb(&mut self, other: &Message) -> bool {
        let mut changed = false;
        for user in &other.deleted_for {
            changed |= self.hide_for(user);
        }
        if other.is_deleted_for_everyone {
            changed |= self.mask_for_everyone();
        }
        changed
    }
}

/// Keyset position in a room's history. Pages are anchored on a message,
/// never on an offset, so concurrent appends cannot shift a page boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl HistoryCursor {
    /// True when a message with this key sorts strictly before the cursor.
    pub fn admits(&self, created_at: &DateTime<Utc>, id: &str) -> bool {
        (created_at, id) < (&self.created_at, self.id.as_str())
    }
}

impl fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.created_at.timestamp_millis(), self.id)
    }
}

impl FromStr for HistoryCursor {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChatError::Validation(format!("invalid history cursor: {}", s));
        let (millis, id) = s.split_once('_').ok_or_else(invalid)?;
        let millis: i64 = millis.parse().map_err(|_| invalid())?;
        if id.is_empty() {
            return Err(invalid());
        }
        let created_at = Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid)?;
        Ok(HistoryCursor {
            created_at,
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(id: &str) -> SenderProfile {
        SenderProfile {
            user_id: id.to_string(),
            name: format!("user {}", id),
            image_url: None,
            is_creator: false,
        }
    }

    fn message(id: &str, millis: i64) -> Message {
        let at = Utc.timestamp_millis_opt(millis).unwrap();
        Message::new(id.to_string(), "p1", &sender("x"), "hello".to_string(), at)
    }

    #[test]
    fn test_visibility_per_viewer() {
        let mut msg = message("m1", 1_000);
        assert_eq!(msg.visibility("y"), Visibility::Visible);

        msg.hide_for("y");
        assert_eq!(msg.visibility("y"), Visibility::MaskedForViewer);
        assert_eq!(msg.visibility("z"), Visibility::Visible);

        msg.mask_for_everyone();
        assert_eq!(msg.visibility("z"), Visibility::MaskedForAll);
        assert_eq!(msg.visibility("x"), Visibility::MaskedForAll);
        // Own hide still wins over the placeholder.
        assert_eq!(msg.visibility("y"), Visibility::MaskedForViewer);
    }

    #[test]
    fn test_viewer_copy_discloses_only_the_viewers_hide() {
        let mut m = message("m1", 0);
        m.hide_for("y");
        m.hide_for("z");

        let for_y = m.clone().for_viewer("y");
        assert_eq!(for_y.content, None);
        assert_eq!(for_y.visibility("y"), Visibility::MaskedForViewer);
        assert_eq!(for_y.deleted_for.len(), 1);

        let for_x = m.for_viewer("x");
        assert!(for_x.content.is_some());
        assert!(for_x.deleted_for.is_empty());
        assert_eq!(for_x.visibility("x"), Visibility::Visible);
    }

    #[test]
    fn test_global_mask_drops_content_and_is_one_way() {
        let mut msg = message("m1", 1_000);
        assert!(msg.mask_for_everyone());
        assert!(msg.content.is_none());
        assert!(!msg.mask_for_everyone());
        assert!(msg.is_deleted_for_everyone);
        // The sender is not added to deleted_for.
        assert!(msg.deleted_for.is_empty());
    }

    #[test]
    fn test_absorb_is_order_independent() {
        let base = message("m1", 1_000);

        let mut a = base.clone();
        a.hide_for("y");
        let mut b = base.clone();
        b.hide_for("z");
        b.mask_for_everyone();

        let mut left = base.clone();
        left.absorb(&a);
        left.absorb(&b);
        let mut right = base.clone();
        right.absorb(&b);
        right.absorb(&a);
        right.absorb(&a);

        assert_eq!(left, right);
        assert_eq!(left.deleted_for.len(), 2);
        assert!(left.is_deleted_for_everyone);
    }

    #[test]
    fn test_order_tie_breaks_on_id() {
        let a = message("a", 1_000);
        let b = message("b", 1_000);
        let c = message("a", 999);
        assert_eq!(a.order(&b), Ordering::Less);
        assert_eq!(c.order(&a), Ordering::Less);
    }

    #[test]
    fn test_cursor_text_form() {
        let msg = message("5f1c", 1_700_000_000_123);
        let cursor = msg.cursor();
        let text = cursor.to_string();
        assert_eq!(text, "1700000000123_5f1c");
        assert_eq!(text.parse::<HistoryCursor>().unwrap(), cursor);

        assert!("garbage".parse::<HistoryCursor>().is_err());
        assert!("12_".parse::<HistoryCursor>().is_err());
        assert!("abc_m1".parse::<HistoryCursor>().is_err());
    }

    #[test]
    fn test_wire_shape() {
        let mut msg = message("m1", 1_000);
        msg.mask_for_everyone();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["isDeletedForEveryone"], true);
        assert!(json.get("content").is_none());
        assert_eq!(
            serde_json::to_string(&DeleteScope::ForEveryone).unwrap(),
            "\"FOR_EVERYONE\""
        );
    }
}
