// src/directory.rs
//
// Project membership and sender profiles. Owned by the project domain; the chat
// only reads it.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use log::debug;
use mongodb::bson::{doc, Document};
use mongodb::Collection;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::chat_db::MongoDB;
use crate::error::Result;
use crate::models::SenderProfile;

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn is_member(&self, user_id: &str, project_id: &str) -> Result<bool>;

    /// Sender facts as they are right now, to be frozen into a new message.
    async fn sender_profile(&self, user_id: &str, project_id: &str) -> Result<SenderProfile>;
}

#[derive(Debug, Deserialize)]
struct UserDocument {
    user_id: String,
    username: Option<String>,
    email: Option<String>,
    #[serde(default)]
    profile_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectDocument {
    created_by: String,
}

pub struct MongoDirectory {
    users: Collection<UserDocument>,
    projects: Collection<ProjectDocument>,
    memberships: Collection<Document>,
}

impl MongoDirectory {
    pub fn new(mongodb: &MongoDB) -> Self {
        MongoDirectory {
            users: mongodb.db.collection("users"),
            projects: mongodb.db.collection("projects"),
            memberships: mongodb.db.collection("project_memberships"),
        }
    }
}

#[async_trait]
impl ProjectDirectory for MongoDirectory {
    async fn is_member(&self, user_id: &str, project_id: &str) -> Result<bool> {
        let found = self
            .memberships
            .find_one(doc! { "project_id": project_id, "user_id": user_id })
            .await?;
        Ok(found.is_some())
    }

    async fn sender_profile(&self, user_id: &str, project_id: &str) -> Result<SenderProfile> {
        let user = self.users.find_one(doc! { "user_id": user_id }).await?;
        let project = self
            .projects
            .find_one(doc! { "project_id": project_id })
            .await?;

        let (name, image_url) = match user {
            Some(u) => (
                u.username.or(u.email).unwrap_or_else(|| u.user_id.clone()),
                u.profile_image,
            ),
            None => {
                debug!("No user record for {}, using id as display name", user_id);
                (user_id.to_string(), None)
            }
        };
        Ok(SenderProfile {
            user_id: user_id.to_string(),
            name,
            image_url,
            is_creator: project.map_or(false, |p| p.created_by == user_id),
        })
    }
}

#[derive(Default)]
struct Roster {
    members: HashMap<String, HashSet<String>>,
    creators: HashMap<String, String>,
    profiles: HashMap<String, (String, Option<String>)>,
}

/// Directory kept in process memory. `open()` admits every authenticated user
/// to every project and is meant for local development only.
pub struct InMemoryDirectory {
    open: bool,
    roster: RwLock<Roster>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        InMemoryDirectory {
            open: false,
            roster: RwLock::new(Roster::default()),
        }
    }

    pub fn open() -> Self {
        InMemoryDirectory {
            open: true,
            roster: RwLock::new(Roster::default()),
        }
    }

    pub async fn add_member(&self, project_id: &str, user_id: &str) {
        let mut roster = self.roster.write().await;
        roster
            .members
            .entry(project_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub async fn set_creator(&self, project_id: &str, user_id: &str) {
        self.add_member(project_id, user_id).await;
        let mut roster = self.roster.write().await;
        roster
            .creators
            .insert(project_id.to_string(), user_id.to_string());
    }

    pub async fn set_profile(&self, user_id: &str, name: &str, image_url: Option<&str>) {
        let mut roster = self.roster.write().await;
        roster.profiles.insert(
            user_id.to_string(),
            (name.to_string(), image_url.map(str::to_string)),
        );
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProjectDirectory for InMemoryDirectory {
    async fn is_member(&self, user_id: &str, project_id: &str) -> Result<bool> {
        if self.open {
            return Ok(true);
        }
        let roster = self.roster.read().await;
        Ok(roster
            .members
            .get(project_id)
            .map_or(false, |members| members.contains(user_id)))
    }

    async fn sender_profile(&self, user_id: &str, project_id: &str) -> Result<SenderProfile> {
        let roster = self.roster.read().await;
        let (name, image_url) = roster
            .profiles
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| (user_id.to_string(), None));
        Ok(SenderProfile {
            user_id: user_id.to_string(),
            name,
            image_url,
            is_creator: roster.creators.get(project_id).map_or(false, |c| c == user_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_is_per_project() {
        let directory = InMemoryDirectory::new();
        directory.add_member("p1", "x").await;
        assert!(directory.is_member("x", "p1").await.unwrap());
        assert!(!directory.is_member("x", "p2").await.unwrap());
        assert!(!directory.is_member("y", "p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_directory_admits_everyone() {
        let directory = InMemoryDirectory::open();
        assert!(directory.is_member("anyone", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_sender_profile_facts() {
        let directory = InMemoryDirectory::new();
        directory.set_creator("p1", "x").await;
        directory
            .set_profile("x", "Xavier", Some("https://img.example/x.png"))
            .await;

        let x = directory.sender_profile("x", "p1").await.unwrap();
        assert_eq!(x.name, "Xavier");
        assert!(x.is_creator);
        assert_eq!(x.image_url.as_deref(), Some("https://img.example/x.png"));

        let y = directory.sender_profile("y", "p1").await.unwrap();
        assert_eq!(y.name, "y");
        assert!(!y.is_creator);
        assert!(!directory.sender_profile("x", "p2").await.unwrap().is_creator);
    }
}
