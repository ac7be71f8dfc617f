//! Task service client contract and payload types.
//!
//! The poller only ever lists tasks. Creating and updating tasks is done by the
//! index when a note is pushed. The HTTP implementation lives in vk-daemon.

use crate::status::TaskStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Service reported an error: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A task as listed by the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, alias = "executionInProgress")]
    pub has_in_progress_attempt: bool,
    #[serde(default)]
    pub executor: Option<String>,
}

impl TaskSummary {
    /// Placeholder reported when a task disappears from its project listing.
    pub fn deleted(id: &str, project_id: &str) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            status: TaskStatus::Deleted,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub project_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateTask {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Response envelope used by every service endpoint.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> Result<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(ClientError::Service(
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            )),
        }
    }
}

/// What the poller needs from the service.
#[async_trait]
pub trait TaskClient: Send + Sync {
    /// List every task in a project.
    async fn list_tasks(&self, service_url: &str, project_id: &str) -> Result<Vec<TaskSummary>>;
}

/// Task operations used when pushing notes to the service.
#[async_trait]
pub trait TaskApi: TaskClient {
    async fn get_project(&self, service_url: &str, project_id: &str) -> Result<Project>;

    async fn create_task(&self, service_url: &str, task: &CreateTask) -> Result<TaskSummary>;

    async fn update_task(
        &self,
        service_url: &str,
        task_id: &str,
        update: &UpdateTask,
    ) -> Result<TaskSummary>;
}

#[async_trait]
impl<T: TaskClient + ?Sized> TaskClient for std::sync::Arc<T> {
    async fn list_tasks(&self, service_url: &str, project_id: &str) -> Result<Vec<TaskSummary>> {
        (**self).list_tasks(service_url, project_id).await
    }
}

#[async_trait]
impl<T: TaskApi + ?Sized> TaskApi for std::sync::Arc<T> {
    async fn get_project(&self, service_url: &str, project_id: &str) -> Result<Project> {
        (**self).get_project(service_url, project_id).await
    }

    async fn create_task(&self, service_url: &str, task: &CreateTask) -> Result<TaskSummary> {
        (**self).create_task(service_url, task).await
    }

    async fn update_task(
        &self,
        service_url: &str,
        task_id: &str,
        update: &UpdateTask,
    ) -> Result<TaskSummary> {
        (**self).update_task(service_url, task_id, update).await
    }
}
