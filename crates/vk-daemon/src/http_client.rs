//! HTTP client for the task service.
//!
//! Every endpoint answers with a `{success, data, message}` envelope; non-2xx
//! responses and unsuccessful envelopes both surface as [`ClientError`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use vk_core::client::{
    ApiResponse, ClientError, CreateTask, Project, Result, TaskApi, TaskClient, TaskSummary,
    UpdateTask,
};

/// [`TaskClient`] and [`TaskApi`] over reqwest.
#[derive(Clone)]
pub struct HttpTaskClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTaskClient {
    /// Build a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vk-daemon/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn endpoint(service_url: &str, path: &str) -> String {
        format!("{}/api/{}", service_url.trim_end_matches('/'), path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.timeout)
        } else {
            ClientError::Transport(e.to_string())
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.map_send_error(e))?;
        let envelope: ApiResponse<T> =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?;
        envelope.into_result()
    }
}

#[async_trait]
impl TaskClient for HttpTaskClient {
    async fn list_tasks(&self, service_url: &str, project_id: &str) -> Result<Vec<TaskSummary>> {
        let url = Self::endpoint(service_url, "tasks");
        debug!("GET {} (project {})", url, project_id);
        let mut tasks: Vec<TaskSummary> = self
            .send(self.client.get(&url).query(&[("project_id", project_id)]))
            .await?;

        // Some listings omit the project id on each task
        for task in &mut tasks {
            if task.project_id.is_empty() {
                task.project_id = project_id.to_string();
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskApi for HttpTaskClient {
    async fn get_project(&self, service_url: &str, project_id: &str) -> Result<Project> {
        let url = Self::endpoint(service_url, &format!("projects/{}", project_id));
        self.send(self.client.get(&url)).await
    }

    async fn create_task(&self, service_url: &str, task: &CreateTask) -> Result<TaskSummary> {
        let url = Self::endpoint(service_url, "tasks");
        debug!("POST {} ({})", url, task.title);
        self.send(self.client.post(&url).json(task)).await
    }

    async fn update_task(
        &self,
        service_url: &str,
        task_id: &str,
        update: &UpdateTask,
    ) -> Result<TaskSummary> {
        let url = Self::endpoint(service_url, &format!("tasks/{}", task_id));
        debug!("PUT {}", url);
        self.send(self.client.put(&url).json(update)).await
    }
}
