//! Task service and its store interface.
//!
//! Actions:
//! - `create {title, due_date?}` -> `{task_id}`
//! - `list {include_done?}` -> `[task]`
//! - `get {task_id}` -> `task | null`
//! - `update {task_id, title?, status?, due_date?}` -> `bool`
//! - `delete {task_id}` -> `bool`
//! - `upcoming {days?, limit?}` -> `[task]`
//!
//! Dates are `YYYY-MM-DD` strings; lexical order is date order.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::params::{self, Params};
use crate::error::ServiceError;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Done,
}

impl TaskStatus {
    fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "todo" => Ok(Self::Todo),
            "done" => Ok(Self::Done),
            _ => Err(ServiceError::invalid("status", "\"todo\" or \"done\"")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub status: TaskStatus,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Field changes for [`TaskStore::update`]. `due_date: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub due_date: Option<Option<String>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.status.is_none() && self.due_date.is_none()
    }
}

/// Backing store for tasks. Errors are surfaced as `service.error`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, title: &str, due_date: Option<&str>) -> anyhow::Result<i64>;
    async fn list(&self, include_done: bool) -> anyhow::Result<Vec<Task>>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Task>>;
    async fn update(&self, id: i64, update: TaskUpdate) -> anyhow::Result<bool>;
    async fn delete(&self, id: i64) -> anyhow::Result<bool>;
    /// Open tasks due on or before `cutoff`, plus undated ones.
    async fn upcoming(&self, cutoff: &str, limit: usize) -> anyhow::Result<Vec<Task>>;
}

/// In-process store. Ids are never reused.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    tasks: BTreeMap<i64, Task>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Dated tasks first by date, then undated, ties by id.
fn sort_key(task: &Task) -> (bool, Option<String>, i64) {
    (task.due_date.is_none(), task.due_date.clone(), task.id)
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(sort_key);
    tasks
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, title: &str, due_date: Option<&str>) -> anyhow::Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let stamp = now();
        inner.tasks.insert(
            id,
            Task {
                id,
                title: title.to_string(),
                status: TaskStatus::Todo,
                due_date: due_date.map(str::to_string),
                created_at: stamp.clone(),
                updated_at: stamp,
            },
        );
        Ok(id)
    }

    async fn list(&self, include_done: bool) -> anyhow::Result<Vec<Task>> {
        let inner = self.inner.lock();
        let tasks = inner
            .tasks
            .values()
            .filter(|t| include_done || t.status == TaskStatus::Todo)
            .cloned()
            .collect();
        Ok(sorted(tasks))
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Task>> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn update(&self, id: i64, update: TaskUpdate) -> anyhow::Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(due_date) = update.due_date {
            task.due_date = due_date;
        }
        task.updated_at = now();
        Ok(true)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        Ok(self.inner.lock().tasks.remove(&id).is_some())
    }

    async fn upcoming(&self, cutoff: &str, limit: usize) -> anyhow::Result<Vec<Task>> {
        let inner = self.inner.lock();
        let tasks = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Todo)
            .filter(|t| t.due_date.as_deref().map_or(true, |d| d <= cutoff))
            .cloned()
            .collect();
        let mut tasks = sorted(tasks);
        tasks.truncate(limit);
        Ok(tasks)
    }
}

fn validate_date(param: &str, value: &str) -> Result<(), ServiceError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map(|_| ())
        .map_err(|_| ServiceError::invalid(param, "a date formatted YYYY-MM-DD"))
}

fn store_err(err: anyhow::Error) -> ServiceError {
    ServiceError::Store(format!("{:#}", err))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::Store(e.to_string()))
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub const NAME: &'static str = "tasks";

    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, ServiceError> {
        let params = params::as_object(params)?;
        match action {
            "create" => self.create(&params).await,
            "list" => {
                let include_done = params::optional_bool(&params, "include_done")?.unwrap_or(false);
                to_value(self.store.list(include_done).await.map_err(store_err)?)
            }
            "get" => {
                let id = params::require_i64(&params, "task_id")?;
                to_value(self.store.get(id).await.map_err(store_err)?)
            }
            "update" => self.update(&params).await,
            "delete" => {
                let id = params::require_i64(&params, "task_id")?;
                to_value(self.store.delete(id).await.map_err(store_err)?)
            }
            "upcoming" => {
                let days = params::window_days(&params, "days", 7)?;
                let limit = params::optional_u64(&params, "limit")?.unwrap_or(10);
                let cutoff = (Local::now().date_naive() + chrono::Duration::days(days))
                    .format(DATE_FORMAT)
                    .to_string();
                let limit = usize::try_from(limit).unwrap_or(usize::MAX);
                to_value(self.store.upcoming(&cutoff, limit).await.map_err(store_err)?)
            }
            other => Err(ServiceError::UnknownAction {
                service: Self::NAME.to_string(),
                action: other.to_string(),
            }),
        }
    }

    async fn create(&self, params: &Params) -> Result<Value, ServiceError> {
        let title = params::require_str(params, "title")?;
        if title.trim().is_empty() {
            return Err(ServiceError::invalid("title", "non-empty"));
        }
        let due_date = params::optional_str(params, "due_date")?;
        if let Some(date) = due_date {
            validate_date("due_date", date)?;
        }
        let id = self.store.create(title, due_date).await.map_err(store_err)?;
        Ok(json!({ "task_id": id }))
    }

    async fn update(&self, params: &Params) -> Result<Value, ServiceError> {
        let id = params::require_i64(params, "task_id")?;
        let mut update = TaskUpdate {
            title: params::optional_str(params, "title")?.map(str::to_string),
            status: params::optional_str(params, "status")?
                .map(TaskStatus::parse)
                .transpose()?,
            due_date: None,
        };
        if let Some(value) = params.get("due_date") {
            update.due_date = match value {
                Value::Null => Some(None),
                Value::String(date) => {
                    validate_date("due_date", date)?;
                    Some(Some(date.clone()))
                }
                _ => return Err(ServiceError::invalid("due_date", "a string or null")),
            };
        }
        to_value(self.store.update(id, update).await.map_err(store_err)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TaskService {
        TaskService::new(Arc::new(MemoryTaskStore::new()))
    }

    async fn create(svc: &TaskService, params: Value) -> i64 {
        let result = svc.call("create", params).await.unwrap();
        result["task_id"].as_i64().unwrap()
    }

    fn days_from_today(days: i64) -> String {
        (Local::now().date_naive() + chrono::Duration::days(days))
            .format(DATE_FORMAT)
            .to_string()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let svc = service();
        let id = create(&svc, json!({"title": "test task"})).await;
        assert_eq!(id, 1);

        let list = svc.call("list", Value::Null).await.unwrap();
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["title"], "test task");
        assert_eq!(list[0]["status"], "todo");
        assert_eq!(list[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_get_update_delete() {
        let svc = service();
        let id = create(&svc, json!({"title": "Buy milk", "due_date": "2030-01-02"})).await;

        let task = svc.call("get", json!({"task_id": id})).await.unwrap();
        assert_eq!(task["due_date"], "2030-01-02");

        let updated = svc
            .call("update", json!({"task_id": id, "status": "done", "due_date": null}))
            .await
            .unwrap();
        assert_eq!(updated, json!(true));

        let task = svc.call("get", json!({"task_id": id})).await.unwrap();
        assert_eq!(task["status"], "done");
        assert!(task["due_date"].is_null());

        // Done tasks are hidden unless asked for.
        let open = svc.call("list", json!({})).await.unwrap();
        assert!(open.as_array().unwrap().is_empty());
        let all = svc.call("list", json!({"include_done": true})).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 1);

        assert_eq!(svc.call("delete", json!({"task_id": id})).await.unwrap(), json!(true));
        assert_eq!(svc.call("delete", json!({"task_id": id})).await.unwrap(), json!(false));
        assert!(svc.call("get", json!({"task_id": id})).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn test_update_without_fields_is_noop() {
        let svc = service();
        let id = create(&svc, json!({"title": "x"})).await;
        let result = svc.call("update", json!({"task_id": id})).await.unwrap();
        assert_eq!(result, json!(false));
        let result = svc
            .call("update", json!({"task_id": 999, "title": "y"}))
            .await
            .unwrap();
        assert_eq!(result, json!(false));
    }

    #[tokio::test]
    async fn test_ids_not_reused() {
        let svc = service();
        let first = create(&svc, json!({"title": "a"})).await;
        svc.call("delete", json!({"task_id": first})).await.unwrap();
        let second = create(&svc, json!({"title": "b"})).await;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_upcoming_window_and_order() {
        let svc = service();
        create(&svc, json!({"title": "undated"})).await;
        create(&svc, json!({"title": "later", "due_date": days_from_today(30)})).await;
        create(&svc, json!({"title": "soon", "due_date": days_from_today(2)})).await;
        create(&svc, json!({"title": "overdue", "due_date": days_from_today(-1)})).await;
        let done = create(&svc, json!({"title": "done", "due_date": days_from_today(1)})).await;
        svc.call("update", json!({"task_id": done, "status": "done"}))
            .await
            .unwrap();

        let upcoming = svc.call("upcoming", json!({})).await.unwrap();
        let titles: Vec<_> = upcoming
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["title"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(titles, ["overdue", "soon", "undated"]);

        let limited = svc.call("upcoming", json!({"days": 60, "limit": 2})).await.unwrap();
        assert_eq!(limited.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upcoming_with_huge_window_keeps_dated_tasks() {
        let svc = service();
        create(&svc, json!({"title": "undated"})).await;
        create(&svc, json!({"title": "far", "due_date": "2100-06-01"})).await;

        let upcoming = svc
            .call("upcoming", json!({"days": 1_000_000_000_000u64}))
            .await
            .unwrap();
        let titles: Vec<_> = upcoming
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["title"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(titles, ["far", "undated"]);
    }

    #[tokio::test]
    async fn test_param_errors() {
        let svc = service();
        let err = svc.call("create", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("'title'"));

        let err = svc
            .call("create", json!({"title": "x", "due_date": "next tuesday"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("due_date"));

        let err = svc
            .call("update", json!({"task_id": 1, "status": "blocked"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status"));

        let err = svc.call("get", json!({"task_id": "1"})).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let err = service().call("archive", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown tasks action: archive");
    }
}
