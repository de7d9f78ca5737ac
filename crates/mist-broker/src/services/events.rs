//! Calendar event service and its store interface.
//!
//! Actions:
//! - `create {title, start_time, end_time?, location?, notes?, frequency?, interval?, end_date?}`
//!   -> `{event_id}`
//! - `list` -> `[event]`
//! - `get {event_id}` -> `event | null`
//! - `update {event_id, title?, start_time?, end_time?, location?, notes?}` -> `bool`
//! - `delete {event_id}` -> `bool`
//! - `upcoming {days?, limit?}` -> `[occurrence]`
//!
//! Times are local, formatted `YYYY-MM-DDTHH:MM[:SS]`; a bare date means
//! midnight, except for a recurrence `end_date` where it covers the whole
//! day. Recurring events yield one occurrence per repetition in the window.

use async_trait::async_trait;
use chrono::{Local, Months, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::params::{self, Params};
use crate::error::ServiceError;

const TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Upper bound on repetitions walked per event and window.
const MAX_EXPANSION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(ServiceError::invalid(
                "frequency",
                "one of daily, weekly, monthly, yearly",
            )),
        }
    }

    /// Length of one step in whole days, for frequencies that have one.
    fn fixed_days(self) -> Option<i64> {
        match self {
            Self::Daily => Some(1),
            Self::Weekly => Some(7),
            Self::Monthly | Self::Yearly => None,
        }
    }

    /// `interval` steps after `t`. Month arithmetic clamps to the last day
    /// of shorter months.
    fn advance(self, t: NaiveDateTime, interval: u32) -> Option<NaiveDateTime> {
        match self.fixed_days() {
            Some(days) => t.checked_add_signed(chrono::Duration::try_days(days * i64::from(interval))?),
            None => {
                let months = match self {
                    Self::Yearly => interval.checked_mul(12)?,
                    _ => interval,
                };
                t.checked_add_months(Months::new(months))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub interval: u32,
    /// Last moment a repetition may start.
    pub end_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub recurrence: Option<Recurrence>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub recurrence: Option<Recurrence>,
}

/// Field changes for [`EventStore::update`]. `Some(None)` clears a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<Option<NaiveDateTime>>,
    pub location: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

impl EventUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.location.is_none()
            && self.notes.is_none()
    }
}

/// One concrete start of an event inside an `upcoming` window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Occurrence {
    pub id: i64,
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub frequency: Option<Frequency>,
}

/// Backing store for events. Errors are surfaced as `service.error`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create(&self, event: NewEvent) -> anyhow::Result<i64>;
    /// Every event, ordered by start time then id.
    async fn list(&self) -> anyhow::Result<Vec<Event>>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Event>>;
    async fn update(&self, id: i64, update: EventUpdate) -> anyhow::Result<bool>;
    async fn delete(&self, id: i64) -> anyhow::Result<bool>;
}

/// In-process store. Ids are never reused.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    events: BTreeMap<i64, Event>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create(&self, event: NewEvent) -> anyhow::Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let stamp = now();
        inner.events.insert(
            id,
            Event {
                id,
                title: event.title,
                start_time: event.start_time,
                end_time: event.end_time,
                location: event.location,
                notes: event.notes,
                recurrence: event.recurrence,
                created_at: stamp.clone(),
                updated_at: stamp,
            },
        );
        Ok(id)
    }

    async fn list(&self) -> anyhow::Result<Vec<Event>> {
        let mut events: Vec<Event> = self.inner.lock().events.values().cloned().collect();
        events.sort_by_key(|e| (e.start_time, e.id));
        Ok(events)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Event>> {
        Ok(self.inner.lock().events.get(&id).cloned())
    }

    async fn update(&self, id: i64, update: EventUpdate) -> anyhow::Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(title) = update.title {
            event.title = title;
        }
        if let Some(start_time) = update.start_time {
            event.start_time = start_time;
        }
        if let Some(end_time) = update.end_time {
            event.end_time = end_time;
        }
        if let Some(location) = update.location {
            event.location = location;
        }
        if let Some(notes) = update.notes {
            event.notes = notes;
        }
        event.updated_at = now();
        Ok(true)
    }

    async fn delete(&self, id: i64) -> anyhow::Result<bool> {
        Ok(self.inner.lock().events.remove(&id).is_some())
    }
}

/// Latest repetition at or before `from`, skipping whole steps at once for
/// fixed-length frequencies so old daily events still reach the window.
fn fast_forward(rule: &Recurrence, start: NaiveDateTime, from: NaiveDateTime) -> NaiveDateTime {
    let Some(step) = rule.frequency.fixed_days().map(|d| d * i64::from(rule.interval)) else {
        return start;
    };
    if step <= 0 {
        return start;
    }
    let behind = (from - start).num_days() / step;
    if behind <= 0 {
        return start;
    }
    chrono::Duration::try_days(behind * step)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(start)
}

/// Starts of `event` inside `[from, to]`, in order.
pub fn occurrences(event: &Event, from: NaiveDateTime, to: NaiveDateTime) -> Vec<Occurrence> {
    let duration = event.end_time.map(|end| end - event.start_time);
    let at = |start: NaiveDateTime| Occurrence {
        id: event.id,
        title: event.title.clone(),
        start_time: start,
        end_time: duration.and_then(|d| start.checked_add_signed(d)),
        location: event.location.clone(),
        notes: event.notes.clone(),
        frequency: event.recurrence.as_ref().map(|r| r.frequency),
    };

    let Some(rule) = &event.recurrence else {
        return if (from..=to).contains(&event.start_time) {
            vec![at(event.start_time)]
        } else {
            Vec::new()
        };
    };

    let mut out = Vec::new();
    let mut current = fast_forward(rule, event.start_time, from);
    for _ in 0..MAX_EXPANSION {
        if current > to || rule.end_date.is_some_and(|end| current > end) {
            break;
        }
        if current >= from {
            out.push(at(current));
        }
        match rule.frequency.advance(current, rule.interval) {
            Some(next) => current = next,
            None => break,
        }
    }
    out
}

fn parse_time(param: &str, value: &str) -> Result<NaiveDateTime, ServiceError> {
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| ServiceError::invalid(param, "a time formatted YYYY-MM-DDTHH:MM"))
}

/// A bare date as a recurrence end covers that whole day.
fn parse_end_date(value: &str) -> Result<NaiveDateTime, ServiceError> {
    match NaiveDate::parse_from_str(value, DATE_FORMAT) {
        Ok(date) => date
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| ServiceError::invalid("end_date", "a valid date")),
        Err(_) => parse_time("end_date", value),
    }
}

fn optional_time(params: &Params, name: &str) -> Result<Option<NaiveDateTime>, ServiceError> {
    params::optional_str(params, name)?
        .map(|v| parse_time(name, v))
        .transpose()
}

/// `Some(None)` for an explicit `null`, `None` when the key is absent.
fn nullable_str(params: &Params, name: &str) -> Result<Option<Option<String>>, ServiceError> {
    match params.get(name) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(ServiceError::invalid(name, "a string or null")),
    }
}

fn check_order(start: NaiveDateTime, end: Option<NaiveDateTime>) -> Result<(), ServiceError> {
    match end {
        Some(end) if end < start => Err(ServiceError::invalid("end_time", "at or after start_time")),
        _ => Ok(()),
    }
}

fn store_err(err: anyhow::Error) -> ServiceError {
    ServiceError::Store(format!("{:#}", err))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ServiceError> {
    serde_json::to_value(value).map_err(|e| ServiceError::Store(e.to_string()))
}

pub struct EventService {
    store: Arc<dyn EventStore>,
}

impl EventService {
    pub const NAME: &'static str = "events";

    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn call(&self, action: &str, params: Value) -> Result<Value, ServiceError> {
        let params = params::as_object(params)?;
        match action {
            "create" => self.create(&params).await,
            "list" => to_value(self.store.list().await.map_err(store_err)?),
            "get" => {
                let id = params::require_i64(&params, "event_id")?;
                to_value(self.store.get(id).await.map_err(store_err)?)
            }
            "update" => self.update(&params).await,
            "delete" => {
                let id = params::require_i64(&params, "event_id")?;
                to_value(self.store.delete(id).await.map_err(store_err)?)
            }
            "upcoming" => {
                let days = params::window_days(&params, "days", 7)?;
                let limit = params::optional_u64(&params, "limit")?.unwrap_or(10);
                let from = Local::now().naive_local();
                let to = from + chrono::Duration::days(days);
                to_value(self.upcoming(from, to, limit).await?)
            }
            other => Err(ServiceError::UnknownAction {
                service: Self::NAME.to_string(),
                action: other.to_string(),
            }),
        }
    }

    async fn upcoming(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
        limit: u64,
    ) -> Result<Vec<Occurrence>, ServiceError> {
        let events = self.store.list().await.map_err(store_err)?;
        let mut found: Vec<Occurrence> = events
            .iter()
            .flat_map(|e| occurrences(e, from, to))
            .collect();
        found.sort_by_key(|o| (o.start_time, o.id));
        found.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(found)
    }

    async fn create(&self, params: &Params) -> Result<Value, ServiceError> {
        let title = params::require_str(params, "title")?;
        if title.trim().is_empty() {
            return Err(ServiceError::invalid("title", "non-empty"));
        }
        let start_time = parse_time("start_time", params::require_str(params, "start_time")?)?;
        let end_time = optional_time(params, "end_time")?;
        check_order(start_time, end_time)?;

        let recurrence = match params::optional_str(params, "frequency")? {
            Some(frequency) => {
                let interval = params::optional_u64(params, "interval")?.unwrap_or(1);
                let interval = u32::try_from(interval)
                    .ok()
                    .filter(|i| *i > 0)
                    .ok_or_else(|| ServiceError::invalid("interval", "a positive integer"))?;
                Some(Recurrence {
                    frequency: Frequency::parse(frequency)?,
                    interval,
                    end_date: params::optional_str(params, "end_date")?
                        .map(parse_end_date)
                        .transpose()?,
                })
            }
            None => None,
        };

        let event = NewEvent {
            title: title.to_string(),
            start_time,
            end_time,
            location: params::optional_str(params, "location")?.map(str::to_string),
            notes: params::optional_str(params, "notes")?.map(str::to_string),
            recurrence,
        };
        let id = self.store.create(event).await.map_err(store_err)?;
        Ok(json!({ "event_id": id }))
    }

    async fn update(&self, params: &Params) -> Result<Value, ServiceError> {
        let id = params::require_i64(params, "event_id")?;
        let end_time = match params.get("end_time") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(parse_time("end_time", s)?)),
            Some(_) => return Err(ServiceError::invalid("end_time", "a string or null")),
        };
        let update = EventUpdate {
            title: params::optional_str(params, "title")?.map(str::to_string),
            start_time: optional_time(params, "start_time")?,
            end_time,
            location: nullable_str(params, "location")?,
            notes: nullable_str(params, "notes")?,
        };
        if let (Some(start), Some(end)) = (update.start_time, update.end_time.flatten()) {
            check_order(start, Some(end))?;
        }
        to_value(self.store.update(id, update).await.map_err(store_err)?)
    }
}
