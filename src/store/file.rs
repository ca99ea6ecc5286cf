//! File-backed [`MonitorStore`].
//!
//! Events are appended to `events.log`, one JSON object per line, and replayed on
//! open. The remaining tables are kept in memory and written to `state.json`
//! after every mutation (write to a temporary file, then rename).
//!
//! # Examples
//! ```
//! use warden::store::{FileStore, MonitorStore, EventQuery};
//! use warden::event::{EventData, MonitoringEvent};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = FileStore::open(dir.path()).unwrap();
//! let event = MonitoringEvent::new("info", "doc", "test", "hello", EventData::new(), 50);
//! store.insert_event(&event).unwrap();
//!
//! let reopened = FileStore::open(dir.path()).unwrap();
//! assert_eq!(reopened.get_events(&EventQuery::new()).unwrap()[0].id(), event.id());
//! ```

use super::memory::{MemoryStore, StoreState};
use super::{
    Baseline, BaselineKey, EventQuery, MonitorStore, ScheduledTask, TaskRun, TaskRunQuery,
};
use crate::error::{WardenError, WardenResult};
use crate::event::{EventType, MonitoringEvent};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const EVENT_LOG: &str = "events.log";
const STATE_FILE: &str = "state.json";

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    log: Mutex<File>,
    inner: MemoryStore,
}

impl FileStore {
    /// Opens (or creates) a store rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> WardenResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let events = Self::read_events(&dir.join(EVENT_LOG))?;
        let state_path = dir.join(STATE_FILE);
        let state = if state_path.exists() {
            serde_json::from_slice::<StoreState>(&fs::read(&state_path)?)?
        } else {
            StoreState::default()
        };
        debug!(
            "Opened file store: dir={}, events={}, baselines={}",
            dir.display(),
            events.len(),
            state.baselines.len()
        );

        let log = Self::open_log(&dir)?;
        Ok(Self {
            dir,
            log: Mutex::new(log),
            inner: MemoryStore::from_parts(events, state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn open_log(dir: &Path) -> WardenResult<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENT_LOG))?)
    }

    fn read_events(path: &Path) -> WardenResult<Vec<MonitoringEvent>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str(&line)
                .map_err(WardenError::from)
                .and_then(|value| MonitoringEvent::from_value(&value));
            match parsed {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "Skipping unreadable event: file={}, line={}, error={}",
                    path.display(),
                    number + 1,
                    e
                ),
            }
        }
        Ok(events)
    }

    fn write_atomically(&self, name: &str, bytes: &[u8]) -> WardenResult<()> {
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn persist_state(&self) -> WardenResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.inner.export_state())?;
        self.write_atomically(STATE_FILE, &bytes)
    }

    /// Rewrites the event log from the in-memory table.
    fn compact_log(&self) -> WardenResult<()> {
        let mut buffer = Vec::new();
        for event in self.inner.export_events() {
            serde_json::to_writer(&mut buffer, &event.to_value())?;
            buffer.push(b'\n');
        }
        let mut log = self.log.lock();
        self.write_atomically(EVENT_LOG, &buffer)?;
        *log = Self::open_log(&self.dir)?;
        Ok(())
    }
}

impl MonitorStore for FileStore {
    fn insert_event(&self, event: &MonitoringEvent) -> WardenResult<()> {
        let mut line = serde_json::to_vec(&event.to_value())?;
        line.push(b'\n');
        {
            let mut log = self.log.lock();
            log.write_all(&line)?;
            log.flush()?;
        }
        self.inner.insert_event(event)
    }

    fn get_events(&self, query: &EventQuery) -> WardenResult<Vec<MonitoringEvent>> {
        self.inner.get_events(query)
    }

    fn count_events_since(&self, since: DateTime<Utc>) -> WardenResult<u64> {
        self.inner.count_events_since(since)
    }

    fn event_counts(&self, since: Option<DateTime<Utc>>) -> WardenResult<HashMap<EventType, u64>> {
        self.inner.event_counts(since)
    }

    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize> {
        let removed = self.inner.purge_events_before(cutoff)?;
        if removed > 0 {
            self.compact_log()?;
        }
        Ok(removed)
    }

    fn get_baseline(&self, key: &BaselineKey) -> WardenResult<Option<Baseline>> {
        self.inner.get_baseline(key)
    }

    fn update_baseline(
        &self,
        key: &BaselineKey,
        update: &mut dyn FnMut(Option<&Baseline>) -> Baseline,
    ) -> WardenResult<Baseline> {
        let baseline = self.inner.update_baseline(key, update)?;
        self.persist_state()?;
        Ok(baseline)
    }

    fn baselines(&self) -> WardenResult<Vec<Baseline>> {
        self.inner.baselines()
    }

    fn save_task_run(&self, run: &TaskRun) -> WardenResult<()> {
        self.inner.save_task_run(run)?;
        self.persist_state()
    }

    fn get_task_run(&self, id: Uuid) -> WardenResult<Option<TaskRun>> {
        self.inner.get_task_run(id)
    }

    fn task_runs(&self, query: &TaskRunQuery) -> WardenResult<Vec<TaskRun>> {
        self.inner.task_runs(query)
    }

    fn purge_task_runs_before(&self, cutoff: DateTime<Utc>) -> WardenResult<usize> {
        let removed = self.inner.purge_task_runs_before(cutoff)?;
        if removed > 0 {
            self.persist_state()?;
        }
        Ok(removed)
    }

    fn recovery_attempts(&self, task_name: &str) -> WardenResult<u32> {
        self.inner.recovery_attempts(task_name)
    }

    fn increment_recovery_attempts(&self, task_name: &str) -> WardenResult<u32> {
        let attempts = self.inner.increment_recovery_attempts(task_name)?;
        self.persist_state()?;
        Ok(attempts)
    }

    fn reset_recovery_attempts(&self, task_name: &str) -> WardenResult<()> {
        self.inner.reset_recovery_attempts(task_name)?;
        self.persist_state()
    }

    fn schedule_task(&self, task: ScheduledTask) -> WardenResult<()> {
        self.inner.schedule_task(task)?;
        self.persist_state()
    }

    fn take_due_tasks(&self, now: DateTime<Utc>) -> WardenResult<Vec<ScheduledTask>> {
        let due = self.inner.take_due_tasks(now)?;
        if !due.is_empty() {
            self.persist_state()?;
        }
        Ok(due)
    }

    fn scheduled_tasks(&self) -> WardenResult<Vec<ScheduledTask>> {
        self.inner.scheduled_tasks()
    }
}
