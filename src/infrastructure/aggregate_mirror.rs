use crate::domain::models::TaskAggregate;
use crate::infrastructure::error::InfraError;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Fields of a task aggregate that a commit may change.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateUpdate {
    pub total_seconds: i64,
    pub total_hours: f64,
    pub total_minutes: i64,
    /// Only the members listed here are overwritten.
    pub member_hours: BTreeMap<String, f64>,
}

impl AggregateUpdate {
    /// Update carrying the task totals plus the hours of `user_id` only.
    pub fn for_member(aggregate: &TaskAggregate, user_id: &str) -> Self {
        Self {
            total_seconds: aggregate.total_seconds,
            total_hours: aggregate.total_hours,
            total_minutes: aggregate.total_minutes,
            member_hours: BTreeMap::from([(user_id.to_string(), aggregate.hours_for(user_id))]),
        }
    }
}

pub trait TaskAggregateMirror: Send + Sync {
    fn find(&self, task_id: &str) -> Result<Option<TaskAggregate>, InfraError>;
    /// Fails with [`InfraError::TaskAggregateMissing`] for unknown tasks.
    fn update(&self, task_id: &str, update: &AggregateUpdate) -> Result<(), InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAggregateMirror {
    tasks: Mutex<HashMap<String, TaskAggregate>>,
}

impl InMemoryAggregateMirror {
    pub fn insert(&self, aggregate: TaskAggregate) -> Result<(), InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::lock_poisoned("aggregate mirror", error))?
            .insert(aggregate.task_id.clone(), aggregate);
        Ok(())
    }
}

impl TaskAggregateMirror for InMemoryAggregateMirror {
    fn find(&self, task_id: &str) -> Result<Option<TaskAggregate>, InfraError> {
        let tasks = self
            .tasks
            .lock()
            .map_err(|error| InfraError::lock_poisoned("aggregate mirror", error))?;
        Ok(tasks.get(task_id).cloned())
    }

    fn update(&self, task_id: &str, update: &AggregateUpdate) -> Result<(), InfraError> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|error| InfraError::lock_poisoned("aggregate mirror", error))?;
        let aggregate = tasks
            .get_mut(task_id)
            .ok_or_else(|| InfraError::TaskAggregateMissing(task_id.to_string()))?;
        aggregate.total_seconds = update.total_seconds;
        aggregate.total_hours = update.total_hours;
        aggregate.total_minutes = update.total_minutes;
        for (user_id, hours) in &update.member_hours {
            aggregate.member_hours.insert(user_id.clone(), *hours);
        }
        Ok(())
    }
}
