use std::collections::HashMap;

use itertools::Itertools;
use kameo::{actor::ActorRef, messages, Actor};

use crate::{task::Task, Error, Result};

/// Owns every task record. All access goes through the actor's mailbox, so
/// readers only ever observe whole records.
#[derive(Actor)]
pub struct TaskRegistry {
  tasks: HashMap<String, Task>,
  capacity: usize,
}

#[derive(Clone)]
pub struct TaskRegistryRef(ActorRef<TaskRegistry>);

#[messages]
impl TaskRegistry {
  // returns whatever had to be evicted to stay within capacity
  #[message]
  async fn insert(&mut self, task: Task) -> Result<Vec<Task>> {
    let mut evicted = Vec::new();
    if !self.tasks.contains_key(&task.task_id) {
      let overflow = (self.tasks.len() + 1).saturating_sub(self.capacity);
      evicted = self.take_oldest(overflow);
    }
    self.tasks.insert(task.task_id.clone(), task);
    Ok(evicted)
  }

  // only touches tasks that are still registered
  #[message]
  async fn replace(&mut self, task: Task) -> Result<bool> {
    match self.tasks.get_mut(&task.task_id) {
      Some(slot) => {
        *slot = task;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  #[message]
  async fn get(&mut self, task_id: String) -> Result<Option<Task>> {
    Ok(self.tasks.get(&task_id).cloned())
  }

  #[message]
  async fn remove(&mut self, task_id: String) -> Result<Option<Task>> {
    Ok(self.tasks.remove(&task_id))
  }

  #[message]
  async fn len(&mut self) -> Result<usize> {
    Ok(self.tasks.len())
  }

  #[message]
  async fn snapshot(&mut self) -> Result<Vec<Task>> {
    Ok(self.tasks.values().cloned().collect())
  }

  #[message]
  async fn evict_oldest(&mut self, count: usize) -> Result<Vec<Task>> {
    Ok(self.take_oldest(count))
  }
}

impl TaskRegistry {
  pub fn new(capacity: usize) -> Self {
    Self {
      tasks: HashMap::new(),
      capacity: capacity.max(1),
    }
  }

  pub fn spawn(self) -> TaskRegistryRef {
    TaskRegistryRef(kameo::spawn(self))
  }

  fn take_oldest(&mut self, count: usize) -> Vec<Task> {
    if count == 0 {
      return Vec::new();
    }

    let oldest: Vec<String> = self
      .tasks
      .values()
      .sorted_by(|a, b| {
        a.created_at
          .cmp(&b.created_at)
          .then_with(|| a.task_id.cmp(&b.task_id))
      })
      .take(count)
      .map(|task| task.task_id.clone())
      .collect();

    oldest
      .iter()
      .filter_map(|task_id| self.tasks.remove(task_id))
      .collect()
  }
}

impl TaskRegistryRef {
  pub async fn insert(&self, task: Task) -> Result<Vec<Task>> {
    self
      .0
      .ask(Insert { task })
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn replace(&self, task: Task) -> Result<bool> {
    self
      .0
      .ask(Replace { task })
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn find(&self, task_id: &str) -> Result<Option<Task>> {
    let task_id = task_id.to_string();
    self
      .0
      .ask(Get { task_id })
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn get(&self, task_id: &str) -> Result<Task> {
    self
      .find(task_id)
      .await?
      .ok_or(Error::NotFound("Task not found"))
  }

  #[allow(dead_code)]
  pub async fn remove(&self, task_id: &str) -> Result<Option<Task>> {
    let task_id = task_id.to_string();
    self
      .0
      .ask(Remove { task_id })
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn len(&self) -> Result<usize> {
    self
      .0
      .ask(Len)
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn snapshot(&self) -> Result<Vec<Task>> {
    self
      .0
      .ask(Snapshot)
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }

  pub async fn evict_oldest(&self, count: usize) -> Result<Vec<Task>> {
    self
      .0
      .ask(EvictOldest { count })
      .send()
      .await
      .map_err(|_| Error::RegistryUnavailable)
  }
}
