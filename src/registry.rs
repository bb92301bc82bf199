//! In-memory task index.
//!
//! Keyed by task id and by URL; a URL may appear at most once at a time, which
//! is what makes submit de-duplication race-free. Tasks stay registered for
//! the life of the process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::task::Task;

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Arc<Task>>,
    urls: HashSet<String>,
}

#[derive(Default)]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Create and register a Pending task for `url`.
    ///
    /// Returns `None` when a task for the URL already exists; the check and
    /// the insert happen under one lock.
    pub fn register(&self, url: &str) -> Option<Arc<Task>> {
        let mut inner = self.lock();
        if inner.urls.contains(url) {
            return None;
        }

        let task = Task::new(url);
        inner.urls.insert(url.to_owned());
        inner.by_id.insert(task.id.clone(), task.clone());
        Some(task)
    }

    /// Remove a task from both indexes. Used to roll back a submission the
    /// queue refused.
    pub fn deregister(&self, task: &Task) {
        let mut inner = self.lock();
        inner.by_id.remove(&task.id);
        inner.urls.remove(&task.url);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.lock().by_id.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Task>> {
        self.lock().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_finds_by_id() {
        let registry = TaskRegistry::new();
        let task = registry
            .register("https://example/a.mp4")
            .expect("first registration succeeds");

        let found = registry.get(&task.id).expect("task indexed by id");
        assert_eq!(found.url, "https://example/a.mp4");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_urls_are_refused() {
        let registry = TaskRegistry::new();
        assert!(registry.register("https://example/a.mp4").is_some());
        assert!(registry.register("https://example/a.mp4").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_frees_the_url() {
        let registry = TaskRegistry::new();
        let task = registry.register("https://example/a.mp4").unwrap();
        registry.deregister(&task);

        assert!(registry.is_empty());
        assert!(registry.register("https://example/a.mp4").is_some());
    }

    #[test]
    fn concurrent_registration_yields_one_task() {
        let registry = Arc::new(TaskRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.register("https://example/contested.mp4").is_some()
            }));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked") as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }
}
