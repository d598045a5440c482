//! Bounded in-memory activity log, newest entry first

use std::collections::VecDeque;
use tokio::sync::RwLock;

pub const DEFAULT_CAPACITY: usize = 500;

pub struct ActivityLog {
    capacity: usize,
    entries: RwLock<VecDeque<String>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Prepend a timestamped line, evicting the oldest beyond capacity
    pub async fn record(&self, message: impl AsRef<str>) {
        let line = format!(
            "[{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            message.as_ref()
        );

        let mut entries = self.entries.write().await;
        entries.push_front(line);
        entries.truncate(self.capacity);
    }

    pub async fn entries(&self) -> Vec<String> {
        self.entries.read().await.iter().cloned().collect()
    }
}
