// ABOUTME: Priority queue of pending tasks
// ABOUTME: Descending priority with FIFO order among equal priorities

use std::collections::VecDeque;

use crate::types::Task;

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first task with a strictly lower priority
    pub fn push(&mut self, task: Task) {
        let index = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(index, task);
    }

    /// Put a task back at the head, ahead of everything else
    pub fn requeue(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
