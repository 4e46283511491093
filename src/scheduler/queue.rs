use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::request::{Job, Priority};

/// What the dispatcher should look at next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    Ready(Priority),
    /// Only batch work is queued and its group is not due yet.
    WaitUntil(Instant),
    Empty,
}

/// One FIFO per priority. Retries go back in at the head.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueues {
    high: VecDeque<Job>,
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
    batch: VecDeque<Job>,
    /// Batch jobs released by the last flush and not dispatched yet.
    released: usize,
}

impl PriorityQueues {
    fn queue(&self, priority: Priority) -> &VecDeque<Job> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
            Priority::Batch => &self.batch,
        }
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Job> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
            Priority::Batch => &mut self.batch,
        }
    }

    pub fn push_back(&mut self, job: Job) {
        self.queue_mut(job.priority).push_back(job);
    }

    pub fn push_front(&mut self, job: Job) {
        if job.priority == Priority::Batch {
            self.released += 1;
        }
        self.queue_mut(job.priority).push_front(job);
    }

    pub fn peek(&self, priority: Priority) -> Option<&Job> {
        self.queue(priority).front()
    }

    pub fn pop(&mut self, priority: Priority) -> Option<Job> {
        let job = self.queue_mut(priority).pop_front()?;
        if priority == Priority::Batch {
            self.released = self.released.saturating_sub(1);
        }
        Some(job)
    }

    /// Picks the highest non-empty queue. Batch work becomes ready once
    /// `batch_size` jobs are waiting or the oldest one waited `batch_delay`;
    /// `on_flush` is told how many jobs the flush released.
    pub fn select(
        &mut self,
        now: Instant,
        batch_size: usize,
        batch_delay: Duration,
        mut on_flush: impl FnMut(usize),
    ) -> Selection {
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            if !self.queue(priority).is_empty() {
                return Selection::Ready(priority);
            }
        }
        if self.released > 0 && !self.batch.is_empty() {
            return Selection::Ready(Priority::Batch);
        }
        let Some(oldest) = self.batch.front() else {
            self.released = 0;
            return Selection::Empty;
        };
        let due = oldest.queued_at + batch_delay;
        if self.batch.len() >= batch_size.max(1) || now >= due {
            let released = self.group_head(batch_size.max(1));
            self.released = released;
            on_flush(released);
            Selection::Ready(Priority::Batch)
        } else {
            Selection::WaitUntil(due)
        }
    }

    /// Moves up to `limit` jobs sharing the head's batch type to the front,
    /// keeping their relative order. Returns the group size.
    fn group_head(&mut self, limit: usize) -> usize {
        let Some(head) = self.batch.front() else {
            return 0;
        };
        let kind = head.batch_type.clone();
        let mut group = VecDeque::new();
        let mut rest = VecDeque::new();
        for job in self.batch.drain(..) {
            if group.len() < limit && job.batch_type == kind {
                group.push_back(job);
            } else {
                rest.push_back(job);
            }
        }
        let size = group.len();
        group.extend(rest);
        self.batch = group;
        size
    }

    /// Removes every job accepted by `matches`, in queue order.
    pub fn drain_where(&mut self, priority: Option<Priority>, mut matches: impl FnMut(&Job) -> bool) -> Vec<Job> {
        let mut drained = Vec::new();
        for p in Priority::ALL {
            if priority.is_some_and(|only| only != p) {
                continue;
            }
            let queue = self.queue_mut(p);
            let mut kept = VecDeque::with_capacity(queue.len());
            for job in queue.drain(..) {
                if matches(&job) {
                    drained.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            *queue = kept;
        }
        self.released = self.released.min(self.batch.len());
        drained
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.high
            .iter_mut()
            .chain(self.normal.iter_mut())
            .chain(self.low.iter_mut())
            .chain(self.batch.iter_mut())
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        Priority::ALL
            .into_iter()
            .any(|p| self.queue(p).iter().any(|job| job.provider == provider))
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.queue(priority).len()
    }

    pub fn total(&self) -> usize {
        Priority::ALL.into_iter().map(|p| self.len(p)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
