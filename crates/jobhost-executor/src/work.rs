//! Per-run work-item bookkeeping.

use jobhost_store::WorkItem;
use std::collections::VecDeque;

/// Items not yet handed out, plus items handed out but not completed.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    pending: VecDeque<WorkItem>,
    executing: Vec<WorkItem>,
}

impl WorkQueue {
    pub(crate) fn load(items: &[WorkItem]) -> Self {
        Self {
            pending: items.iter().cloned().collect(),
            executing: Vec::new(),
        }
    }

    pub(crate) fn dequeue(&mut self) -> Option<WorkItem> {
        let mut item = self.pending.pop_front()?;
        item.delivery_count += 1;
        self.executing.push(item.clone());
        Some(item)
    }

    /// Returns false when `id` is not an outstanding item.
    pub(crate) fn complete(&mut self, id: u32) -> bool {
        match self.executing.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.executing.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_executing(&self) -> bool {
        !self.executing.is_empty()
    }

    /// Everything left over, outstanding items first.
    pub(crate) fn drain_unfinished(&mut self) -> Vec<WorkItem> {
        let mut out: Vec<WorkItem> = self.executing.drain(..).collect();
        out.extend(self.pending.drain(..));
        out
    }
}
