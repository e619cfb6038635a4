//! Cooperative scheduling primitive.
//!
//! Every stateful multi-step operation in this crate (in-flight requests,
//! topology refresh, slot migrations) is one entry in a [`ReducerList`] and
//! advances by exactly one step per drive pass. Nothing here spawns tasks
//! or threads; progress happens only when the owner drives the list.

/// What one reduction step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep the entry; step it again next pass.
    Continue,
    /// The entry is finished; drop it.
    Remove,
    /// Stop the current pass; entries after this one are not stepped.
    Abort,
}

/// One cooperative state machine, stepped against a shared context.
#[allow(async_fn_in_trait)]
pub trait Reduce<C> {
    async fn step(&mut self, ctx: &mut C) -> StepOutcome;
}

/// Ordered collection of live reducers.
///
/// Entries step in insertion order; removal keeps the relative order of
/// the survivors. Entries pushed during a pass are picked up by the same
/// pass when they land behind the cursor, which is what lets a request
/// queued from inside a step run without waiting a full tick.
pub struct ReducerList<T> {
    entries: Vec<T>,
}

impl<T> ReducerList<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    /// Take every entry out, leaving the list empty.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.entries)
    }

    /// Step every live entry once. Returns false when an entry aborted
    /// the pass.
    pub async fn drive<C>(&mut self, ctx: &mut C) -> bool
    where
        T: Reduce<C>,
    {
        let mut i = 0;
        while i < self.entries.len() {
            match self.entries[i].step(ctx).await {
                StepOutcome::Continue => i += 1,
                StepOutcome::Remove => {
                    self.entries.remove(i);
                }
                StepOutcome::Abort => return false,
            }
        }
        true
    }
}

impl<T> Default for ReducerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Task {
        name: &'static str,
        steps_left: u32,
        when_done: StepOutcome,
    }

    impl Task {
        fn new(name: &'static str, steps_left: u32, when_done: StepOutcome) -> Self {
            Self {
                name,
                steps_left,
                when_done,
            }
        }
    }

    impl Reduce<Vec<&'static str>> for Task {
        async fn step(&mut self, log: &mut Vec<&'static str>) -> StepOutcome {
            log.push(self.name);
            if self.steps_left > 0 {
                self.steps_left -= 1;
                StepOutcome::Continue
            } else {
                self.when_done
            }
        }
    }

    #[tokio::test]
    async fn test_steps_in_insertion_order() {
        let mut list = ReducerList::new();
        list.push(Task::new("a", 1, StepOutcome::Remove));
        list.push(Task::new("b", 1, StepOutcome::Remove));
        list.push(Task::new("c", 1, StepOutcome::Remove));

        let mut log = Vec::new();
        assert!(list.drive(&mut log).await);
        assert_eq!(log, vec!["a", "b", "c"]);
        assert_eq!(list.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_keeps_survivor_order() {
        let mut list = ReducerList::new();
        list.push(Task::new("done", 0, StepOutcome::Remove));
        list.push(Task::new("left", 5, StepOutcome::Remove));
        list.push(Task::new("right", 5, StepOutcome::Remove));

        let mut log = Vec::new();
        assert!(list.drive(&mut log).await);

        // The finished entry still got its step; survivors kept order and
        // each ran exactly once.
        assert_eq!(log, vec!["done", "left", "right"]);
        assert_eq!(list.len(), 2);

        log.clear();
        assert!(list.drive(&mut log).await);
        assert_eq!(log, vec!["left", "right"]);
    }

    #[tokio::test]
    async fn test_abort_stops_the_pass() {
        let mut list = ReducerList::new();
        list.push(Task::new("first", 5, StepOutcome::Remove));
        list.push(Task::new("bad", 0, StepOutcome::Abort));
        list.push(Task::new("starved", 5, StepOutcome::Remove));

        let mut log = Vec::new();
        assert!(!list.drive(&mut log).await);
        assert_eq!(log, vec!["first", "bad"]);

        // The aborting entry stays and aborts again on the next pass.
        log.clear();
        assert!(!list.drive(&mut log).await);
        assert_eq!(log, vec!["first", "bad"]);
        assert_eq!(list.len(), 3);
    }

    #[tokio::test]
    async fn test_drains_to_empty() {
        let mut list = ReducerList::new();
        list.push(Task::new("a", 2, StepOutcome::Remove));
        list.push(Task::new("b", 0, StepOutcome::Remove));

        let mut log = Vec::new();
        while !list.is_empty() {
            assert!(list.drive(&mut log).await);
        }
        assert_eq!(log, vec!["a", "b", "a", "a"]);
    }
}
