use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::message::MessageId;

/// Timer structure mapping not-before times to queue ids.
///
/// Entries whose time has arrived are handed out in FIFO order within a
/// slot; several entries may share a slot. A single pump task consumes the
/// wheel through [`TimeWheel::next`] and feeds the worker pool.
pub(crate) struct TimeWheel {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    slots: BTreeMap<DateTime<Utc>, VecDeque<MessageId>>,
    closed: bool,
}

impl TimeWheel {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: BTreeMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Schedule `id` to be handed out once `at` has passed.
    pub(crate) fn insert(&self, at: DateTime<Utc>, id: MessageId) {
        let mut inner = self.inner.lock().expect("wheel lock poisoned");
        if inner.closed {
            // shutdown in progress, the entry stays on disk for the next run
            return;
        }
        inner.slots.entry(at).or_default().push_back(id);
        drop(inner);
        self.notify.notify_one();
    }

    /// Stop handing out entries; wakes a blocked [`TimeWheel::next`].
    pub(crate) fn close(&self) {
        self.inner.lock().expect("wheel lock poisoned").closed = true;
        self.notify.notify_one();
    }

    /// Wait for the earliest due entry. Returns `None` once the wheel is
    /// closed. Each inserted id is handed out exactly once per due time.
    pub(crate) async fn next(&self) -> Option<MessageId> {
        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("wheel lock poisoned");
                if inner.closed {
                    return None;
                }
                let now = Utc::now();
                let due = inner.slots.first_key_value().map(|(&at, _)| at);
                match due {
                    Some(at) if at <= now => {
                        let slot = inner.slots.get_mut(&at).expect("slot exists");
                        let id = slot.pop_front().expect("slot not empty");
                        if slot.is_empty() {
                            inner.slots.remove(&at);
                        }
                        return Some(id);
                    }
                    Some(at) => (at - now).to_std().ok(),
                    None => None,
                }
            };
            match wait {
                Some(duration) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;

    fn id(n: u8) -> MessageId {
        format!("{n:032x}").parse().unwrap()
    }

    #[tokio::test]
    async fn dispatches_due_entries_in_time_order() {
        let wheel = TimeWheel::new();
        let now = Utc::now();
        wheel.insert(now - TimeDelta::seconds(1), id(2));
        wheel.insert(now - TimeDelta::seconds(2), id(1));
        assert_eq!(wheel.next().await, Some(id(1)));
        assert_eq!(wheel.next().await, Some(id(2)));
    }

    #[tokio::test]
    async fn shared_slot_is_fifo() {
        let wheel = TimeWheel::new();
        let at = Utc::now() - TimeDelta::seconds(1);
        wheel.insert(at, id(1));
        wheel.insert(at, id(2));
        wheel.insert(at, id(3));
        assert_eq!(wheel.next().await, Some(id(1)));
        assert_eq!(wheel.next().await, Some(id(2)));
        assert_eq!(wheel.next().await, Some(id(3)));
    }

    #[tokio::test]
    async fn waits_for_entries_to_become_due() {
        let wheel = TimeWheel::new();
        wheel.insert(Utc::now() + TimeDelta::milliseconds(50), id(1));
        let before = std::time::Instant::now();
        assert_eq!(wheel.next().await, Some(id(1)));
        assert!(before.elapsed() >= std::time::Duration::from_millis(40));
    }

    #[tokio::test]
    async fn close_unblocks_and_returns_none() {
        let wheel = std::sync::Arc::new(TimeWheel::new());
        let waiter = {
            let wheel = wheel.clone();
            tokio::spawn(async move { wheel.next().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        wheel.close();
        assert_eq!(waiter.await.unwrap(), None);
        // inserts after close are ignored
        wheel.insert(Utc::now(), id(1));
        assert_eq!(wheel.next().await, None);
    }
}
