// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A per-device coalescing queue of device events.
//!
//! Events are keyed by device path. A push for a path that is already
//! queued replaces the queued event, so a consumer only ever sees the
//! newest state of a device. An event that failed to reconcile is pushed
//! back with an exponential back-off and is held until its delay expires
//! or a fresher event for the same device arrives.

use std::{
    cmp::min,
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex},
    time::Instant,
};

use crate::engine::{
    consts::{DEFAULT_BACKOFF, MAX_BACKOFF},
    types::DeviceEvent,
};

const LOCK_EXPECT_MSG: &str =
    "No code holding the queue lock can panic; therefore the mutex can not be poisoned.";

struct Entry {
    event: DeviceEvent,
    not_before: Option<Instant>,
}

impl Entry {
    fn deliverable(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
    closed: bool,
}

impl Inner {
    fn insert(&mut self, event: DeviceEvent, not_before: Option<Instant>) {
        self.order.push_back(event.devpath.clone());
        self.entries
            .insert(event.devpath.clone(), Entry { event, not_before });
    }

    fn take_deliverable(&mut self, now: Instant) -> Option<DeviceEvent> {
        let index = self
            .order
            .iter()
            .position(|key| self.entries.get(key).is_some_and(|e| e.deliverable(now)))?;
        let key = self.order.remove(index)?;
        self.entries.remove(&key).map(|entry| entry.event)
    }

    fn earliest_wakeup(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.not_before).min()
    }
}

#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    /// Queue an event, superseding any queued event for the same device.
    ///
    /// A queued event that is newer than the pushed one is kept. Replacing
    /// an event that is waiting out a back-off makes it deliverable at
    /// once.
    pub fn push(&self, event: DeviceEvent) {
        let mut inner = self.inner.lock().expect(LOCK_EXPECT_MSG);
        if inner.closed {
            return;
        }
        match inner.entries.get_mut(&event.devpath) {
            Some(existing) if existing.event.created > event.created => {
                trace!(
                    "Keeping newer queued {} event for {}",
                    existing.event.action,
                    event.devpath
                );
                return;
            }
            Some(existing) => {
                trace!(
                    "Coalescing {} event for {} into queued {} event",
                    event.action,
                    event.devpath,
                    existing.event.action
                );
                existing.event = event;
                existing.not_before = None;
            }
            None => inner.insert(event, None),
        }
        self.cond.notify_all();
    }

    /// Re-queue an event whose handling failed.
    ///
    /// The delay starts at one second and doubles on each failure up to a
    /// minute. If a fresher event for the device was queued meanwhile, the
    /// failed one is dropped in its favour.
    pub fn push_backoff(&self, mut event: DeviceEvent) {
        event.backoff = if event.backoff.is_zero() {
            DEFAULT_BACKOFF
        } else {
            min(event.backoff * 2, MAX_BACKOFF)
        };

        let mut inner = self.inner.lock().expect(LOCK_EXPECT_MSG);
        if inner.closed {
            return;
        }
        if inner.entries.contains_key(&event.devpath) {
            debug!(
                "Dropping failed {} event for {}; a newer event is queued",
                event.action, event.devpath
            );
            return;
        }
        debug!(
            "Retrying {} event for {} in {:?}",
            event.action, event.devpath, event.backoff
        );
        let not_before = Instant::now() + event.backoff;
        inner.insert(event, Some(not_before));
        self.cond.notify_all();
    }

    /// Block until an event is deliverable and remove it from the queue.
    ///
    /// Returns None once the queue is closed.
    pub fn pop(&self) -> Option<DeviceEvent> {
        let mut inner = self.inner.lock().expect(LOCK_EXPECT_MSG);
        loop {
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if let Some(event) = inner.take_deliverable(now) {
                return Some(event);
            }
            inner = match inner.earliest_wakeup() {
                Some(wakeup) => {
                    self.cond
                        .wait_timeout(inner, wakeup.saturating_duration_since(now))
                        .expect(LOCK_EXPECT_MSG)
                        .0
                }
                None => self.cond.wait(inner).expect(LOCK_EXPECT_MSG),
            };
        }
    }

    /// Wake every waiter and refuse further events.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect(LOCK_EXPECT_MSG);
        inner.closed = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect(LOCK_EXPECT_MSG).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
