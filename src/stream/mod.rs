//! Streams and lanes: the bidirectional, recipe-matched channel primitive
//! everything else in this crate talks over.
//!
//! A stream is a pair of lanes. Each lane holds two FIFOs of pending recipe
//! groups — a root queue and an ancillary queue — and a weak link to its
//! peer. Submitting a group on one lane tries to match it against the
//! corresponding queue on the peer; if nothing is waiting there yet, the
//! group is parked until the peer submits a compatible one.
//!
//! Generalizes a fixed send/recv/reply channel protocol into an open
//! recipe list matched pairwise against whatever the peer lane queued.

pub mod flow;
pub mod matching;

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::error::{HelError, HelResult};

/// One step of a submitted recipe.
#[derive(Debug, Clone)]
pub enum Action {
    Offer,
    Accept,
    ImbueCredentials([u8; 16]),
    ExtractCredentials,
    SendFromBuffer(Vec<u8>),
    RecvInline,
    SendFlow(Vec<u8>),
    RecvToBuffer,
    SendFromBufferSg(Vec<Vec<u8>>),
    PushDescriptor(u64),
    PullDescriptor,
    Dismiss,
}

/// One item of a submission: `chain = true` continues the previous item's
/// group instead of starting a new one, `ancillary = true` routes the whole
/// group to the ancillary queue instead of the root queue.
#[derive(Debug, Clone)]
pub struct RecipeItem {
    pub action: Action,
    pub chain: bool,
    pub ancillary: bool,
}

impl RecipeItem {
    pub fn root(action: Action) -> Self {
        Self { action, chain: false, ancillary: false }
    }

    pub fn chained(action: Action) -> Self {
        Self { action, chain: true, ancillary: false }
    }

    pub fn ancillary(action: Action) -> Self {
        Self { action, chain: false, ancillary: true }
    }
}

/// What a single matched action resolved to.
#[derive(Debug, Clone)]
pub enum Outcome {
    Ack,
    NewLane(Arc<Lane>),
    Credentials([u8; 16]),
    Data(Vec<u8>),
    Descriptor(u64),
    Dismissed,
}

pub type GroupResult = Vec<HelResult<Outcome>>;

pub(crate) struct PendingGroup {
    pub actions: Vec<Action>,
    pub slot: Arc<Mutex<Option<GroupResult>>>,
}

/// What `submit` hands back: the group either matched immediately, or it was
/// parked and the caller polls the returned slot until a peer submission
/// fills it in.
pub enum SubmitOutcome {
    Ready(GroupResult),
    Pending(Arc<Mutex<Option<GroupResult>>>),
}

pub(crate) struct LaneQueues {
    pub root: Mutex<VecDeque<PendingGroup>>,
    pub ancillary: Mutex<VecDeque<PendingGroup>>,
}

pub struct Lane {
    peer: Mutex<Weak<Lane>>,
    pub(crate) queues: LaneQueues,
    shut_down: AtomicBool,
}

impl Lane {
    fn bare() -> Arc<Self> {
        Arc::new(Self {
            peer: Mutex::new(Weak::new()),
            queues: LaneQueues {
                root: Mutex::new(VecDeque::new()),
                ancillary: Mutex::new(VecDeque::new()),
            },
            shut_down: AtomicBool::new(false),
        })
    }

    /// Create a fresh stream: a pair of lanes, each pointing at the other.
    pub fn new_pair() -> (Arc<Lane>, Arc<Lane>) {
        let a = Lane::bare();
        let b = Lane::bare();
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn peer(&self) -> Option<Arc<Lane>> {
        self.peer.lock().upgrade()
    }

    /// Split a flat submission into groups: a new group starts at every item
    /// whose `chain` bit is false (the very first item always starts one).
    fn group_items(items: Vec<RecipeItem>) -> Vec<(bool, Vec<Action>)> {
        let mut groups: Vec<(bool, Vec<Action>)> = Vec::new();
        for item in items {
            if item.chain {
                if let Some((_, actions)) = groups.last_mut() {
                    actions.push(item.action);
                    continue;
                }
            }
            groups.push((item.ancillary, alloc::vec![item.action]));
        }
        groups
    }

    /// Submit a recipe. Dismiss groups resolve immediately without touching
    /// the peer; everything else tries to match against the peer's
    /// corresponding queue and parks on this lane's own queue otherwise.
    pub fn submit(self: &Arc<Lane>, items: Vec<RecipeItem>) -> HelResult<Vec<SubmitOutcome>> {
        if self.is_shut_down() {
            return Err(HelError::LaneShutdown);
        }
        let peer = self.peer().ok_or(HelError::EndOfLane)?;
        if peer.is_shut_down() {
            return Err(HelError::EndOfLane);
        }
        let mut results = Vec::new();
        for (ancillary, actions) in Self::group_items(items) {
            if matches!(actions.as_slice(), [Action::Dismiss]) {
                results.push(SubmitOutcome::Ready(alloc::vec![Ok(Outcome::Dismissed)]));
                continue;
            }
            results.push(matching::match_or_enqueue(self, &peer, ancillary, actions));
        }
        Ok(results)
    }

    fn take_all_groups(&self) -> Vec<PendingGroup> {
        let mut out: Vec<PendingGroup> = self.queues.root.lock().drain(..).collect();
        out.extend(self.queues.ancillary.lock().drain(..));
        out
    }

    /// Cancel this lane's own pending groups with `laneShutdown`, mark it
    /// broken, and fail the peer's pending groups with `endOfLane` since they
    /// were waiting on a lane that is now gone.
    pub fn shutdown(self: &Arc<Lane>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for group in self.take_all_groups() {
            *group.slot.lock() = Some(
                group
                    .actions
                    .iter()
                    .map(|_| Err(HelError::LaneShutdown))
                    .collect(),
            );
        }
        if let Some(peer) = self.peer() {
            for group in peer.take_all_groups() {
                *group.slot.lock() = Some(
                    group
                        .actions
                        .iter()
                        .map(|_| Err(HelError::EndOfLane))
                        .collect(),
                );
            }
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.shut_down.store(true, Ordering::Release);
        for group in self.take_all_groups() {
            *group.slot.lock() = Some(
                group
                    .actions
                    .iter()
                    .map(|_| Err(HelError::LaneShutdown))
                    .collect(),
            );
        }
    }
}
