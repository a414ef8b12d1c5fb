//! Deduplication and admission control for outstanding fetches.
//!
//! There is at most one [`FetchTask`] per key. Later requests for the same key join its
//! requester list instead of starting another fetch. With a concurrency limit, tasks beyond the
//! limit wait in FIFO order and are promoted one at a time as running fetches complete.
//!
//! The coordinator only keeps the books. Running the fetch that a [`Admission::Started`] or a
//! promotion calls for is up to the caller.

use crate::key::CacheKey;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Pending,
    InFlight,
    Done,
}

/// Outcome of [`FetchCoordinator::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A task for the key already exists; the requester was appended to it.
    Joined,
    /// A new task was created but has to wait for a free slot.
    Queued,
    /// A new task was created and the caller must start fetching now.
    Started,
}

#[derive(Debug)]
pub struct FetchTask<R> {
    requesters: Vec<(RequestId, R)>,
    state: FetchState,
}

impl<R> FetchTask<R> {
    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn into_requesters(self) -> Vec<(RequestId, R)> {
        self.requesters
    }
}

/// Returned when a fetch finishes.
#[derive(Debug)]
pub struct Completion<R> {
    /// The finished task, in state [`FetchState::Done`], with requesters in arrival order.
    pub task: Option<FetchTask<R>>,
    /// Waiting keys that now hold a slot and must be started by the caller.
    pub promoted: Vec<CacheKey>,
}

struct State<R> {
    tasks: HashMap<CacheKey, FetchTask<R>>,
    waiting: VecDeque<CacheKey>,
    in_flight: usize,
    next_id: RequestId,
}

pub struct FetchCoordinator<R> {
    state: Mutex<State<R>>,
    limit: Option<usize>,
}

impl<R> FetchCoordinator<R> {
    /// `limit` caps in-flight tasks; `None` starts every new task immediately.
    pub fn new(limit: Option<usize>) -> Self {
        FetchCoordinator {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                waiting: VecDeque::new(),
                in_flight: 0,
                next_id: 0,
            }),
            limit: limit.map(|limit| limit.max(1)),
        }
    }

    pub fn request(&self, key: &CacheKey, requester: R) -> (RequestId, Admission) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if let Some(task) = state.tasks.get_mut(key) {
            task.requesters.push((id, requester));
            tracing::trace!(key = %key, requesters = task.requesters.len(), "joined fetch");
            return (id, Admission::Joined);
        }

        let saturated = self.limit.is_some_and(|limit| state.in_flight >= limit);
        let fetch_state = if saturated {
            state.waiting.push_back(key.clone());
            FetchState::Pending
        } else {
            state.in_flight += 1;
            FetchState::InFlight
        };
        state.tasks.insert(
            key.clone(),
            FetchTask {
                requesters: vec![(id, requester)],
                state: fetch_state,
            },
        );

        if saturated {
            tracing::debug!(key = %key, waiting = state.waiting.len(), "fetch queued");
            (id, Admission::Queued)
        } else {
            (id, Admission::Started)
        }
    }

    /// Finishes the in-flight task for `key` and promotes the next waiting task into the slot
    /// it frees.
    pub fn complete(&self, key: &CacheKey) -> Completion<R> {
        let mut state = self.state.lock();
        let task = match state.tasks.get(key).map(|task| task.state) {
            Some(FetchState::InFlight) => state.tasks.remove(key).map(|mut task| {
                task.state = FetchState::Done;
                task
            }),
            _ => None,
        };
        if task.is_some() {
            state.in_flight = state.in_flight.saturating_sub(1);
        }

        let mut promoted = Vec::new();
        while self.limit.map_or(!state.waiting.is_empty(), |limit| state.in_flight < limit) {
            let Some(next) = state.waiting.pop_front() else {
                break;
            };
            let Some(next_task) = state.tasks.get_mut(&next) else {
                continue;
            };
            next_task.state = FetchState::InFlight;
            state.in_flight += 1;
            tracing::debug!(key = %next, "fetch promoted from waiting queue");
            promoted.push(next);
        }

        Completion { task, promoted }
    }

    /// Withdraws one requester. A waiting task left without requesters is dropped; an in-flight
    /// task keeps running. Returns false if the requester was not found.
    pub fn cancel(&self, key: &CacheKey, id: RequestId) -> bool {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(key) else {
            return false;
        };
        let Some(position) = task.requesters.iter().position(|(rid, _)| *rid == id) else {
            return false;
        };
        task.requesters.remove(position);

        if task.requesters.is_empty() && task.state == FetchState::Pending {
            state.tasks.remove(key);
            state.waiting.retain(|waiting| waiting != key);
            tracing::debug!(key = %key, "dropped abandoned waiting fetch");
        }
        true
    }

    pub fn state_of(&self, key: &CacheKey) -> Option<FetchState> {
        self.state.lock().tasks.get(key).map(|task| task.state)
    }

    pub fn requester_count(&self, key: &CacheKey) -> usize {
        self.state
            .lock()
            .tasks
            .get(key)
            .map_or(0, |task| task.requesters.len())
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }
}
