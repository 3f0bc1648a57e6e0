//! Resource arbiter.
//!
//! A finite named set of counted resources (e.g. `llm_api: 3`,
//! `video_encoder: 1`). Acquisition is all-or-nothing and proceeds in
//! lexicographic resource order so every caller observes the same global
//! lock order. Requests carry a monotonic ticket; a free unit is granted to
//! the lowest ticket that is ready for it, which keeps grant order equal to
//! dispatch order. A bipartite wait-for graph is checked before any new wait
//! edge is introduced; a request that would close a cycle fails fast with
//! [`ResourceError::DeadlockDetected`] instead of blocking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Resource arbitration errors.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unknown resource: {0}")]
    Unknown(String),

    /// The request can never be satisfied; a programming error, not retried.
    #[error("request exceeds pool capacity for resource: {0}")]
    Infeasible(String),

    /// Granting the wait would close a cycle in the wait-for graph.
    #[error("deadlock refused for holder {0}")]
    DeadlockDetected(String),

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("unknown reservation ticket: {0}")]
    UnknownTicket(u64),
}

/// Point-in-time usage of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub name: String,
    pub capacity: u32,
    pub in_use: u32,
    pub waiting: u32,
}

/// Handle for a registered request; grant order follows ticket order.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    ticket: u64,
}

struct Request {
    holder: String,
    remaining: BTreeSet<String>,
}

impl Request {
    /// Acquisition walks resources in lexicographic order, so the next
    /// resource a request will wait on is the smallest remaining one.
    fn next_resource(&self) -> Option<&String> {
        self.remaining.iter().next()
    }
}

#[derive(Default)]
struct PoolState {
    capacity: BTreeMap<String, u32>,
    available: BTreeMap<String, u32>,
    /// holder -> resources held (one unit each)
    held: HashMap<String, BTreeSet<String>>,
    /// ticket -> in-flight request
    requests: BTreeMap<u64, Request>,
    next_ticket: u64,
}

impl PoolState {
    fn holders_of(&self, resource: &str) -> Vec<&str> {
        self.held
            .iter()
            .filter(|(_, resources)| resources.contains(resource))
            .map(|(holder, _)| holder.as_str())
            .collect()
    }

    fn request_of_holder(&self, holder: &str) -> Option<&Request> {
        self.requests.values().find(|r| r.holder == holder)
    }

    /// Would `start` waiting on `resource` close a cycle? Walk from the
    /// resource's holders through whatever they in turn wait on.
    fn would_deadlock(&self, start: &str, resource: &str) -> bool {
        let mut stack: Vec<&str> = self.holders_of(resource);
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        while let Some(holder) = stack.pop() {
            if holder == start {
                return true;
            }
            if !seen.insert(holder) {
                continue;
            }
            if let Some(waited) = self
                .request_of_holder(holder)
                .and_then(Request::next_resource)
            {
                stack.extend(self.holders_of(waited));
            }
        }
        false
    }

    /// A unit of `resource` goes to ticket `t` only if no lower ticket is
    /// ready for the same resource.
    fn grantable(&self, ticket: u64, resource: &str) -> bool {
        if self.available.get(resource).copied().unwrap_or(0) == 0 {
            return false;
        }
        !self
            .requests
            .range(..ticket)
            .any(|(_, other)| other.next_resource().map(String::as_str) == Some(resource))
    }

    fn release_holder(&mut self, holder: &str) -> usize {
        let resources = self.held.remove(holder).unwrap_or_default();
        for resource in &resources {
            if let Some(available) = self.available.get_mut(resource) {
                *available += 1;
            }
        }
        resources.len()
    }

    fn drop_request(&mut self, ticket: u64) {
        self.requests.remove(&ticket);
    }
}

/// Named counted semaphore pool with deadlock refusal.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl ResourcePool {
    pub fn new(capacities: BTreeMap<String, u32>) -> Self {
        let state = PoolState {
            available: capacities.clone(),
            capacity: capacities,
            ..PoolState::default()
        };
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Early feasibility check, used by dry runs and at execute entry.
    pub fn check_request(&self, needed: &BTreeSet<String>) -> Result<(), ResourceError> {
        let state = self.state.lock().expect("pool lock");
        for resource in needed {
            match state.capacity.get(resource) {
                None => return Err(ResourceError::Unknown(resource.clone())),
                Some(0) => return Err(ResourceError::Infeasible(resource.clone())),
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Register a request and take its place in the grant order.
    pub fn reserve(
        &self,
        holder: &str,
        needed: &BTreeSet<String>,
    ) -> Result<Reservation, ResourceError> {
        self.check_request(needed)?;
        let mut state = self.state.lock().expect("pool lock");
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.requests.insert(
            ticket,
            Request {
                holder: holder.to_string(),
                remaining: needed.clone(),
            },
        );
        Ok(Reservation { ticket })
    }

    /// Block until every reserved unit is held, or nothing is.
    ///
    /// On deadlock refusal or cancellation all units already granted to the
    /// reservation's holder are returned.
    pub async fn wait(
        &self,
        reservation: Reservation,
        cancel: &CancellationToken,
    ) -> Result<(), ResourceError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let progressed = {
                let mut state = self.state.lock().expect("pool lock");
                let Some(request) = state.requests.get(&reservation.ticket) else {
                    return Err(ResourceError::UnknownTicket(reservation.ticket));
                };
                let holder = request.holder.clone();
                let Some(resource) = request.next_resource().cloned() else {
                    state.drop_request(reservation.ticket);
                    return Ok(());
                };

                if state.grantable(reservation.ticket, &resource) {
                    *state.available.get_mut(&resource).expect("known resource") -= 1;
                    state
                        .held
                        .entry(holder.clone())
                        .or_default()
                        .insert(resource.clone());
                    let request = state
                        .requests
                        .get_mut(&reservation.ticket)
                        .expect("live request");
                    request.remaining.remove(&resource);
                    if request.remaining.is_empty() {
                        state.drop_request(reservation.ticket);
                        return Ok(());
                    }
                    true
                } else {
                    if state.would_deadlock(&holder, &resource) {
                        state.drop_request(reservation.ticket);
                        let released = state.release_holder(&holder);
                        drop(state);
                        if released > 0 {
                            self.notify.notify_waiters();
                        }
                        tracing::warn!(holder, resource, "resource wait refused: cycle");
                        return Err(ResourceError::DeadlockDetected(holder));
                    }
                    false
                }
            };

            if progressed {
                continue;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    let released = {
                        let mut state = self.state.lock().expect("pool lock");
                        let holder = state
                            .requests
                            .get(&reservation.ticket)
                            .map(|r| r.holder.clone());
                        state.drop_request(reservation.ticket);
                        holder.map(|h| state.release_holder(&h)).unwrap_or(0)
                    };
                    if released > 0 {
                        self.notify.notify_waiters();
                    }
                    return Err(ResourceError::Cancelled);
                }
            }
        }
    }

    /// Acquire one unit of every named resource, or nothing.
    pub async fn acquire(
        &self,
        holder: &str,
        needed: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ResourceError> {
        let reservation = self.reserve(holder, needed)?;
        self.wait(reservation, cancel).await
    }

    /// Return every unit held by `holder` and wake waiters.
    pub fn release(&self, holder: &str) {
        let released = {
            let mut state = self.state.lock().expect("pool lock");
            state.release_holder(holder)
        };
        if released > 0 {
            self.notify.notify_waiters();
        }
    }

    /// Usage snapshot per resource.
    pub fn usage(&self) -> Vec<ResourceUsage> {
        let state = self.state.lock().expect("pool lock");
        state
            .capacity
            .iter()
            .map(|(name, capacity)| {
                let available = state.available.get(name).copied().unwrap_or(0);
                let waiting = state
                    .requests
                    .values()
                    .filter(|r| r.next_resource().map(String::as_str) == Some(name))
                    .count() as u32;
                ResourceUsage {
                    name: name.clone(),
                    capacity: *capacity,
                    in_use: capacity - available,
                    waiting,
                }
            })
            .collect()
    }
}
