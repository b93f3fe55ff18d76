//! Grouping decoded events into transactions.
//!
//! A transaction type is a begin probe and an end probe. The tracker keeps a
//! stack of open instances per thread: a begin pushes, the matching end
//! closes, and any other event becomes a waypoint of the innermost open
//! instance. Distinct types nest freely. A second begin of a type that is
//! already open on the thread is re-entry and is resolved by the
//! [`ReentryPolicy`].
//!
//! Feed events in file order; the tracker separates threads itself, and
//! within a thread file order is sequence order.

use crate::profiler::events::ProbeEvent;
use crate::profiler::format::TraceHeader;
use crate::profiler::probe::ProbeId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionType {
    pub name: String,
    pub begin: ProbeId,
    pub end: ProbeId,
}

impl TransactionType {
    pub fn new(name: impl Into<String>, begin: ProbeId, end: ProbeId) -> Self {
        TransactionType {
            name: name.into(),
            begin,
            end,
        }
    }

    /// Look both probes up by name in a trace's probe map.
    pub fn by_name(header: &TraceHeader, name: impl Into<String>, begin: &str, end: &str) -> Option<Self> {
        Some(Self::new(name, header.lookup(begin)?, header.lookup(end)?))
    }
}

/// What happens when a transaction begins while one of the same type is
/// still open on the thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryPolicy {
    /// Close the open instance as abandoned and start a new one.
    #[default]
    AbandonOuter,
    /// Keep the open instance and ignore the inner begin event.
    IgnoreInner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Began and ended.
    Complete,
    /// Replaced by a re-entrant begin of the same type.
    Abandoned,
    /// Still open when the event stream ended.
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionInstance {
    /// Assigned in the order instances were opened.
    pub id: u64,
    /// Index of the type in the tracker's type list.
    pub kind: usize,
    pub thread_id: u32,
    /// Begin event, waypoints, and the end event when complete.
    pub events: Vec<ProbeEvent>,
    pub completion: Completion,
}

impl TransactionInstance {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }

    pub fn begin(&self) -> &ProbeEvent {
        &self.events[0]
    }

    pub fn end(&self) -> Option<&ProbeEvent> {
        if self.is_complete() {
            self.events.last()
        } else {
            None
        }
    }

    /// Elapsed ticks from begin to end, if complete and not running backwards.
    pub fn duration_ticks(&self) -> Option<u64> {
        self.end()?.timestamp.checked_sub(self.begin().timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A begin arrived while an instance of the same type was open.
    Reentrant {
        transaction: usize,
        thread_id: u32,
        /// The open instance at the time.
        instance: u64,
        sequence: u64,
    },
    /// An end arrived with no open instance of its type.
    OrphanEnd {
        transaction: usize,
        thread_id: u32,
        sequence: u64,
    },
    /// The instance was still open when the stream ended.
    LeftOpen {
        transaction: usize,
        thread_id: u32,
        instance: u64,
    },
}

struct Open {
    id: u64,
    kind: usize,
    events: Vec<ProbeEvent>,
}

impl Open {
    fn finish(self, thread_id: u32, completion: Completion) -> TransactionInstance {
        TransactionInstance {
            id: self.id,
            kind: self.kind,
            thread_id,
            events: self.events,
            completion,
        }
    }
}

pub type Emitted = SmallVec<[TransactionInstance; 2]>;

pub struct TransactionTracker {
    types: Vec<TransactionType>,
    policy: ReentryPolicy,
    /// Open instances per thread, innermost last.
    open: BTreeMap<u32, Vec<Open>>,
    next_id: u64,
    diagnostics: Vec<Diagnostic>,
    unattributed: u64,
}

impl TransactionTracker {
    pub fn new(types: Vec<TransactionType>) -> Self {
        TransactionTracker {
            types,
            policy: ReentryPolicy::default(),
            open: BTreeMap::new(),
            next_id: 0,
            diagnostics: Vec::new(),
            unattributed: 0,
        }
    }

    pub fn with_policy(mut self, policy: ReentryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn types(&self) -> &[TransactionType] {
        &self.types
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Events that fell outside every open transaction.
    pub fn unattributed(&self) -> u64 {
        self.unattributed
    }

    /// Number of instances currently open across all threads.
    pub fn open_count(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }

    /// Process one event. Returns the instances it closed or abandoned.
    pub fn push(&mut self, event: &ProbeEvent) -> Emitted {
        let mut emitted = Emitted::new();
        let stack = self.open.entry(event.thread_id).or_default();
        let mut consumed = false;

        for (kind, ty) in self.types.iter().enumerate() {
            if ty.end != event.probe_id {
                continue;
            }
            consumed = true;
            match stack.iter().rposition(|o| o.kind == kind) {
                Some(pos) => {
                    let mut open = stack.remove(pos);
                    open.events.push(event.clone());
                    emitted.push(open.finish(event.thread_id, Completion::Complete));
                }
                None if ty.begin == event.probe_id => {}
                None => self.diagnostics.push(Diagnostic::OrphanEnd {
                    transaction: kind,
                    thread_id: event.thread_id,
                    sequence: event.sequence,
                }),
            }
        }

        for (kind, ty) in self.types.iter().enumerate() {
            if ty.begin != event.probe_id {
                continue;
            }
            consumed = true;
            if let Some(pos) = stack.iter().rposition(|o| o.kind == kind) {
                self.diagnostics.push(Diagnostic::Reentrant {
                    transaction: kind,
                    thread_id: event.thread_id,
                    instance: stack[pos].id,
                    sequence: event.sequence,
                });
                match self.policy {
                    ReentryPolicy::IgnoreInner => continue,
                    ReentryPolicy::AbandonOuter => {
                        let outer = stack.remove(pos);
                        emitted.push(outer.finish(event.thread_id, Completion::Abandoned));
                    }
                }
            }
            stack.push(Open {
                id: self.next_id,
                kind,
                events: vec![event.clone()],
            });
            self.next_id += 1;
        }

        if !consumed {
            match stack.last_mut() {
                Some(open) => open.events.push(event.clone()),
                None => self.unattributed += 1,
            }
        }
        emitted
    }

    /// End of stream: every instance still open is returned as truncated,
    /// grouped by thread, outermost first.
    pub fn finish(&mut self) -> Vec<TransactionInstance> {
        let mut truncated = Vec::new();
        for (thread_id, stack) in std::mem::take(&mut self.open) {
            for open in stack {
                self.diagnostics.push(Diagnostic::LeftOpen {
                    transaction: open.kind,
                    thread_id,
                    instance: open.id,
                });
                truncated.push(open.finish(thread_id, Completion::Truncated));
            }
        }
        truncated
    }
}

/// Everything the tracker made of one event stream.
#[derive(Debug, Clone, Serialize)]
pub struct Reconstruction {
    /// In the order they closed; truncated instances last.
    pub instances: Vec<TransactionInstance>,
    pub diagnostics: Vec<Diagnostic>,
    pub unattributed: u64,
}

impl Reconstruction {
    pub fn complete(&self) -> impl Iterator<Item = &TransactionInstance> {
        self.instances.iter().filter(|i| i.is_complete())
    }
}

pub fn reconstruct(
    types: Vec<TransactionType>,
    policy: ReentryPolicy,
    events: &[ProbeEvent],
) -> Reconstruction {
    let mut tracker = TransactionTracker::new(types).with_policy(policy);
    let mut instances = Vec::new();
    for event in events {
        instances.extend(tracker.push(event));
    }
    instances.extend(tracker.finish());
    Reconstruction {
        instances,
        diagnostics: tracker.diagnostics,
        unattributed: tracker.unattributed,
    }
}
