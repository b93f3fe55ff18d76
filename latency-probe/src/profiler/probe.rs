//! Probe identity and the registry that assigns it.
//!
//! Probes are registered during an explicit initialization phase through
//! [`ProbeRegistry::builder`]. Once built, the registry's identities are
//! immutable; only the per-probe enabled flags change, and those are plain
//! atomics read with relaxed ordering on the hot path.

use crate::profiler::error::RegistryError;
use crate::profiler::recorder::SharedState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stable numeric probe identity, assigned in registration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProbeId(u32);

impl ProbeId {
    pub const fn from_u32(id: u32) -> Self {
        ProbeId(id)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a registered probe, as persisted in the trace header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub name: String,
    /// `file:line:column` of the registration call, or whatever the host supplied.
    pub location: String,
    pub category: String,
}

pub const DEFAULT_CATEGORY: &str = "default";

/// Collects probe definitions before any probe can fire.
#[derive(Debug, Default)]
pub struct ProbeRegistryBuilder {
    probes: Vec<ProbeInfo>,
    start_disabled: bool,
}

impl ProbeRegistryBuilder {
    /// Register a probe in the default category. The caller's source
    /// location becomes the probe's location.
    #[track_caller]
    pub fn register(&mut self, name: impl Into<String>) -> ProbeId {
        self.register_in(name, DEFAULT_CATEGORY)
    }

    /// Register a probe with a category tag, for bulk toggling.
    #[track_caller]
    pub fn register_in(&mut self, name: impl Into<String>, category: impl Into<String>) -> ProbeId {
        let caller = Location::caller();
        let location = format!("{}:{}:{}", caller.file(), caller.line(), caller.column());
        self.register_at(name, location, category)
    }

    /// Register a probe with an explicit location string.
    pub fn register_at(
        &mut self,
        name: impl Into<String>,
        location: impl Into<String>,
        category: impl Into<String>,
    ) -> ProbeId {
        let id = ProbeId(self.probes.len() as u32);
        self.probes.push(ProbeInfo {
            id,
            name: name.into(),
            location: location.into(),
            category: category.into(),
        });
        id
    }

    /// Probes start enabled unless this is set.
    pub fn start_disabled(&mut self, disabled: bool) -> &mut Self {
        self.start_disabled = disabled;
        self
    }

    pub fn build(self) -> Result<ProbeRegistry, RegistryError> {
        if self.probes.len() > u32::MAX as usize {
            return Err(RegistryError::TooManyProbes);
        }
        let mut by_name = HashMap::with_capacity(self.probes.len());
        for probe in &self.probes {
            if probe.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            for (field, value) in [
                ("name", &probe.name),
                ("location", &probe.location),
                ("category", &probe.category),
            ] {
                if value.len() > u16::MAX as usize {
                    return Err(RegistryError::StringTooLong {
                        field,
                        len: value.len(),
                    });
                }
            }
            if by_name.insert(probe.name.clone(), probe.id).is_some() {
                return Err(RegistryError::DuplicateName(probe.name.clone()));
            }
        }
        let flags = self
            .probes
            .iter()
            .map(|_| AtomicBool::new(!self.start_disabled))
            .collect();
        Ok(ProbeRegistry {
            probes: self.probes,
            flags,
            by_name,
        })
    }
}

/// Process-lifetime probe map plus the runtime activation flags.
pub struct ProbeRegistry {
    probes: Vec<ProbeInfo>,
    flags: Box<[AtomicBool]>,
    by_name: HashMap<String, ProbeId>,
}

impl ProbeRegistry {
    pub fn builder() -> ProbeRegistryBuilder {
        ProbeRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn info(&self, id: ProbeId) -> Option<&ProbeInfo> {
        self.probes.get(id.index())
    }

    pub fn lookup(&self, name: &str) -> Option<ProbeId> {
        self.by_name.get(name).copied()
    }

    pub fn probes(&self) -> &[ProbeInfo] {
        &self.probes
    }

    pub fn is_enabled(&self, id: ProbeId) -> bool {
        self.flags
            .get(id.index())
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Returns false if `id` is not registered.
    pub(crate) fn set_enabled(&self, id: ProbeId, enabled: bool) -> bool {
        match self.flags.get(id.index()) {
            Some(flag) => {
                flag.store(enabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Set every probe whose category matches; returns how many matched.
    pub(crate) fn set_category_enabled(&self, category: &str, enabled: bool) -> usize {
        let mut matched = 0;
        for probe in self.probes.iter().filter(|p| p.category == category) {
            self.flags[probe.id.index()].store(enabled, Ordering::Relaxed);
            matched += 1;
        }
        matched
    }

    pub(crate) fn set_all_enabled(&self, enabled: bool) {
        for flag in self.flags.iter() {
            flag.store(enabled, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    fn flag(&self, id: ProbeId) -> &AtomicBool {
        &self.flags[id.index()]
    }
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("probes", &self.probes.len())
            .finish_non_exhaustive()
    }
}

/// Handle used at an instrumentation site. Cheap to clone; obtain one from
/// [`Profiler::probe`](crate::profiler::Profiler::probe).
#[derive(Clone)]
pub struct Probe {
    id: ProbeId,
    shared: Arc<SharedState>,
}

impl Probe {
    pub(crate) fn new(id: ProbeId, shared: Arc<SharedState>) -> Self {
        Probe { id, shared }
    }

    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn info(&self) -> &ProbeInfo {
        &self.shared.registry.probes()[self.id.index()]
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.registry.flag(self.id).load(Ordering::Relaxed)
    }

    /// Record one event for this probe on the calling thread.
    ///
    /// A disabled probe returns after a single flag check. An enabled probe
    /// reads the tick counter (and configured hardware counters) and appends
    /// to the thread's recording buffer; it never blocks, allocates or makes
    /// a syscall once the thread's buffer exists.
    #[inline]
    pub fn fire(&self) {
        if !self.shared.registry.flag(self.id).load(Ordering::Relaxed) {
            return;
        }
        self.shared.record(self.id);
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe").field("id", &self.id).finish()
    }
}
