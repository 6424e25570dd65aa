//! JIT dylibs, symbol tables, and resource trackers
//!
//! A [`JitDylib`] is a symbol table whose entries move through a small state
//! machine: claimed (materializing), resolved to an address, or failed.
//! Claiming happens before compilation so concurrent adds of the same name
//! are rejected up front; publication happens after linking. Lookups that hit
//! a claimed symbol block on a condvar until the claim is published, failed,
//! or abandoned.
//!
//! Every definition is owned by a [`ResourceTracker`]. Removing a tracker
//! drops its symbols and unmaps the code and data blocks linked under it;
//! the rest of the dylib is untouched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::generator::DefinitionGenerator;
use crate::link::memory::MappedBlock;

/// Attributes of a published symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFlags {
    pub exported: bool,
    pub callable: bool,
    pub weak: bool,
}

impl SymbolFlags {
    /// Flags for an exported function
    pub fn code() -> Self {
        SymbolFlags { exported: true, callable: true, weak: false }
    }

    /// Flags for an exported data symbol
    pub fn data() -> Self {
        SymbolFlags { exported: true, callable: false, weak: false }
    }
}

/// A resolved symbol: an address in the current process plus flags
#[derive(Debug, Clone, Copy)]
pub struct SymbolDef {
    pub address: usize,
    pub flags: SymbolFlags,
}

/// Materialization state of one symbol table entry
#[derive(Debug, Clone)]
enum SymbolState {
    /// Claimed by an in-flight add; waiters block until this settles
    Materializing,
    Resolved(SymbolDef),
    Failed(String),
}

struct SymbolEntry {
    state: SymbolState,
    tracker: u64,
}

#[derive(Default)]
struct DylibState {
    symbols: FxHashMap<String, SymbolEntry>,
    /// Finalized memory owned per tracker; dropping unmaps
    resources: FxHashMap<u64, Vec<MappedBlock>>,
}

/// Claiming or publishing symbols failed
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("duplicate definition of symbol '{name}' in dylib {dylib}")]
    Duplicate { dylib: String, name: String },
    #[error("resource tracker was removed while its module was in flight")]
    TrackerRemoved,
    #[error("no definition was produced for claimed symbol '{name}'")]
    MissingDefinition { name: String },
}

/// Removing a resource tracker failed
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("the default tracker of dylib {0} cannot be removed")]
    DefaultTracker(String),
    #[error("tracker already removed")]
    AlreadyRemoved,
}

/// A symbol lookup failed
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("symbol '{name}' not found")]
    Unresolved { name: String },
    #[error("symbol '{name}' failed to materialize: {reason}")]
    MaterializationFailed { name: String, reason: String },
    #[error("definition generator failed for '{name}': {reason}")]
    Generator { name: String, reason: String },
}

const DEFAULT_TRACKER_ID: u64 = 0;

struct TrackerInner {
    id: u64,
    dylib: Weak<JitDylib>,
    defunct: AtomicBool,
}

/// Handle owning a set of definitions within one dylib
#[derive(Clone)]
pub struct ResourceTracker {
    inner: Arc<TrackerInner>,
}

impl ResourceTracker {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_defunct(&self) -> bool {
        self.inner.defunct.load(Ordering::Acquire)
    }

    /// The dylib this tracker belongs to, if it is still alive
    pub fn dylib(&self) -> Option<Arc<JitDylib>> {
        self.inner.dylib.upgrade()
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("id", &self.inner.id)
            .field("defunct", &self.is_defunct())
            .finish()
    }
}

/// A named JIT symbol table with generator fallback
pub struct JitDylib {
    name: String,
    state: Mutex<DylibState>,
    settled: Condvar,
    generators: Mutex<Vec<Box<dyn DefinitionGenerator>>>,
    default_tracker: ResourceTracker,
    next_tracker_id: AtomicU64,
}

impl JitDylib {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<JitDylib>| JitDylib {
            name,
            state: Mutex::new(DylibState::default()),
            settled: Condvar::new(),
            generators: Mutex::new(vec![]),
            default_tracker: ResourceTracker {
                inner: Arc::new(TrackerInner {
                    id: DEFAULT_TRACKER_ID,
                    dylib: weak.clone(),
                    defunct: AtomicBool::new(false),
                }),
            },
            next_tracker_id: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tracker definitions are absorbed into when no explicit tracker
    /// is given; it lives as long as the dylib.
    pub fn default_tracker(&self) -> ResourceTracker {
        self.default_tracker.clone()
    }

    /// Create a fresh tracker for a batch of definitions
    pub fn create_tracker(self: &Arc<Self>) -> ResourceTracker {
        ResourceTracker {
            inner: Arc::new(TrackerInner {
                id: self.next_tracker_id.fetch_add(1, Ordering::Relaxed),
                dylib: Arc::downgrade(self),
                defunct: AtomicBool::new(false),
            }),
        }
    }

    /// Install a definition generator. Generators are consulted in
    /// installation order when a lookup misses the symbol table.
    pub fn add_generator(&self, generator: Box<dyn DefinitionGenerator>) {
        self.generators.lock().push(generator);
    }

    /// Define a symbol at a fixed address under the default tracker
    pub fn define_absolute(
        &self,
        name: impl Into<String>,
        address: usize,
        flags: SymbolFlags,
    ) -> Result<(), MaterializeError> {
        let name = name.into();
        let mut state = self.state.lock();
        match state.symbols.get(&name) {
            Some(entry) if !matches!(entry.state, SymbolState::Failed(_)) => {
                return Err(MaterializeError::Duplicate { dylib: self.name.clone(), name });
            }
            _ => {}
        }
        state.symbols.insert(
            name,
            SymbolEntry {
                state: SymbolState::Resolved(SymbolDef { address, flags }),
                tracker: DEFAULT_TRACKER_ID,
            },
        );
        self.settled.notify_all();
        Ok(())
    }

    /// Claim a set of names for materialization. All-or-nothing: if any name
    /// is already live the whole claim is rejected and nothing changes.
    pub fn begin_materialization(
        self: &Arc<Self>,
        tracker: &ResourceTracker,
        names: Vec<String>,
    ) -> Result<MaterializationGuard, MaterializeError> {
        let mut state = self.state.lock();
        // Checked under the lock. `remove_tracker` flips the flag before it
        // takes the lock, so entries inserted by a claim that observed the
        // tracker live are swept by that removal's own lock section.
        if tracker.is_defunct() {
            return Err(MaterializeError::TrackerRemoved);
        }
        for name in &names {
            if let Some(entry) = state.symbols.get(name) {
                // A failed entry may be re-claimed; live ones may not.
                if !matches!(entry.state, SymbolState::Failed(_)) {
                    return Err(MaterializeError::Duplicate {
                        dylib: self.name.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
        for name in &names {
            state.symbols.insert(
                name.clone(),
                SymbolEntry { state: SymbolState::Materializing, tracker: tracker.id() },
            );
        }
        Ok(MaterializationGuard {
            dylib: Arc::clone(self),
            tracker: tracker.clone(),
            names,
            settled: false,
        })
    }

    /// Resolve a name in this dylib, blocking while it is materializing.
    /// Falls back to the installed generators; generator hits are absorbed
    /// under the default tracker. Returns `Ok(None)` when nothing knows the
    /// symbol.
    pub fn resolve_blocking(&self, name: &str) -> Result<Option<SymbolDef>, LookupError> {
        {
            let mut state = self.state.lock();
            loop {
                match state.symbols.get(name).map(|e| e.state.clone()) {
                    Some(SymbolState::Resolved(def)) => return Ok(Some(def)),
                    Some(SymbolState::Failed(reason)) => {
                        return Err(LookupError::MaterializationFailed {
                            name: name.to_string(),
                            reason,
                        })
                    }
                    Some(SymbolState::Materializing) => {
                        self.settled.wait(&mut state);
                    }
                    None => break,
                }
            }
        }

        let generators = self.generators.lock();
        for generator in generators.iter() {
            let found = generator.try_generate(name).map_err(|e| LookupError::Generator {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(def) = found {
                let mut state = self.state.lock();
                // Another thread may have raced the same generator.
                if let Some(SymbolEntry { state: SymbolState::Resolved(existing), .. }) =
                    state.symbols.get(name)
                {
                    return Ok(Some(*existing));
                }
                state.symbols.insert(
                    name.to_string(),
                    SymbolEntry { state: SymbolState::Resolved(def), tracker: DEFAULT_TRACKER_ID },
                );
                return Ok(Some(def));
            }
        }
        Ok(None)
    }

    /// Non-blocking probe of the symbol table only (no generators)
    pub fn try_resolve(&self, name: &str) -> Option<SymbolDef> {
        match self.state.lock().symbols.get(name)?.state {
            SymbolState::Resolved(def) => Some(def),
            _ => None,
        }
    }

    /// Remove a tracker: its symbols disappear and its memory is unmapped
    pub fn remove_tracker(&self, tracker: &ResourceTracker) -> Result<(), RemoveError> {
        if tracker.id() == DEFAULT_TRACKER_ID {
            return Err(RemoveError::DefaultTracker(self.name.clone()));
        }
        if tracker.inner.defunct.swap(true, Ordering::AcqRel) {
            return Err(RemoveError::AlreadyRemoved);
        }
        let blocks;
        {
            let mut state = self.state.lock();
            state.symbols.retain(|_, entry| entry.tracker != tracker.id());
            blocks = state.resources.remove(&tracker.id());
            self.settled.notify_all();
        }
        // Unmap outside the lock.
        drop(blocks);
        Ok(())
    }

    /// Render the symbol table for diagnostics
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut lines: Vec<String> = state
            .symbols
            .iter()
            .map(|(name, entry)| match &entry.state {
                SymbolState::Resolved(def) => {
                    format!("  \"{name}\": {:#x} [tracker {}]", def.address, entry.tracker)
                }
                SymbolState::Materializing => {
                    format!("  \"{name}\": <materializing> [tracker {}]", entry.tracker)
                }
                SymbolState::Failed(reason) => format!("  \"{name}\": <failed: {reason}>"),
            })
            .collect();
        lines.sort();
        format!("dylib \"{}\":\n{}\n", self.name, lines.join("\n"))
    }

    fn settle(
        &self,
        guard_names: &[String],
        tracker: &ResourceTracker,
        outcome: SettleOutcome,
    ) {
        let mut state = self.state.lock();
        match outcome {
            SettleOutcome::Fail(reason) => {
                for name in guard_names {
                    state.symbols.insert(
                        name.clone(),
                        SymbolEntry {
                            state: SymbolState::Failed(reason.clone()),
                            tracker: tracker.id(),
                        },
                    );
                }
            }
            SettleOutcome::Abandon => {
                Self::release_claims(&mut state, guard_names, tracker);
            }
        }
        self.settled.notify_all();
    }

    /// Publish resolved definitions for a guard's claimed names. The tracker
    /// liveness re-check happens under the state lock, so a removal that
    /// raced the publication either sweeps the published entries itself or
    /// forces the publication to cancel; it can never lose to it.
    fn try_publish(
        &self,
        guard_names: &[String],
        tracker: &ResourceTracker,
        mut defs: FxHashMap<String, SymbolDef>,
        blocks: Vec<MappedBlock>,
    ) -> Result<(), MaterializeError> {
        let cancelled;
        {
            let mut state = self.state.lock();
            if tracker.is_defunct() {
                Self::release_claims(&mut state, guard_names, tracker);
                self.settled.notify_all();
                cancelled = blocks;
            } else {
                for name in guard_names {
                    if let Some(def) = defs.remove(name.as_str()) {
                        state.symbols.insert(
                            name.clone(),
                            SymbolEntry {
                                state: SymbolState::Resolved(def),
                                tracker: tracker.id(),
                            },
                        );
                    }
                }
                state.resources.entry(tracker.id()).or_default().extend(blocks);
                self.settled.notify_all();
                return Ok(());
            }
        }
        // Unmap outside the lock.
        drop(cancelled);
        Err(MaterializeError::TrackerRemoved)
    }

    /// Drop the `Materializing` entries a guard claimed, leaving anything
    /// another owner published under the same names untouched
    fn release_claims(state: &mut DylibState, names: &[String], tracker: &ResourceTracker) {
        for name in names {
            if let Some(entry) = state.symbols.get(name) {
                if matches!(entry.state, SymbolState::Materializing)
                    && entry.tracker == tracker.id()
                {
                    state.symbols.remove(name);
                }
            }
        }
    }
}

enum SettleOutcome {
    Fail(String),
    Abandon,
}

/// Ownership of a set of claimed symbols, from claim to publication.
/// Dropping the guard without publishing releases the claims so blocked
/// lookups can proceed to the generators.
pub struct MaterializationGuard {
    dylib: Arc<JitDylib>,
    tracker: ResourceTracker,
    names: Vec<String>,
    settled: bool,
}

impl MaterializationGuard {
    /// Mangled names this guard has claimed
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dylib(&self) -> &Arc<JitDylib> {
        &self.dylib
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Claim additional names under the same tracker. Used by the linking
    /// layer to absorb exported definitions an object carries beyond the
    /// requested set. Returns the names that could not be claimed because a
    /// live definition already exists; the caller decides whether that is a
    /// duplicate error.
    pub fn claim_extra(&mut self, names: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut state = self.dylib.state.lock();
        let mut rejected = vec![];
        for name in names {
            if self.names.contains(&name) {
                continue;
            }
            if let Some(entry) = state.symbols.get(&name) {
                if !matches!(entry.state, SymbolState::Failed(_)) {
                    rejected.push(name);
                    continue;
                }
            }
            state.symbols.insert(
                name.clone(),
                SymbolEntry { state: SymbolState::Materializing, tracker: self.tracker.id() },
            );
            self.names.push(name);
        }
        rejected
    }

    /// Publish definitions for every claimed name and hand the finalized
    /// memory to the tracker. Fails if the tracker was removed while the
    /// module was in flight; the claims are released and the memory is
    /// unmapped in that case.
    pub fn publish(
        mut self,
        defs: FxHashMap<String, SymbolDef>,
        blocks: Vec<MappedBlock>,
    ) -> Result<(), MaterializeError> {
        for name in &self.names {
            if !defs.contains_key(name.as_str()) {
                let name = name.clone();
                self.settled = true;
                self.dylib.settle(&self.names, &self.tracker, SettleOutcome::Abandon);
                return Err(MaterializeError::MissingDefinition { name });
            }
        }
        self.settled = true;
        self.dylib.try_publish(&self.names, &self.tracker, defs, blocks)
    }

    /// Mark every claimed name as failed
    pub fn fail(mut self, reason: impl Into<String>) {
        self.settled = true;
        self.dylib.settle(&self.names, &self.tracker, SettleOutcome::Fail(reason.into()));
    }
}

impl Drop for MaterializationGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.dylib.settle(&self.names, &self.tracker, SettleOutcome::Abandon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(address: usize) -> SymbolDef {
        SymbolDef { address, flags: SymbolFlags::code() }
    }

    #[test]
    fn test_define_and_resolve() {
        let dylib = JitDylib::new("main");
        dylib.define_absolute("answer", 0x1000, SymbolFlags::code()).unwrap();
        let found = dylib.resolve_blocking("answer").unwrap().unwrap();
        assert_eq!(found.address, 0x1000);
        assert!(dylib.resolve_blocking("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_claim_rejected() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.default_tracker();
        let guard = dylib
            .begin_materialization(&tracker, vec!["f".to_string()])
            .unwrap();
        let dup = dylib.begin_materialization(&tracker, vec!["f".to_string()]);
        assert!(matches!(dup, Err(MaterializeError::Duplicate { .. })));
        drop(guard);
        // Abandoned claim frees the name.
        assert!(dylib.begin_materialization(&tracker, vec!["f".to_string()]).is_ok());
    }

    #[test]
    fn test_publish_makes_symbol_visible() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.default_tracker();
        let guard = dylib
            .begin_materialization(&tracker, vec!["f".to_string()])
            .unwrap();
        let mut defs = FxHashMap::default();
        defs.insert("f".to_string(), def(0x2000));
        guard.publish(defs, vec![]).unwrap();
        assert_eq!(dylib.try_resolve("f").unwrap().address, 0x2000);
    }

    #[test]
    fn test_failed_claim_reports_reason() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.default_tracker();
        let guard = dylib
            .begin_materialization(&tracker, vec!["f".to_string()])
            .unwrap();
        guard.fail("codegen exploded");
        let err = dylib.resolve_blocking("f").unwrap_err();
        assert!(matches!(err, LookupError::MaterializationFailed { .. }));
        // Failed entries may be re-claimed.
        assert!(dylib.begin_materialization(&tracker, vec!["f".to_string()]).is_ok());
    }

    #[test]
    fn test_remove_tracker_drops_symbols() {
        let dylib = JitDylib::new("main");
        let t1 = dylib.create_tracker();
        let t2 = dylib.create_tracker();
        for (tracker, name, addr) in [(&t1, "a", 0x10), (&t2, "b", 0x20)] {
            let guard = dylib
                .begin_materialization(tracker, vec![name.to_string()])
                .unwrap();
            let mut defs = FxHashMap::default();
            defs.insert(name.to_string(), def(addr));
            guard.publish(defs, vec![]).unwrap();
        }

        dylib.remove_tracker(&t1).unwrap();
        assert!(dylib.try_resolve("a").is_none());
        assert_eq!(dylib.try_resolve("b").unwrap().address, 0x20);
        assert!(matches!(dylib.remove_tracker(&t1), Err(RemoveError::AlreadyRemoved)));
    }

    #[test]
    fn test_default_tracker_cannot_be_removed() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.default_tracker();
        assert!(matches!(dylib.remove_tracker(&tracker), Err(RemoveError::DefaultTracker(_))));
    }

    #[test]
    fn test_publish_after_removal_is_cancelled() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.create_tracker();
        let guard = dylib
            .begin_materialization(&tracker, vec!["f".to_string()])
            .unwrap();
        dylib.remove_tracker(&tracker).unwrap();

        let mut defs = FxHashMap::default();
        defs.insert("f".to_string(), def(0x3000));
        let err = guard.publish(defs, vec![]).unwrap_err();
        assert!(matches!(err, MaterializeError::TrackerRemoved));
        assert!(dylib.try_resolve("f").is_none());
    }

    #[test]
    fn test_racing_removal_never_loses_to_publish() {
        // Publication and removal race from two threads. Whichever order the
        // locks settle in, a completed removal must leave neither a visible
        // symbol nor live resources behind.
        for _ in 0..200 {
            let dylib = JitDylib::new("main");
            let tracker = dylib.create_tracker();
            let guard = dylib
                .begin_materialization(&tracker, vec!["f".to_string()])
                .unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let publisher = {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut defs = FxHashMap::default();
                    defs.insert("f".to_string(), def(0x5000));
                    barrier.wait();
                    let _ = guard.publish(defs, vec![]);
                })
            };
            let remover = {
                let dylib = Arc::clone(&dylib);
                let tracker = tracker.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    dylib.remove_tracker(&tracker).unwrap();
                })
            };
            publisher.join().unwrap();
            remover.join().unwrap();

            assert!(dylib.try_resolve("f").is_none());
            assert!(dylib.state.lock().resources.get(&tracker.id()).is_none());
        }
    }

    #[test]
    fn test_lookup_blocks_until_published() {
        let dylib = JitDylib::new("main");
        let tracker = dylib.default_tracker();
        let guard = dylib
            .begin_materialization(&tracker, vec!["slow".to_string()])
            .unwrap();

        let waiter = {
            let dylib = Arc::clone(&dylib);
            std::thread::spawn(move || dylib.resolve_blocking("slow"))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut defs = FxHashMap::default();
        defs.insert("slow".to_string(), def(0x4000));
        guard.publish(defs, vec![]).unwrap();

        let found = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(found.address, 0x4000);
    }

    #[test]
    fn test_dump_lists_symbols() {
        let dylib = JitDylib::new("main");
        dylib.define_absolute("x", 0x1000, SymbolFlags::data()).unwrap();
        let text = dylib.dump();
        assert!(text.contains("dylib \"main\""));
        assert!(text.contains("\"x\": 0x1000"));
    }
}
