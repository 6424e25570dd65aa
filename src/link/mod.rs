//! Object linking layer
//!
//! Lays compiled objects out in executable memory, patches relocations
//! against intra-object definitions and symbols resolved through the target
//! dylib, flips the code pages to read-execute, and publishes the resulting
//! addresses through the materialization guard. The mapped blocks travel
//! with the guard's resource tracker, so removing the tracker unmaps them.

pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::backend::{CompiledObject, RelocKind};
use crate::dylib::{
    LookupError, MaterializationGuard, MaterializeError, SymbolDef, SymbolFlags,
};
use crate::ir::Linkage;
use memory::{MappedBlock, MemoryError, MemoryManager, PageAllocator, Protection};

/// Linking a compiled object failed
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("undefined symbol '{name}' referenced by {referencer}")]
    Unresolved { name: String, referencer: String },
    #[error("relocation against '{target}' in {referencer} is out of range")]
    RelocOutOfRange { target: String, referencer: String },
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Placement of one defined symbol within the object's layout
struct Placement {
    code: bool,
    offset: usize,
    exported: bool,
    callable: bool,
}

/// Links compiled objects into a dylib
pub struct ObjectLinkingLayer {
    memory: Box<dyn MemoryManager>,
    autoclaim_exports: AtomicBool,
}

impl ObjectLinkingLayer {
    pub fn new() -> Self {
        ObjectLinkingLayer::with_memory(Box::new(PageAllocator))
    }

    pub fn with_memory(memory: Box<dyn MemoryManager>) -> Self {
        ObjectLinkingLayer { memory, autoclaim_exports: AtomicBool::new(false) }
    }

    /// When enabled, exported definitions an object carries beyond the
    /// claimed set are claimed and published as well instead of being
    /// dropped. Needed for COFF-style objects where associated definitions
    /// appear without a prior claim.
    pub fn set_autoclaim_exports(&self, on: bool) {
        self.autoclaim_exports.store(on, Ordering::Relaxed);
    }

    pub fn autoclaim_exports(&self) -> bool {
        self.autoclaim_exports.load(Ordering::Relaxed)
    }

    /// Link one object and publish its exported symbols. On error the
    /// guard's claims are marked failed so blocked lookups see the failure.
    pub fn link(
        &self,
        mut guard: MaterializationGuard,
        object: CompiledObject,
    ) -> Result<(), LinkError> {
        match self.link_inner(&mut guard, object) {
            Ok((defs, blocks)) => {
                guard.publish(defs, blocks)?;
                Ok(())
            }
            Err(err) => {
                guard.fail(err.to_string());
                Err(err)
            }
        }
    }

    fn link_inner(
        &self,
        guard: &mut MaterializationGuard,
        object: CompiledObject,
    ) -> Result<(FxHashMap<String, SymbolDef>, Vec<MappedBlock>), LinkError> {
        if self.autoclaim_exports() {
            let extra: Vec<String> = object
                .functions
                .iter()
                .map(|f| (&f.name, f.linkage))
                .chain(object.data.iter().map(|d| (&d.name, d.linkage)))
                .filter(|(name, linkage)| {
                    *linkage == Linkage::Export && !guard.names().contains(*name)
                })
                .map(|(name, _)| name.clone())
                .collect();
            // A carried export colliding with a live definition rejects the
            // whole unit, the same as a collision on a claimed name.
            if let Some(name) = guard.claim_extra(extra).into_iter().next() {
                return Err(MaterializeError::Duplicate {
                    dylib: guard.dylib().name().to_string(),
                    name,
                }
                .into());
            }
        }

        // Lay out functions, then data, each in its own block.
        let mut placements: FxHashMap<String, Placement> = FxHashMap::default();
        let mut code_size = 0usize;
        for func in &object.functions {
            code_size = align_to(code_size, func.code.alignment.max(1) as usize);
            placements.insert(
                func.name.clone(),
                Placement {
                    code: true,
                    offset: code_size,
                    exported: func.linkage == Linkage::Export,
                    callable: true,
                },
            );
            code_size += func.code.code.len();
        }
        let mut data_size = 0usize;
        for data in &object.data {
            data_size = align_to(data_size, data.alignment.max(1) as usize);
            placements.insert(
                data.name.clone(),
                Placement {
                    code: false,
                    offset: data_size,
                    exported: data.linkage == Linkage::Export,
                    callable: false,
                },
            );
            data_size += data.bytes.len();
        }

        let mut code_block =
            if code_size > 0 { Some(self.memory.allocate(code_size)?) } else { None };
        let mut data_block =
            if data_size > 0 { Some(self.memory.allocate(data_size)?) } else { None };
        let code_base = code_block.as_ref().map_or(0, |b| b.as_ptr() as usize);
        let data_base = data_block.as_ref().map_or(0, |b| b.as_ptr() as usize);

        if let Some(block) = code_block.as_mut() {
            for func in &object.functions {
                block.write_at(placements[&func.name].offset, &func.code.code);
            }
        }
        if let Some(block) = data_block.as_mut() {
            for data in &object.data {
                block.write_at(placements[&data.name].offset, &data.bytes);
            }
        }

        let address_of = |placement: &Placement| {
            if placement.code { code_base + placement.offset } else { data_base + placement.offset }
        };

        // Patch relocation sites. Intra-object targets resolve locally
        // (exported or not); everything else goes through the dylib, which
        // blocks on in-flight materializations and falls back to generators.
        if let Some(block) = code_block.as_mut() {
            for func in &object.functions {
                let func_base = placements[&func.name].offset;
                for reloc in &func.code.relocations {
                    let target_addr = match placements.get(&reloc.target) {
                        Some(p) => address_of(p),
                        None => match guard.dylib().resolve_blocking(&reloc.target)? {
                            Some(def) => def.address,
                            None => {
                                return Err(LinkError::Unresolved {
                                    name: reloc.target.clone(),
                                    referencer: func.name.clone(),
                                })
                            }
                        },
                    };
                    let site = func_base + reloc.offset as usize;
                    patch(block, site, code_base + site, target_addr, reloc, &func.name)?;
                }
            }
            self.memory.protect(block, Protection::ReadExecute)?;
        }

        let mut defs = FxHashMap::default();
        for (name, placement) in &placements {
            if !placement.exported {
                continue;
            }
            defs.insert(
                name.clone(),
                SymbolDef {
                    address: address_of(placement),
                    flags: if placement.callable { SymbolFlags::code() } else { SymbolFlags::data() },
                },
            );
        }

        let blocks: Vec<MappedBlock> = code_block.into_iter().chain(data_block).collect();
        Ok((defs, blocks))
    }
}

impl Default for ObjectLinkingLayer {
    fn default() -> Self {
        ObjectLinkingLayer::new()
    }
}

fn align_to(value: usize, alignment: usize) -> usize {
    value.next_multiple_of(alignment)
}

/// Patch one relocation site inside the code block
fn patch(
    block: &mut MappedBlock,
    site_offset: usize,
    site_addr: usize,
    target_addr: usize,
    reloc: &crate::backend::Relocation,
    referencer: &str,
) -> Result<(), LinkError> {
    let value = target_addr as i128 + reloc.addend as i128;
    let out_of_range = || LinkError::RelocOutOfRange {
        target: reloc.target.clone(),
        referencer: referencer.to_string(),
    };
    match reloc.kind {
        RelocKind::Abs8 => {
            block.write_at(site_offset, &(value as u64).to_le_bytes());
        }
        RelocKind::Abs4 => {
            let value = u32::try_from(value).map_err(|_| out_of_range())?;
            block.write_at(site_offset, &value.to_le_bytes());
        }
        RelocKind::CallPcRel4 => {
            let disp = value - site_addr as i128;
            let disp = i32::try_from(disp).map_err(|_| out_of_range())?;
            block.write_at(site_offset, &disp.to_le_bytes());
        }
        RelocKind::Arm64Call => {
            let disp = value - site_addr as i128;
            if disp % 4 != 0 || disp >= (1 << 27) || disp < -(1 << 27) {
                return Err(out_of_range());
            }
            let insn = read_u32(block, site_offset);
            let imm26 = ((disp >> 2) as u32) & 0x03FF_FFFF;
            let patched = (insn & 0xFC00_0000) | imm26;
            block.write_at(site_offset, &patched.to_le_bytes());
        }
    }
    Ok(())
}

fn read_u32(block: &MappedBlock, offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    // Safety: offset is a patch site the backend reported inside this block
    unsafe {
        std::ptr::copy_nonoverlapping(block.as_ptr().add(offset), bytes.as_mut_ptr(), 4);
    }
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompiledCode, ObjectData, ObjectFunction, Relocation};
    use crate::dylib::JitDylib;
    use crate::ir::Type;

    fn func_object(name: &str, code: Vec<u8>, relocations: Vec<Relocation>) -> CompiledObject {
        CompiledObject {
            name: "test".to_string(),
            functions: vec![ObjectFunction {
                name: name.to_string(),
                linkage: Linkage::Export,
                code: CompiledCode { code, relocations, alignment: 16 },
            }],
            data: vec![],
        }
    }

    fn claim(
        dylib: &std::sync::Arc<JitDylib>,
        names: &[&str],
    ) -> crate::dylib::MaterializationGuard {
        let tracker = dylib.default_tracker();
        dylib
            .begin_materialization(&tracker, names.iter().map(|n| n.to_string()).collect())
            .unwrap()
    }

    #[test]
    fn test_link_publishes_function_address() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["f"]);
        layer.link(guard, func_object("f", vec![0xC3], vec![])).unwrap();

        let def = dylib.try_resolve("f").unwrap();
        assert_ne!(def.address, 0);
        assert!(def.flags.callable);
        let byte = unsafe { *(def.address as *const u8) };
        assert_eq!(byte, 0xC3);
    }

    #[test]
    fn test_abs8_patch_against_dylib_symbol() {
        let dylib = JitDylib::new("main");
        dylib.define_absolute("g", 0xDEAD_BEEF, crate::dylib::SymbolFlags::data()).unwrap();
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["f"]);
        let reloc =
            Relocation { offset: 0, kind: RelocKind::Abs8, target: "g".to_string(), addend: 0 };
        layer.link(guard, func_object("f", vec![0u8; 8], vec![reloc])).unwrap();

        let addr = dylib.try_resolve("f").unwrap().address;
        let patched = unsafe { *(addr as *const u64) };
        assert_eq!(patched, 0xDEAD_BEEF);
    }

    #[test]
    fn test_unresolved_symbol_fails_claims() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["f"]);
        let reloc = Relocation {
            offset: 0,
            kind: RelocKind::Abs8,
            target: "nowhere".to_string(),
            addend: 0,
        };
        let err = layer.link(guard, func_object("f", vec![0u8; 8], vec![reloc])).unwrap_err();
        assert!(matches!(err, LinkError::Unresolved { .. }));
        // The claim settles as failed, not as silently missing.
        let lookup = dylib.resolve_blocking("f").unwrap_err();
        assert!(matches!(lookup, crate::dylib::LookupError::MaterializationFailed { .. }));
    }

    #[test]
    fn test_data_symbol_round_trip() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["exposed"]);
        let object = CompiledObject {
            name: "data".to_string(),
            functions: vec![],
            data: vec![ObjectData {
                name: "exposed".to_string(),
                linkage: Linkage::Export,
                bytes: 42i32.to_le_bytes().to_vec(),
                alignment: 4,
                ty: Type::I32,
            }],
        };
        layer.link(guard, object).unwrap();

        let def = dylib.try_resolve("exposed").unwrap();
        assert!(!def.flags.callable);
        let value = unsafe { *(def.address as *const i32) };
        assert_eq!(value, 42);
    }

    #[test]
    fn test_autoclaim_publishes_unclaimed_exports() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        layer.set_autoclaim_exports(true);

        let guard = claim(&dylib, &["f"]);
        let mut object = func_object("f", vec![0xC3], vec![]);
        object.functions.push(ObjectFunction {
            name: "extra".to_string(),
            linkage: Linkage::Export,
            code: CompiledCode { code: vec![0xC3], relocations: vec![], alignment: 16 },
        });
        layer.link(guard, object).unwrap();

        assert!(dylib.try_resolve("extra").is_some());
    }

    #[test]
    fn test_autoclaim_rejects_export_colliding_with_live_symbol() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        layer.set_autoclaim_exports(true);
        dylib.define_absolute("extra", 0x7000, crate::dylib::SymbolFlags::code()).unwrap();

        let guard = claim(&dylib, &["f"]);
        let mut object = func_object("f", vec![0xC3], vec![]);
        object.functions.push(ObjectFunction {
            name: "extra".to_string(),
            linkage: Linkage::Export,
            code: CompiledCode { code: vec![0xC3], relocations: vec![], alignment: 16 },
        });
        let err = layer.link(guard, object).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Materialize(MaterializeError::Duplicate { .. })
        ));
        // The live definition is untouched; the claimed name settles failed.
        assert_eq!(dylib.try_resolve("extra").unwrap().address, 0x7000);
        assert!(dylib.resolve_blocking("f").is_err());
    }

    #[test]
    fn test_unclaimed_exports_dropped_without_autoclaim() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["f"]);
        let mut object = func_object("f", vec![0xC3], vec![]);
        object.functions.push(ObjectFunction {
            name: "extra".to_string(),
            linkage: Linkage::Export,
            code: CompiledCode { code: vec![0xC3], relocations: vec![], alignment: 16 },
        });
        layer.link(guard, object).unwrap();

        assert!(dylib.try_resolve("f").is_some());
        assert!(dylib.try_resolve("extra").is_none());
    }

    #[test]
    fn test_local_symbols_resolve_within_object() {
        let dylib = JitDylib::new("main");
        let layer = ObjectLinkingLayer::new();
        let guard = claim(&dylib, &["f"]);
        let reloc = Relocation {
            offset: 0,
            kind: RelocKind::Abs8,
            target: "local_helper".to_string(),
            addend: 0,
        };
        let mut object = func_object("f", vec![0u8; 8], vec![reloc]);
        object.functions.push(ObjectFunction {
            name: "local_helper".to_string(),
            linkage: Linkage::Local,
            code: CompiledCode { code: vec![0xC3], relocations: vec![], alignment: 16 },
        });
        layer.link(guard, object).unwrap();

        let f_addr = dylib.try_resolve("f").unwrap().address;
        let patched = unsafe { *(f_addr as *const u64) };
        // The patched address points at the local helper, 16 bytes in.
        assert_eq!(patched as usize, f_addr + 16);
        assert!(dylib.try_resolve("local_helper").is_none());
    }
}
