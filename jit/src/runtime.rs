//! The runtime: publishes finalized code and tracks the results.

use std::sync::{Arc, Mutex};

use log::trace;
use rustc_hash::FxHashMap;

use windlass_codegen::{Arch, Environment, FinalizedCode};

use crate::memory::{flush_icache, ExecutableMemory};
use crate::JitError;

struct FuncInner {
    id: u64,
    mem: ExecutableMemory,
    code_len: usize,
}

/// A callable compiled function.
///
/// The handle (together with the runtime registry) owns the executable
/// pages; the mapping is released when the last handle and the registry
/// entry are gone. Call through [`JitFunction::entry`] by transmuting to a
/// function pointer of the compiled signature.
#[derive(Clone)]
pub struct JitFunction {
    inner: Arc<FuncInner>,
}

impl JitFunction {
    /// The entry address of the compiled code.
    pub fn entry(&self) -> *const u8 {
        self.inner.mem.as_ptr()
    }

    /// Size of the machine code (not the page-rounded mapping).
    pub fn code_len(&self) -> usize {
        self.inner.code_len
    }

    fn id(&self) -> u64 {
        self.inner.id
    }
}

impl core::fmt::Debug for JitFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("JitFunction")
            .field("entry", &self.entry())
            .field("code_len", &self.code_len())
            .finish()
    }
}

struct RuntimeInner {
    next_id: u64,
    /// Outstanding functions, for defensive release at teardown.
    registry: FxHashMap<u64, JitFunction>,
    /// Keyed compilation cache; hits never allocate.
    cache: FxHashMap<String, JitFunction>,
}

/// The executable-memory runtime.
///
/// All publishing, lookup, and release paths take one exclusive lock, so a
/// runtime may be shared between threads; assemblers and builders may not.
pub struct JitRuntime {
    env: Environment,
    inner: Mutex<RuntimeInner>,
}

impl JitRuntime {
    pub fn new(env: Environment) -> JitRuntime {
        JitRuntime {
            env,
            inner: Mutex::new(RuntimeInner {
                next_id: 0,
                registry: FxHashMap::default(),
                cache: FxHashMap::default(),
            }),
        }
    }

    pub fn environment(&self) -> Environment {
        self.env
    }

    /// Publish finalized code: map, copy, relocate, seal, and register.
    pub fn add(&self, code: &FinalizedCode) -> Result<JitFunction, JitError> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        self.add_locked(&mut inner, code)
    }

    /// Publish through the keyed cache: an existing entry for `key` is
    /// returned as-is, otherwise the code is published and cached.
    pub fn add_cached(&self, key: &str, code: &FinalizedCode) -> Result<JitFunction, JitError> {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        if let Some(hit) = inner.cache.get(key) {
            trace!("cache hit for {key:?}");
            return Ok(hit.clone());
        }
        let func = self.add_locked(&mut inner, code)?;
        inner.cache.insert(key.to_owned(), func.clone());
        Ok(func)
    }

    fn add_locked(
        &self,
        inner: &mut RuntimeInner,
        code: &FinalizedCode,
    ) -> Result<JitFunction, JitError> {
        if code.is_empty() {
            return Err(JitError::EmptyCode);
        }
        let mut mem = ExecutableMemory::allocate(code.len())?;
        let base = mem.as_ptr() as u64;
        {
            let slice = mem.as_mut_slice();
            slice[..code.len()].copy_from_slice(code.bytes());
            // Absolute relocations: the 8-byte slot at `at` becomes the
            // runtime address of `target`.
            for reloc in code.relocs() {
                let value = base + u64::from(reloc.target);
                let at = reloc.at as usize;
                slice[at..at + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
        mem.protect_execute()?;
        if self.env.arch() == Arch::A64 {
            flush_icache(mem.as_ptr(), code.len());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let func = JitFunction {
            inner: Arc::new(FuncInner {
                id,
                mem,
                code_len: code.len(),
            }),
        };
        inner.registry.insert(id, func.clone());
        trace!(
            "published {} byte(s) as function #{id} at {:p} ({} reloc(s))",
            code.len(),
            func.entry(),
            code.relocs().len()
        );
        Ok(func)
    }

    /// Release a function: the registry entry is removed, and the mapping
    /// is unmapped once no other handle (including cache entries) refers
    /// to it.
    pub fn release(&self, func: JitFunction) {
        let mut inner = self.inner.lock().expect("runtime lock poisoned");
        let id = func.id();
        inner.registry.remove(&id);
        inner.cache.retain(|_, f| f.id() != id);
        trace!("released function #{id}");
    }

    /// Number of outstanding published functions.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().expect("runtime lock poisoned").registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `ret` on x86-64; `udf #0` on AArch64. Never executed here.
    fn trivial_code() -> FinalizedCode {
        let mut asm = windlass_codegen::isa::x64::Assembler::new();
        asm.ret().unwrap();
        asm.finalize().unwrap()
    }

    fn runtime() -> JitRuntime {
        let env = Environment::new(
            windlass_codegen::Arch::X64,
            windlass_codegen::CallConv::SystemV,
        )
        .unwrap();
        JitRuntime::new(env)
    }

    #[test]
    fn registry_tracks_outstanding_functions() {
        let rt = runtime();
        let code = trivial_code();
        let a = rt.add(&code).unwrap();
        let b = rt.add(&code).unwrap();
        assert_ne!(a.entry(), b.entry());
        assert_eq!(rt.outstanding(), 2);
        rt.release(a);
        assert_eq!(rt.outstanding(), 1);
        rt.release(b);
        assert_eq!(rt.outstanding(), 0);
    }

    #[test]
    fn cache_hits_reuse_the_mapping() {
        let rt = runtime();
        let code = trivial_code();
        let a = rt.add_cached("answer", &code).unwrap();
        let b = rt.add_cached("answer", &code).unwrap();
        assert_eq!(a.entry(), b.entry());
        assert_eq!(rt.outstanding(), 1);
        let c = rt.add_cached("other", &code).unwrap();
        assert_ne!(a.entry(), c.entry());
    }

    #[test]
    fn empty_code_is_rejected() {
        let rt = runtime();
        let empty = {
            let asm = windlass_codegen::isa::x64::Assembler::new();
            asm.finalize().unwrap()
        };
        assert!(matches!(rt.add(&empty), Err(JitError::EmptyCode)));
    }
}
