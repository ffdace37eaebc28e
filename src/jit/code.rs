//! Finalized JIT output.

use cranelift_jit::JITModule;

/// Owns the finalized module (keeping the emitted code mapped) and the
/// pointer to the exported entry function.
pub struct JitCode {
    entry: *const u8,
    /// Held only to keep the executable memory alive.
    _module: JITModule,
}

impl JitCode {
    pub(crate) fn new(entry: *const u8, module: JITModule) -> Self {
        JitCode {
            entry,
            _module: module,
        }
    }

    /// Run `fusion_main` to completion.
    ///
    /// # Safety
    /// The emitted code dereferences program-controlled pointers and
    /// calls into dynamically loaded libraries; a buggy or hostile
    /// source program can do anything the process can do. Runtime
    /// panics raised by the code abort the process.
    pub unsafe fn run(&self) {
        let entry: unsafe extern "C" fn() = std::mem::transmute(self.entry);
        entry();
    }
}

impl std::fmt::Debug for JitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCode").field("entry", &self.entry).finish()
    }
}
