// This module implements the compiler driver that a harness owns explicitly. Creating a driver
// checks that the feature profile belongs to its instruction set and that the configured backend
// has a code generator for it, then builds a rayon pool with the configured number of worker
// threads. compile_class resolves the class through a ResolutionContext and selects the methods
// eligible under the allowed-class set and the profile. From the verify filter upwards those
// methods are verified on the pool and the outcome recorded in VerificationResults; only filters
// that enable AOT compilation go on to generate code, so a verify-only run fills the registry
// without touching the arena. Compilation is fail-fast: once one method fails no further method
// is started, and because results are collected before anything is copied into the code arena a
// failed class leaves the arena untouched. Successful results are written in declaration order,
// so the arena contents do not depend on the thread count. Single-method compiles go through
// compile_method and honour only the filter level and code presence. Handles in the
// compiled-method table are stamped with the arena that issued them. destroy() drops the backend
// and the pool; it is idempotent, and any compile afterwards is a configuration error.

//! Compiler driver: method selection, verification and parallel compilation.

use super::{verify_method, CompiledMethod, CompilerBackend};
use crate::core::arena::{ChunkHandle, CodeBufferArena};
use crate::core::error::{HarnessError, HarnessResult};
use crate::core::isa::InstructionSetProfile;
use crate::core::options::{BackendKind, CompilerConfiguration, VerificationResults};
use crate::runtime::{ClassLoader, MethodDef, MethodId, ResolutionContext};
use hashbrown::HashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Counters accumulated over the lifetime of a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Methods whose code was written to an arena.
    pub methods_compiled: usize,
    /// Methods not selected for compilation.
    pub methods_skipped: usize,
    /// Methods the verifier accepted.
    pub methods_verified: usize,
    /// Methods the verifier rejected.
    pub methods_rejected: usize,
    /// Native code bytes written, excluding headers and side tables.
    pub code_bytes: usize,
}

enum MethodOutcome {
    Compiled(CompiledMethod),
    Verified,
    Rejected(String),
}

pub struct CompilerDriver {
    configuration: Arc<CompilerConfiguration>,
    verification_results: Arc<VerificationResults>,
    profile: InstructionSetProfile,
    backend_kind: BackendKind,
    backend: Option<CompilerBackend>,
    pool: Option<rayon::ThreadPool>,
    compiled_methods: HashMap<MethodId, ChunkHandle>,
    stats: DriverStats,
}

impl CompilerDriver {
    pub fn create(
        configuration: Arc<CompilerConfiguration>,
        verification_results: Arc<VerificationResults>,
        profile: InstructionSetProfile,
    ) -> HarnessResult<Self> {
        profile.validate()?;

        let backend_kind = configuration.backend_kind();
        let backend = CompilerBackend::new(backend_kind);
        if !backend.supports(profile.instruction_set) {
            return Err(HarnessError::configuration(format!(
                "{backend_kind} backend has no code generator for {}",
                profile.instruction_set
            )));
        }

        let thread_count = configuration.thread_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|index| format!("aot-compiler-{index}"))
            .build()
            .map_err(|e| {
                HarnessError::configuration(format!("failed to start compiler threads: {e}"))
            })?;

        log::debug!(
            "Created {} compiler driver for {} with {} threads, filter {}",
            backend_kind,
            profile,
            thread_count,
            configuration.compiler_filter()
        );

        Ok(Self {
            configuration,
            verification_results,
            profile,
            backend_kind,
            backend: Some(backend),
            pool: Some(pool),
            compiled_methods: HashMap::new(),
            stats: DriverStats::default(),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn profile(&self) -> &InstructionSetProfile {
        &self.profile
    }

    pub fn configuration(&self) -> &CompilerConfiguration {
        &self.configuration
    }

    pub fn verification_results(&self) -> &VerificationResults {
        &self.verification_results
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_some()
    }

    /// Chunk holding the most recent compiled code of `method`.
    ///
    /// The handle only resolves in the arena it was compiled into.
    pub fn compiled_chunk(&self, method: MethodId) -> Option<ChunkHandle> {
        self.compiled_methods.get(&method).copied()
    }

    /// Compile every eligible method declared by `class_name`.
    ///
    /// Returns the compiled methods with their chunks in declaration order.
    pub fn compile_class(
        &mut self,
        ctx: &ResolutionContext<'_>,
        loader: ClassLoader,
        class_name: &str,
        arena: &mut CodeBufferArena,
    ) -> HarnessResult<Vec<(Arc<MethodDef>, ChunkHandle)>> {
        let backend = self.backend.as_ref().ok_or_else(destroyed)?;
        let pool = self.pool.as_ref().ok_or_else(destroyed)?;
        let class = ctx.find_class(loader, class_name)?;

        let configuration = &self.configuration;
        let generate_code = configuration.compiler_filter().is_aot_compilation_enabled();
        let mut candidates = Vec::new();
        let mut skipped = 0;
        for method in class.methods() {
            if is_selected(configuration, method) {
                candidates.push(Arc::clone(method));
            } else {
                log::trace!("Skipping {}", method);
                skipped += 1;
            }
        }
        self.stats.methods_skipped += skipped;
        log::debug!(
            "{} {} of {} methods of {} for {}",
            if generate_code { "Compiling" } else { "Verifying" },
            candidates.len(),
            class.methods().len(),
            class_name,
            self.profile.instruction_set
        );

        let abort = AtomicBool::new(false);
        let profile = &self.profile;
        let verification_results = &*self.verification_results;
        let job = |method: &Arc<MethodDef>| -> Option<HarnessResult<MethodOutcome>> {
            if abort.load(Ordering::Acquire) {
                return None;
            }
            let result = compile_one(backend, profile, verification_results, method, generate_code);
            if result.is_err() {
                abort.store(true, Ordering::Release);
            }
            Some(result)
        };

        let results: Vec<Option<HarnessResult<MethodOutcome>>> =
            if configuration.thread_count() == 1 {
                candidates.iter().map(job).collect()
            } else {
                pool.install(|| candidates.par_iter().map(job).collect())
            };

        let mut outcomes = Vec::with_capacity(results.len());
        for (method, result) in candidates.into_iter().zip(results) {
            match result {
                Some(Ok(outcome)) => outcomes.push((method, outcome)),
                Some(Err(e)) => {
                    log::debug!("Compilation of {} aborted: {}", class_name, e);
                    return Err(e);
                }
                None => {}
            }
        }
        let mut compiled = Vec::with_capacity(outcomes.len());
        for (method, outcome) in outcomes {
            if let Some(handle) = self.install(&method, outcome, arena)? {
                compiled.push((method, handle));
            }
        }
        Ok(compiled)
    }

    /// Compile a private, static or constructor method declared by `class_name`.
    pub fn compile_direct_method(
        &mut self,
        ctx: &ResolutionContext<'_>,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
        arena: &mut CodeBufferArena,
    ) -> HarnessResult<Option<ChunkHandle>> {
        self.ensure_active()?;
        let method = ctx.resolve_direct_method(loader, class_name, name, signature)?;
        self.compile_method(&method, arena)
    }

    /// Compile the implementation a virtual call on a `class_name` receiver reaches.
    pub fn compile_virtual_method(
        &mut self,
        ctx: &ResolutionContext<'_>,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
        arena: &mut CodeBufferArena,
    ) -> HarnessResult<Option<ChunkHandle>> {
        self.ensure_active()?;
        let method = ctx.resolve_virtual_method(loader, class_name, name, signature)?;
        self.compile_method(&method, arena)
    }

    /// Compile an already resolved method.
    ///
    /// `Ok(None)` when the filter disables compilation, the method has no
    /// bytecode or the verifier rejects it. Filters below AOT compilation
    /// that still verify record the verification outcome.
    pub fn compile_method(
        &mut self,
        method: &Arc<MethodDef>,
        arena: &mut CodeBufferArena,
    ) -> HarnessResult<Option<ChunkHandle>> {
        let backend = self.backend.as_ref().ok_or_else(destroyed)?;
        let filter = self.configuration.compiler_filter();
        if !filter.is_verification_enabled() || method.code().is_none() {
            log::trace!("Skipping {}", method);
            self.stats.methods_skipped += 1;
            return Ok(None);
        }

        let outcome = compile_one(
            backend,
            &self.profile,
            &self.verification_results,
            method,
            filter.is_aot_compilation_enabled(),
        )?;
        self.install(method, outcome, arena)
    }

    /// Drop the backend and the worker pool.
    pub fn destroy(&mut self) {
        if self.backend.take().is_some() {
            log::debug!(
                "Destroyed compiler driver after {} compiled methods",
                self.stats.methods_compiled
            );
        }
        self.pool = None;
        self.compiled_methods.clear();
    }

    fn ensure_active(&self) -> HarnessResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(destroyed())
        }
    }

    fn install(
        &mut self,
        method: &Arc<MethodDef>,
        outcome: MethodOutcome,
        arena: &mut CodeBufferArena,
    ) -> HarnessResult<Option<ChunkHandle>> {
        match outcome {
            MethodOutcome::Compiled(compiled) => {
                let handle = arena.allocate(&compiled.code, &compiled.side_table())?;
                self.compiled_methods.insert(method.id(), handle);
                self.stats.methods_verified += 1;
                self.stats.methods_compiled += 1;
                self.stats.code_bytes += compiled.code.len();
                log::debug!(
                    "Compiled {}: {} bytes of {} code",
                    method,
                    compiled.code.len(),
                    compiled.instruction_set
                );
                Ok(Some(handle))
            }
            MethodOutcome::Verified => {
                log::trace!("Verified {}", method);
                self.stats.methods_verified += 1;
                Ok(None)
            }
            MethodOutcome::Rejected(reason) => {
                log::info!("Verification rejected {}: {}", method, reason);
                self.stats.methods_rejected += 1;
                Ok(None)
            }
        }
    }
}

impl Drop for CompilerDriver {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for CompilerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerDriver")
            .field("backend_kind", &self.backend_kind)
            .field("profile", &self.profile)
            .field("active", &self.is_active())
            .field("stats", &self.stats)
            .finish()
    }
}

fn destroyed() -> HarnessError {
    HarnessError::configuration("compiler driver has been destroyed")
}

/// Whether a class-wide request verifies `method`; code generation also
/// depends on the filter enabling AOT compilation.
fn is_selected(configuration: &CompilerConfiguration, method: &MethodDef) -> bool {
    configuration.compiler_filter().is_verification_enabled()
        && method.code().is_some()
        && configuration.is_class_allowed(method.declaring_class())
        && configuration.is_profiled(method.declaring_class(), method.name(), method.signature())
}

fn compile_one(
    backend: &CompilerBackend,
    profile: &InstructionSetProfile,
    verification_results: &VerificationResults,
    method: &MethodDef,
    generate_code: bool,
) -> HarnessResult<MethodOutcome> {
    let verified = match verify_method(method) {
        Ok(verified) => verified,
        Err(reason) => {
            verification_results.record_rejected(method.id(), reason.clone());
            return Ok(MethodOutcome::Rejected(reason));
        }
    };
    verification_results.record_verified(method.id());
    if !generate_code {
        return Ok(MethodOutcome::Verified);
    }
    backend
        .compile(method, &verified, profile)
        .map(MethodOutcome::Compiled)
}
