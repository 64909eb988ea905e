// This module ties the pieces together into the lifecycle a test sees. CompilerHarness::set_up
// selects the instruction set (honouring an explicit target or feature variant from
// HarnessOptions), builds the compiler configuration and its verification registry, creates the
// harness' own CompilerDriver and, when asked, reserves the image address range. Every component
// is owned by the harness, so a failure part way through set-up simply drops what was built. The
// compile wrappers resolve through a ResolutionContext on the harness' runtime and write into the
// harness' code arena. make_executable copies a compiled method's whole chunk into an executable
// block and binds the code address as the method's entry point; a method without compiled code
// is bound to the interpreter. tear_down undoes everything in reverse: entry points are unbound,
// executable blocks unmapped, the driver destroyed, the reservation released and the arena
// cleared. Drop runs tear_down if the test did not.

//! Harness lifecycle and configuration surface.

use crate::compiler::CompilerDriver;
use crate::core::arena::{ChunkHandle, CodeBufferArena};
use crate::core::error::{HarnessError, HarnessResult};
use crate::core::isa::{InstructionSet, InstructionSetProfile, InstructionSetSelector};
use crate::core::options::{
    BackendKind, CompilerConfiguration, CompilerFilter, ProfileData, VerificationResults,
};
use crate::core::reservation::{ImageReservation, DEFAULT_IMAGE_RESERVATION_SIZE};
use crate::materialize::{self, EntryPoint, ExecutableBlock, OatMethod};
use crate::runtime::{ClassLoader, MethodDef, Runtime};
use std::path::Path;
use std::sync::Arc;

pub const ENV_ISA: &str = "AOT_HARNESS_ISA";
pub const ENV_ISA_VARIANT: &str = "AOT_HARNESS_ISA_VARIANT";
pub const ENV_THREADS: &str = "AOT_HARNESS_THREADS";
pub const ENV_BACKEND: &str = "AOT_HARNESS_BACKEND";
pub const ENV_FILTER: &str = "AOT_HARNESS_FILTER";
pub const ENV_IMAGE_CLASSES: &str = "AOT_HARNESS_IMAGE_CLASSES";
pub const ENV_PROFILE: &str = "AOT_HARNESS_PROFILE";
pub const ENV_RESERVE_IMAGE: &str = "AOT_HARNESS_RESERVE_IMAGE";

/// Settings for [`CompilerHarness::set_up`].
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Target instruction set; the host's when `None`.
    pub instruction_set: Option<InstructionSet>,
    /// Feature variant overriding the default features of the target.
    pub isa_variant: Option<String>,
    pub thread_count: usize,
    pub backend_kind: BackendKind,
    pub compiler_filter: String,
    /// Classes eligible for whole-class compilation; all when `None`.
    pub image_classes: Option<Vec<String>>,
    pub profile_data: Option<ProfileData>,
    /// Reserve [`DEFAULT_IMAGE_RESERVATION_SIZE`] bytes at the image base.
    pub reserve_image: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            instruction_set: None,
            isa_variant: None,
            thread_count: 2,
            backend_kind: BackendKind::default(),
            compiler_filter: CompilerFilter::DEFAULT.name().to_string(),
            image_classes: None,
            profile_data: None,
            reserve_image: false,
        }
    }
}

impl HarnessOptions {
    /// Defaults overridden by the `AOT_HARNESS_*` environment variables.
    pub fn from_env() -> HarnessResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the
    /// `AOT_HARNESS_*` keys. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> HarnessResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut options = Self::default();

        if let Some(isa) = get(ENV_ISA) {
            options.instruction_set = Some(isa.parse()?);
        }
        options.isa_variant = get(ENV_ISA_VARIANT);
        if let Some(threads) = get(ENV_THREADS) {
            options.thread_count = threads.parse().map_err(|_| {
                HarnessError::configuration(format!("{ENV_THREADS}: `{threads}` is not a count"))
            })?;
        }
        if let Some(backend) = get(ENV_BACKEND) {
            options.backend_kind = backend.parse()?;
        }
        if let Some(filter) = get(ENV_FILTER) {
            options.compiler_filter = filter;
        }
        if let Some(classes) = get(ENV_IMAGE_CLASSES) {
            options.image_classes = Some(
                classes
                    .split(',')
                    .map(str::trim)
                    .filter(|class| !class.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Some(path) = get(ENV_PROFILE) {
            options.profile_data = Some(ProfileData::from_file(Path::new(&path))?);
        }
        if let Some(flag) = get(ENV_RESERVE_IMAGE) {
            options.reserve_image = match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(HarnessError::configuration(format!(
                        "{ENV_RESERVE_IMAGE}: `{flag}` is not a boolean"
                    )))
                }
            };
        }
        Ok(options)
    }

    /// Instruction set profile these options select on this host.
    pub fn select_profile(&self) -> HarnessResult<InstructionSetProfile> {
        let selector = InstructionSetSelector::new();
        let host = selector.apply_instruction_set();
        let instruction_set = self.instruction_set.unwrap_or(host.instruction_set);

        match &self.isa_variant {
            Some(variant) => selector.override_instruction_set_features(instruction_set, variant),
            None if instruction_set == host.instruction_set => Ok(host),
            None => Ok(InstructionSetProfile::generic(instruction_set)),
        }
    }
}

/// One harness instance: configuration, driver, code arena and the
/// resources derived from them.
pub struct CompilerHarness {
    runtime: Arc<Runtime>,
    profile: InstructionSetProfile,
    configuration: Arc<CompilerConfiguration>,
    verification_results: Arc<VerificationResults>,
    driver: CompilerDriver,
    arena: CodeBufferArena,
    image_reservation: Option<ImageReservation>,
    executables: Vec<ExecutableBlock>,
    bound_methods: Vec<Arc<MethodDef>>,
    torn_down: bool,
}

impl CompilerHarness {
    pub fn set_up(runtime: Arc<Runtime>, options: HarnessOptions) -> HarnessResult<Self> {
        let profile = options.select_profile()?;

        let mut builder = CompilerConfiguration::builder()
            .backend_kind(options.backend_kind)
            .compiler_filter(options.compiler_filter)
            .thread_count(options.thread_count);
        if let Some(classes) = options.image_classes {
            builder = builder.allowed_classes(classes);
        }
        if let Some(profile_data) = options.profile_data {
            builder = builder.profile_data(profile_data);
        }
        let (configuration, verification_results) = builder.build()?;
        let configuration = Arc::new(configuration);
        let verification_results = Arc::new(verification_results);

        let driver = CompilerDriver::create(
            Arc::clone(&configuration),
            Arc::clone(&verification_results),
            profile.clone(),
        )?;

        let image_reservation = if options.reserve_image {
            Some(ImageReservation::reserve(DEFAULT_IMAGE_RESERVATION_SIZE)?)
        } else {
            None
        };

        log::info!(
            "Harness set up for {} ({} backend, {} threads)",
            profile,
            configuration.backend_kind(),
            configuration.thread_count()
        );

        Ok(Self {
            runtime,
            arena: CodeBufferArena::new(profile.instruction_set),
            profile,
            configuration,
            verification_results,
            driver,
            image_reservation,
            executables: Vec::new(),
            bound_methods: Vec::new(),
            torn_down: false,
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn profile(&self) -> &InstructionSetProfile {
        &self.profile
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.profile.instruction_set
    }

    pub fn configuration(&self) -> &CompilerConfiguration {
        &self.configuration
    }

    pub fn verification_results(&self) -> &VerificationResults {
        &self.verification_results
    }

    pub fn driver(&self) -> &CompilerDriver {
        &self.driver
    }

    pub fn arena(&self) -> &CodeBufferArena {
        &self.arena
    }

    pub fn image_reservation(&self) -> Option<&ImageReservation> {
        self.image_reservation.as_ref()
    }

    pub fn compile_class(
        &mut self,
        loader: ClassLoader,
        class_name: &str,
    ) -> HarnessResult<Vec<(Arc<MethodDef>, ChunkHandle)>> {
        let ctx = self.runtime.resolution_context();
        self.driver
            .compile_class(&ctx, loader, class_name, &mut self.arena)
    }

    pub fn compile_direct_method(
        &mut self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<Option<ChunkHandle>> {
        let ctx = self.runtime.resolution_context();
        self.driver
            .compile_direct_method(&ctx, loader, class_name, name, signature, &mut self.arena)
    }

    pub fn compile_virtual_method(
        &mut self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<Option<ChunkHandle>> {
        let ctx = self.runtime.resolution_context();
        self.driver
            .compile_virtual_method(&ctx, loader, class_name, name, signature, &mut self.arena)
    }

    /// Make `class_name.name(signature)` callable and return its entry point.
    pub fn make_executable(
        &mut self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<EntryPoint> {
        let method = self
            .runtime
            .resolution_context()
            .resolve_method(loader, class_name, name, signature)?;
        self.bind_entry_point(method)
    }

    /// [`make_executable`](Self::make_executable) for every method declared by `class_name`.
    pub fn make_class_executable(
        &mut self,
        loader: ClassLoader,
        class_name: &str,
    ) -> HarnessResult<Vec<(Arc<MethodDef>, EntryPoint)>> {
        let class = self
            .runtime
            .resolution_context()
            .find_class(loader, class_name)?;
        class
            .methods()
            .iter()
            .map(|method| {
                let entry_point = self.bind_entry_point(Arc::clone(method))?;
                Ok((Arc::clone(method), entry_point))
            })
            .collect()
    }

    /// Copy raw code into an executable block owned by the harness and
    /// return its address.
    pub fn make_executable_code(&mut self, code: &[u8]) -> HarnessResult<usize> {
        let block = materialize::make_executable(code)?;
        let address = block.address();
        self.executables.push(block);
        Ok(address)
    }

    /// Present `code` as a method inside a loaded image. The harness takes no
    /// ownership of the memory.
    pub fn create_oat_method(&self, code: *const u8) -> HarnessResult<OatMethod> {
        materialize::create_oat_method(code)
    }

    /// Release everything set-up acquired. Safe to call more than once.
    pub fn tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        for method in self.bound_methods.drain(..) {
            method.set_entry_point(EntryPoint::Interpreter);
        }
        self.executables.clear();
        self.driver.destroy();
        if let Some(mut reservation) = self.image_reservation.take() {
            reservation.release();
        }
        self.arena.clear();
        log::info!("Harness torn down");
    }

    fn bind_entry_point(&mut self, method: Arc<MethodDef>) -> HarnessResult<EntryPoint> {
        let chunk = self
            .driver
            .compiled_chunk(method.id())
            .and_then(|handle| self.arena.chunk(handle));

        let entry_point = match chunk {
            Some(chunk) => {
                let block = materialize::make_executable(chunk.bytes())?;
                let code_address = block.address() + chunk.code_offset();
                self.executables.push(block);
                EntryPoint::Compiled(self.profile.instruction_set.code_pointer(code_address))
            }
            None => EntryPoint::Interpreter,
        };

        method.set_entry_point(entry_point);
        if entry_point != EntryPoint::Interpreter {
            self.bound_methods.push(Arc::clone(&method));
        }
        log::debug!("Bound {} to {:?}", method, entry_point);
        Ok(entry_point)
    }
}

impl Drop for CompilerHarness {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl std::fmt::Debug for CompilerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerHarness")
            .field("profile", &self.profile)
            .field("driver", &self.driver)
            .field("arena", &self.arena)
            .field("image_reservation", &self.image_reservation)
            .field("executables", &self.executables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::isa::RUNTIME_ISA;
    use crate::core::test_utils::test::{init_logging, reservation_lock, sample_runtime};
    use hashbrown::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn options_for(isa: InstructionSet) -> HarnessOptions {
        HarnessOptions {
            instruction_set: Some(isa),
            ..HarnessOptions::default()
        }
    }

    #[test]
    fn test_options_from_lookup() {
        let options = HarnessOptions::from_lookup(lookup(&[
            (ENV_ISA, "arm64"),
            (ENV_ISA_VARIANT, "cortex-a53,+crc"),
            (ENV_THREADS, "4"),
            (ENV_BACKEND, "quick"),
            (ENV_FILTER, "space"),
            (ENV_IMAGE_CLASSES, "demo.A, demo.B,,"),
            (ENV_RESERVE_IMAGE, "yes"),
        ]))
        .unwrap();
        assert_eq!(options.instruction_set, Some(InstructionSet::Arm64));
        assert_eq!(options.isa_variant.as_deref(), Some("cortex-a53,+crc"));
        assert_eq!(options.thread_count, 4);
        assert_eq!(options.backend_kind, BackendKind::Quick);
        assert_eq!(options.compiler_filter, "space");
        assert_eq!(
            options.image_classes,
            Some(vec!["demo.A".to_string(), "demo.B".to_string()])
        );
        assert!(options.reserve_image);

        let profile = options.select_profile().unwrap();
        assert_eq!(profile.instruction_set, InstructionSet::Arm64);
        assert!(profile.features.has("crc"));
    }

    #[test]
    fn test_options_defaults_and_errors() {
        let options = HarnessOptions::from_lookup(lookup(&[(ENV_ISA, "  ")])).unwrap();
        assert_eq!(options.instruction_set, None);
        assert_eq!(options.thread_count, 2);
        assert_eq!(options.backend_kind, BackendKind::Optimizing);
        assert_eq!(options.compiler_filter, "speed");
        assert!(!options.reserve_image);

        for vars in [
            [(ENV_THREADS, "two")],
            [(ENV_BACKEND, "jit")],
            [(ENV_ISA, "mips")],
            [(ENV_RESERVE_IMAGE, "maybe")],
            [(ENV_PROFILE, "/nonexistent/aot-harness.prof")],
        ] {
            let err = HarnessOptions::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, HarnessError::Configuration { .. }), "{vars:?}");
        }
    }

    #[test]
    fn test_set_up_rejects_bad_configuration() {
        let (runtime, _) = sample_runtime();
        let err = CompilerHarness::set_up(
            Arc::clone(&runtime),
            HarnessOptions {
                thread_count: 0,
                ..options_for(InstructionSet::X86_64)
            },
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration { .. }));

        let err = CompilerHarness::set_up(
            Arc::clone(&runtime),
            HarnessOptions {
                isa_variant: Some("kabylake,+bogus".into()),
                ..options_for(InstructionSet::X86_64)
            },
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidVariant { .. }));

        assert!(CompilerHarness::set_up(runtime, options_for(InstructionSet::Thumb2)).is_err());
    }

    #[test]
    fn test_interpreter_fallback_and_unbinding() {
        init_logging();
        let (runtime, loader) = sample_runtime();
        let mut harness =
            CompilerHarness::set_up(runtime, options_for(InstructionSet::X86_64)).unwrap();

        // Nothing compiled yet.
        let entry = harness
            .make_executable(loader, "demo.Arith", "answer", "()J")
            .unwrap();
        assert_eq!(entry, EntryPoint::Interpreter);

        harness
            .compile_direct_method(loader, "demo.Arith", "answer", "()J")
            .unwrap()
            .unwrap();
        let entry = harness
            .make_executable(loader, "demo.Arith", "answer", "()J")
            .unwrap();
        let address = entry.address().unwrap();
        assert_eq!(address % InstructionSet::X86_64.code_alignment(), 0);

        let method = harness
            .runtime()
            .resolution_context()
            .resolve_direct_method(loader, "demo.Arith", "answer", "()J")
            .unwrap();
        assert_eq!(method.entry_point(), entry);

        // The block holds a copy of the whole chunk, header and side table included.
        let handle = harness.driver().compiled_chunk(method.id()).unwrap();
        let chunk = harness.arena().chunk(handle).unwrap();
        let start = (address - chunk.code_offset()) as *const u8;
        let copied = unsafe { std::slice::from_raw_parts(start, chunk.bytes().len()) };
        assert_eq!(copied, chunk.bytes());

        harness.tear_down();
        assert_eq!(method.entry_point(), EntryPoint::Interpreter);
        assert!(harness.arena().is_empty());
        assert!(!harness.driver().is_active());
        harness.tear_down();
    }

    #[test]
    fn test_make_class_executable() {
        let (runtime, loader) = sample_runtime();
        let mut harness =
            CompilerHarness::set_up(runtime, options_for(InstructionSet::Arm64)).unwrap();
        harness.compile_class(loader, "demo.Arith").unwrap();

        let bound = harness.make_class_executable(loader, "demo.Arith").unwrap();
        assert_eq!(bound.len(), 6);
        for (method, entry) in &bound {
            assert_eq!(method.code().is_some(), entry.address().is_some(), "{method}");
        }
    }

    #[test]
    fn test_image_reservation_lifecycle() {
        let _guard = reservation_lock();
        let (runtime, _) = sample_runtime();
        let mut harness = CompilerHarness::set_up(
            Arc::clone(&runtime),
            HarnessOptions {
                reserve_image: true,
                ..options_for(InstructionSet::X86_64)
            },
        )
        .unwrap();
        let reservation = harness.image_reservation().unwrap();
        assert!(reservation.is_active());
        assert_eq!(reservation.size(), DEFAULT_IMAGE_RESERVATION_SIZE);

        // A second harness cannot reserve while the first holds the range.
        let err = CompilerHarness::set_up(
            Arc::clone(&runtime),
            HarnessOptions {
                reserve_image: true,
                ..options_for(InstructionSet::X86_64)
            },
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::AlreadyReserved { .. }));

        harness.tear_down();
        assert!(harness.image_reservation().is_none());
        assert!(!crate::core::reservation::is_reservation_active());
    }

    #[test]
    fn test_host_profile_selected_by_default() {
        let options = HarnessOptions::default();
        let profile = options.select_profile().unwrap();
        let expected = match RUNTIME_ISA {
            InstructionSet::Arm => InstructionSet::Thumb2,
            other => other,
        };
        assert_eq!(profile.instruction_set, expected);
    }
}
