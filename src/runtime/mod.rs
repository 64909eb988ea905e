// This module models the slice of a managed runtime the harness needs: classes, the methods they
// declare, the class loaders that define them, and a tiny stack bytecode for method bodies.
// Runtime owns the class graph behind a parking_lot reader/writer lock. Definitions take the
// write lock briefly; all lookups go through a ResolutionContext (see resolver.rs), which takes
// the read lock only for the span of each lookup and hands out Arc handles so nothing keeps the
// lock while code is being generated. Loaders delegate to their parent before searching their
// own table, and the boot loader always exists at index 0. Each MethodDef carries an atomic
// entry-point slot so that binding compiled code never needs the write lock.

//! Managed object model: classes, methods, loaders and bytecode.

pub mod resolver;

pub use resolver::ResolutionContext;

use crate::core::error::{HarnessError, HarnessResult};
use crate::materialize::EntryPoint;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-unique identifier of a defined method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodId(pub u32);

/// Handle to a class loader registered with a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassLoader(usize);

impl ClassLoader {
    pub const BOOT: ClassLoader = ClassLoader(0);
}

/// Method and class access flags, using the class-file `ACC_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const PUBLIC: AccessFlags = AccessFlags(0x0001);
    pub const PRIVATE: AccessFlags = AccessFlags(0x0002);
    pub const PROTECTED: AccessFlags = AccessFlags(0x0004);
    pub const STATIC: AccessFlags = AccessFlags(0x0008);
    pub const FINAL: AccessFlags = AccessFlags(0x0010);
    pub const NATIVE: AccessFlags = AccessFlags(0x0100);
    pub const ABSTRACT: AccessFlags = AccessFlags(0x0400);
    pub const CONSTRUCTOR: AccessFlags = AccessFlags(0x1_0000);

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Private, static and constructor methods are bound statically.
    pub fn is_direct(self) -> bool {
        self.0 & (Self::PRIVATE.0 | Self::STATIC.0 | Self::CONSTRUCTOR.0) != 0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Stack bytecode executed by methods.
///
/// Values are 64-bit integers. `LoadArg` indexes the incoming arguments,
/// with the receiver at index 0 for instance methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Const(i64),
    LoadArg(u8),
    Add,
    Sub,
    Mul,
    Neg,
    Invoke {
        class: String,
        name: String,
        signature: String,
    },
    Return,
    ReturnVoid,
}

/// A method declared by a class.
#[derive(Debug)]
pub struct MethodDef {
    id: MethodId,
    declaring_class: String,
    name: String,
    signature: String,
    flags: AccessFlags,
    code: Option<Vec<Insn>>,
    entry_point: AtomicUsize,
}

impl MethodDef {
    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn declaring_class(&self) -> &str {
        &self.declaring_class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    pub fn is_direct(&self) -> bool {
        self.flags.is_direct()
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(AccessFlags::STATIC)
    }

    /// Bytecode body, `None` for abstract and native methods.
    pub fn code(&self) -> Option<&[Insn]> {
        self.code.as_deref()
    }

    /// Number of argument slots including the receiver of instance methods.
    pub fn argument_count(&self) -> usize {
        parameter_count(&self.signature) + usize::from(!self.is_static())
    }

    pub fn returns_void(&self) -> bool {
        self.signature.ends_with(")V")
    }

    pub fn entry_point(&self) -> EntryPoint {
        EntryPoint::from_raw(self.entry_point.load(Ordering::Acquire))
    }

    pub fn set_entry_point(&self, entry_point: EntryPoint) {
        self.entry_point
            .store(entry_point.to_raw(), Ordering::Release);
    }
}

impl fmt::Display for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.declaring_class, self.name, self.signature)
    }
}

/// Count the parameters of a method descriptor such as `(JLjava/lang/Object;[I)V`.
pub fn parameter_count(signature: &str) -> usize {
    let Some(params) = signature
        .strip_prefix('(')
        .and_then(|rest| rest.split(')').next())
    else {
        return 0;
    };

    let mut count = 0;
    let mut chars = params.chars();
    while let Some(c) = chars.next() {
        match c {
            '[' => continue,
            'L' => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                }
                count += 1;
            }
            _ => count += 1,
        }
    }
    count
}

/// A defined class.
#[derive(Debug)]
pub struct ClassDef {
    name: String,
    superclass: Option<String>,
    defining_loader: ClassLoader,
    methods: Vec<Arc<MethodDef>>,
}

impl ClassDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    pub fn defining_loader(&self) -> ClassLoader {
        self.defining_loader
    }

    /// Methods in declaration order.
    pub fn methods(&self) -> &[Arc<MethodDef>] {
        &self.methods
    }

    pub fn find_declared_method(&self, name: &str, signature: &str) -> Option<&Arc<MethodDef>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.signature == signature)
    }
}

struct PendingMethod {
    name: String,
    signature: String,
    flags: AccessFlags,
    code: Option<Vec<Insn>>,
}

/// Collects a class definition before it is registered with a loader.
pub struct ClassBuilder {
    name: String,
    superclass: Option<String>,
    methods: Vec<PendingMethod>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        flags: AccessFlags,
        code: Vec<Insn>,
    ) -> Self {
        self.methods.push(PendingMethod {
            name: name.into(),
            signature: signature.into(),
            flags,
            code: Some(code),
        });
        self
    }

    /// Declare a method without a body. The abstract flag is added unless the
    /// flags already mark the method native.
    pub fn bodyless_method(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        flags: AccessFlags,
    ) -> Self {
        let flags = if flags.contains(AccessFlags::NATIVE) {
            flags
        } else {
            flags | AccessFlags::ABSTRACT
        };
        self.methods.push(PendingMethod {
            name: name.into(),
            signature: signature.into(),
            flags,
            code: None,
        });
        self
    }
}

struct LoaderEntry {
    parent: Option<ClassLoader>,
    classes: HashMap<String, Arc<ClassDef>>,
}

/// Class tables of every loader.
pub(crate) struct ClassGraph {
    loaders: Vec<LoaderEntry>,
}

impl ClassGraph {
    fn new() -> Self {
        Self {
            loaders: vec![LoaderEntry {
                parent: None,
                classes: HashMap::new(),
            }],
        }
    }

    /// Parent-first lookup starting at `loader`.
    pub(crate) fn find_class(&self, loader: ClassLoader, name: &str) -> Option<Arc<ClassDef>> {
        let entry = self.loaders.get(loader.0)?;
        if let Some(parent) = entry.parent {
            if let Some(class) = self.find_class(parent, name) {
                return Some(class);
            }
        }
        entry.classes.get(name).cloned()
    }

    pub(crate) fn superclass_of(&self, class: &ClassDef) -> Option<Arc<ClassDef>> {
        let name = class.superclass.as_deref()?;
        self.find_class(class.defining_loader, name)
    }
}

/// Owner of the managed object graph.
pub struct Runtime {
    graph: RwLock<ClassGraph>,
    next_method_id: AtomicU32,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(ClassGraph::new()),
            next_method_id: AtomicU32::new(1),
        }
    }

    /// Register a loader delegating to `parent`, or to the boot loader when `None`.
    pub fn create_class_loader(&self, parent: Option<ClassLoader>) -> HarnessResult<ClassLoader> {
        let mut graph = self.graph.write();
        let parent = parent.unwrap_or(ClassLoader::BOOT);
        if parent.0 >= graph.loaders.len() {
            return Err(HarnessError::resolution(format!(
                "unknown parent class loader {}",
                parent.0
            )));
        }
        graph.loaders.push(LoaderEntry {
            parent: Some(parent),
            classes: HashMap::new(),
        });
        Ok(ClassLoader(graph.loaders.len() - 1))
    }

    /// Define a class in `loader`.
    pub fn define_class(&self, loader: ClassLoader, builder: ClassBuilder) -> HarnessResult<()> {
        let mut graph = self.graph.write();
        let entry = graph.loaders.get_mut(loader.0).ok_or_else(|| {
            HarnessError::resolution(format!("unknown class loader {}", loader.0))
        })?;
        if builder.superclass.as_deref() == Some(builder.name.as_str()) {
            return Err(HarnessError::resolution(format!(
                "class {} cannot extend itself",
                builder.name
            )));
        }
        if entry.classes.contains_key(&builder.name) {
            return Err(HarnessError::resolution(format!(
                "class {} is already defined by loader {}",
                builder.name, loader.0
            )));
        }

        let methods = builder
            .methods
            .into_iter()
            .map(|pending| {
                Arc::new(MethodDef {
                    id: MethodId(self.next_method_id.fetch_add(1, Ordering::Relaxed)),
                    declaring_class: builder.name.clone(),
                    name: pending.name,
                    signature: pending.signature,
                    flags: pending.flags,
                    code: pending.code,
                    entry_point: AtomicUsize::new(EntryPoint::Interpreter.to_raw()),
                })
            })
            .collect();

        log::debug!("Defined class {} in loader {}", builder.name, loader.0);
        entry.classes.insert(
            builder.name.clone(),
            Arc::new(ClassDef {
                name: builder.name,
                superclass: builder.superclass,
                defining_loader: loader,
                methods,
            }),
        );
        Ok(())
    }

    /// Capability required by every resolving API.
    pub fn resolution_context(&self) -> ResolutionContext<'_> {
        ResolutionContext::new(&self.graph)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count() {
        assert_eq!(parameter_count("()V"), 0);
        assert_eq!(parameter_count("(JJ)J"), 2);
        assert_eq!(parameter_count("(Ljava/lang/String;[I[[JZ)V"), 4);
        assert_eq!(parameter_count("garbage"), 0);
    }

    #[test]
    fn test_access_flags() {
        assert!(AccessFlags::PRIVATE.is_direct());
        assert!((AccessFlags::PUBLIC | AccessFlags::STATIC).is_direct());
        assert!(AccessFlags::CONSTRUCTOR.is_direct());
        assert!(!(AccessFlags::PUBLIC | AccessFlags::FINAL).is_direct());
    }

    #[test]
    fn test_define_and_find() {
        let runtime = Runtime::new();
        let loader = runtime.create_class_loader(None).unwrap();
        runtime
            .define_class(
                loader,
                ClassBuilder::new("demo.Main")
                    .method("answer", "()J", AccessFlags::STATIC, vec![Insn::Const(42), Insn::Return])
                    .bodyless_method("hook", "()V", AccessFlags::PUBLIC),
            )
            .unwrap();

        let graph = runtime.graph.read();
        let class = graph.find_class(loader, "demo.Main").unwrap();
        assert_eq!(class.methods().len(), 2);
        let hook = class.find_declared_method("hook", "()V").unwrap();
        assert!(hook.flags().contains(AccessFlags::ABSTRACT));
        assert!(hook.code().is_none());
        assert_eq!(hook.argument_count(), 1);
        assert!(graph.find_class(ClassLoader::BOOT, "demo.Main").is_none());
    }

    #[test]
    fn test_duplicate_definition() {
        let runtime = Runtime::new();
        runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.A"))
            .unwrap();
        let err = runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.A"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Resolution { .. }));
    }

    #[test]
    fn test_parent_first_delegation() {
        let runtime = Runtime::new();
        let parent = runtime.create_class_loader(None).unwrap();
        let child = runtime.create_class_loader(Some(parent)).unwrap();
        runtime
            .define_class(parent, ClassBuilder::new("demo.Shared"))
            .unwrap();
        runtime
            .define_class(child, ClassBuilder::new("demo.Shared"))
            .unwrap();

        let graph = runtime.graph.read();
        let found = graph.find_class(child, "demo.Shared").unwrap();
        assert_eq!(found.defining_loader(), parent);
    }

    #[test]
    fn test_entry_point_slot() {
        let runtime = Runtime::new();
        runtime
            .define_class(
                ClassLoader::BOOT,
                ClassBuilder::new("demo.E").method("f", "()V", AccessFlags::STATIC, vec![Insn::ReturnVoid]),
            )
            .unwrap();
        let graph = runtime.graph.read();
        let method = graph.find_class(ClassLoader::BOOT, "demo.E").unwrap().methods()[0].clone();
        assert_eq!(method.entry_point(), EntryPoint::Interpreter);
        method.set_entry_point(EntryPoint::Compiled(0x4000));
        assert_eq!(method.entry_point(), EntryPoint::Compiled(0x4000));
    }
}
