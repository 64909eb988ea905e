//! Name and signature resolution against the class graph.
//!
//! A [`ResolutionContext`] is the capability every resolving API takes. Each
//! lookup holds the graph's read lock only while it runs and returns `Arc`
//! handles, so callers never keep the lock across code generation.

use super::{ClassDef, ClassGraph, ClassLoader, MethodDef};
use crate::core::error::{HarnessError, HarnessResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared-read access to a runtime's class graph.
#[derive(Clone, Copy)]
pub struct ResolutionContext<'rt> {
    graph: &'rt RwLock<ClassGraph>,
}

impl<'rt> ResolutionContext<'rt> {
    pub(crate) fn new(graph: &'rt RwLock<ClassGraph>) -> Self {
        Self { graph }
    }

    pub fn find_class(&self, loader: ClassLoader, name: &str) -> HarnessResult<Arc<ClassDef>> {
        let graph = self.graph.read();
        graph
            .find_class(loader, name)
            .ok_or_else(|| HarnessError::resolution(format!("class {name} not found")))
    }

    /// Resolve a statically bound method declared by `class_name` itself.
    pub fn resolve_direct_method(
        &self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<Arc<MethodDef>> {
        let graph = self.graph.read();
        let class = graph
            .find_class(loader, class_name)
            .ok_or_else(|| HarnessError::resolution(format!("class {class_name} not found")))?;
        let method = class.find_declared_method(name, signature).ok_or_else(|| {
            HarnessError::resolution(format!(
                "direct method {class_name}.{name}{signature} not found"
            ))
        })?;
        if !method.is_direct() {
            return Err(HarnessError::resolution(format!(
                "{method} is virtual, not a direct method"
            )));
        }
        log::trace!("Resolved direct method {}", method);
        Ok(Arc::clone(method))
    }

    /// Resolve the implementation a virtual call on a `class_name` receiver reaches.
    ///
    /// The search starts at the named class and walks up its superclasses,
    /// so an override in a subclass wins over the inherited definition.
    /// Private and static methods of superclasses are not dispatch targets.
    /// A superclass chain that loops back on itself is a resolution error.
    pub fn resolve_virtual_method(
        &self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<Arc<MethodDef>> {
        let graph = self.graph.read();
        let class = graph
            .find_class(loader, class_name)
            .ok_or_else(|| HarnessError::resolution(format!("class {class_name} not found")))?;

        if let Some(method) = class.find_declared_method(name, signature) {
            if method.is_direct() {
                return Err(HarnessError::resolution(format!(
                    "{method} is a direct method, not virtual"
                )));
            }
            log::trace!("Resolved virtual method {}", method);
            return Ok(Arc::clone(method));
        }

        let mut visited = vec![Arc::clone(&class)];
        let mut current = class;
        while let Some(super_name) = current.superclass() {
            let superclass = graph.superclass_of(&current).ok_or_else(|| {
                HarnessError::resolution(format!(
                    "superclass {super_name} of {} not found",
                    current.name()
                ))
            })?;
            if visited.iter().any(|seen| Arc::ptr_eq(seen, &superclass)) {
                return Err(HarnessError::resolution(format!(
                    "cyclic superclass chain through {super_name} while resolving {class_name}"
                )));
            }
            visited.push(Arc::clone(&superclass));
            if let Some(method) = superclass
                .find_declared_method(name, signature)
                .filter(|m| !m.is_direct())
            {
                log::trace!("Resolved virtual method {} via {}", method, class_name);
                return Ok(Arc::clone(method));
            }
            current = superclass;
        }

        Err(HarnessError::resolution(format!(
            "virtual method {class_name}.{name}{signature} not found"
        )))
    }

    /// Resolve a method of either dispatch kind, preferring the named class'
    /// own declaration.
    pub fn resolve_method(
        &self,
        loader: ClassLoader,
        class_name: &str,
        name: &str,
        signature: &str,
    ) -> HarnessResult<Arc<MethodDef>> {
        match self.resolve_direct_method(loader, class_name, name, signature) {
            Ok(method) => Ok(method),
            Err(_) => self.resolve_virtual_method(loader, class_name, name, signature),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::HarnessError;
    use crate::runtime::{AccessFlags, ClassBuilder, ClassLoader, Insn, Runtime};

    fn hierarchy() -> (Runtime, ClassLoader) {
        let runtime = Runtime::new();
        let loader = runtime.create_class_loader(None).unwrap();
        runtime
            .define_class(
                loader,
                ClassBuilder::new("demo.Base")
                    .method("value", "()J", AccessFlags::PUBLIC, vec![Insn::Const(1), Insn::Return])
                    .method("inherited", "()J", AccessFlags::PUBLIC, vec![Insn::Const(7), Insn::Return])
                    .method("secret", "()J", AccessFlags::PRIVATE, vec![Insn::Const(3), Insn::Return]),
            )
            .unwrap();
        runtime
            .define_class(
                loader,
                ClassBuilder::new("demo.Derived")
                    .extends("demo.Base")
                    .method("value", "()J", AccessFlags::PUBLIC, vec![Insn::Const(2), Insn::Return])
                    .method("<init>", "()V", AccessFlags::CONSTRUCTOR, vec![Insn::ReturnVoid]),
            )
            .unwrap();
        (runtime, loader)
    }

    #[test]
    fn test_virtual_resolution_prefers_override() {
        let (runtime, loader) = hierarchy();
        let ctx = runtime.resolution_context();
        let method = ctx
            .resolve_virtual_method(loader, "demo.Derived", "value", "()J")
            .unwrap();
        assert_eq!(method.declaring_class(), "demo.Derived");

        let base = ctx
            .resolve_virtual_method(loader, "demo.Base", "value", "()J")
            .unwrap();
        assert_eq!(base.declaring_class(), "demo.Base");
    }

    #[test]
    fn test_virtual_resolution_walks_superclasses() {
        let (runtime, loader) = hierarchy();
        let ctx = runtime.resolution_context();
        let method = ctx
            .resolve_virtual_method(loader, "demo.Derived", "inherited", "()J")
            .unwrap();
        assert_eq!(method.declaring_class(), "demo.Base");

        // Private methods are not inherited dispatch targets.
        assert!(ctx
            .resolve_virtual_method(loader, "demo.Derived", "secret", "()J")
            .is_err());
    }

    #[test]
    fn test_direct_resolution() {
        let (runtime, loader) = hierarchy();
        let ctx = runtime.resolution_context();
        let ctor = ctx
            .resolve_direct_method(loader, "demo.Derived", "<init>", "()V")
            .unwrap();
        assert!(ctor.is_direct());

        let err = ctx
            .resolve_direct_method(loader, "demo.Derived", "value", "()J")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Resolution { .. }));

        // Direct lookup does not search superclasses.
        assert!(ctx
            .resolve_direct_method(loader, "demo.Derived", "secret", "()J")
            .is_err());
    }

    #[test]
    fn test_dispatch_kind_mismatch() {
        let (runtime, loader) = hierarchy();
        let ctx = runtime.resolution_context();
        let err = ctx
            .resolve_virtual_method(loader, "demo.Base", "secret", "()J")
            .unwrap_err();
        assert!(err.to_string().contains("direct method"));
    }

    #[test]
    fn test_missing_superclass() {
        let runtime = Runtime::new();
        runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.Orphan").extends("demo.Gone"))
            .unwrap();
        let ctx = runtime.resolution_context();
        let err = ctx
            .resolve_virtual_method(ClassLoader::BOOT, "demo.Orphan", "f", "()V")
            .unwrap_err();
        assert!(err.to_string().contains("demo.Gone"));
    }

    #[test]
    fn test_cyclic_superclass_chain() {
        let runtime = Runtime::new();
        let err = runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.Loop").extends("demo.Loop"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Resolution { .. }));

        runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.A").extends("demo.B"))
            .unwrap();
        runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.B").extends("demo.A"))
            .unwrap();
        let ctx = runtime.resolution_context();
        let err = ctx
            .resolve_virtual_method(ClassLoader::BOOT, "demo.A", "f", "()J")
            .unwrap_err();
        assert!(matches!(err, HarnessError::Resolution { .. }));
        assert!(err.to_string().contains("cyclic"));
        assert!(ctx.resolve_method(ClassLoader::BOOT, "demo.B", "f", "()J").is_err());

        // The read lock was released, so writers still get through.
        runtime
            .define_class(ClassLoader::BOOT, ClassBuilder::new("demo.After"))
            .unwrap();
    }

    #[test]
    fn test_resolve_any_kind() {
        let (runtime, loader) = hierarchy();
        let ctx = runtime.resolution_context();
        assert!(ctx.resolve_method(loader, "demo.Base", "secret", "()J").is_ok());
        assert!(ctx.resolve_method(loader, "demo.Derived", "inherited", "()J").is_ok());
        assert!(ctx.resolve_method(loader, "demo.Missing", "f", "()V").is_err());
    }
}
