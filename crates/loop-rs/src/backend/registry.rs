//! Backend registry for runtime backend selection.
//!
//! A [`BackendRegistry`] maps backend names to constructors so callers can
//! pick an implementation by name without hardcoding backend types. The
//! registry is an explicit value: callers construct one, register the
//! backends they link in, and pass it wherever selection happens. The crate
//! itself keeps no process-wide table.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::spec::{
    BackendError, BackendResult, Instruction, PortableBackend, Program, TensorInit, TensorLiteral,
};

/// Opaque tensor handle as stored by the registry; downcasts recover the
/// concrete backend's handle type.
pub type BackendHandle = Box<dyn Any + Send + Sync>;

/// Builds a fresh backend each time [`BackendRegistry::create`] is called.
pub type BackendConstructor = Box<dyn Fn() -> Box<dyn ErasedBackend> + Send + Sync>;

/// Object-safe face of [`PortableBackend`], so registry lookups can return a
/// trait object. Handles cross this boundary as `Box<dyn Any>` and every method
/// downcasts them back before touching the real backend.
pub trait ErasedBackend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., "cpu").
    fn backend_name(&self) -> &str;

    /// Uploads host initialization data, yielding an erased handle.
    fn materialize(&self, init: TensorInit) -> BackendResult<BackendHandle>;

    /// Copies an erased handle back to the host as a dense literal.
    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single LTIR instruction with type-erased handles.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>>;

    /// Executes an entire LTIR program starting from the entry function.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>>;

    /// Clones the erased backend; the underlying instance is shared.
    fn clone_backend(&self) -> Box<dyn ErasedBackend>;

    /// Escape hatch for [`get_typed_backend`].
    fn as_any(&self) -> &dyn Any;
}

/// Adapter giving any [`PortableBackend`] the erased interface.
struct BackendWrapper<B: PortableBackend> {
    inner: Arc<B>,
}

impl<B: PortableBackend> BackendWrapper<B> {
    fn new(backend: B) -> Self {
        BackendWrapper {
            inner: Arc::new(backend),
        }
    }
}

fn recover_inputs<B: PortableBackend + 'static>(
    backend_name: &str,
    handles: &[BackendHandle],
) -> BackendResult<Vec<B::TensorHandle>> {
    handles
        .iter()
        .map(|handle| {
            handle
                .downcast_ref::<B::TensorHandle>()
                .cloned()
                .ok_or_else(|| {
                    BackendError::execution(format!(
                        "input handle type mismatch for backend {backend_name}"
                    ))
                })
        })
        .collect()
}

fn erase_outputs<B: PortableBackend + 'static>(
    outputs: Vec<B::TensorHandle>,
) -> Vec<BackendHandle> {
    outputs
        .into_iter()
        .map(|handle| Box::new(handle) as BackendHandle)
        .collect()
}

impl<B: PortableBackend + 'static> ErasedBackend for BackendWrapper<B> {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<BackendHandle> {
        Ok(Box::new(self.inner.materialize(init)?))
    }

    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral> {
        match handle.downcast_ref::<B::TensorHandle>() {
            Some(typed) => self.inner.to_literal(typed),
            None => Err(BackendError::execution(format!(
                "handle type mismatch for backend {}",
                self.backend_name()
            ))),
        }
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed = recover_inputs::<B>(self.backend_name(), inputs)?;
        let outputs = self.inner.execute_instruction(instruction, &typed)?;
        Ok(erase_outputs::<B>(outputs))
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed = recover_inputs::<B>(self.backend_name(), entry_inputs)?;
        let outputs = self.inner.run_program(program, &typed)?;
        Ok(erase_outputs::<B>(outputs))
    }

    fn clone_backend(&self) -> Box<dyn ErasedBackend> {
        Box::new(Self {
            inner: Arc::clone(&self.inner),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry mapping backend names to constructors.
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a backend by name with a constructor function.
    ///
    /// The constructor is called each time the backend is requested via
    /// [`BackendRegistry::create`].
    pub fn register<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn ErasedBackend> + Send + Sync + 'static,
    {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(name.into(), Box::new(constructor));
    }

    /// Registers a concrete PortableBackend implementation.
    ///
    /// Convenience wrapper that handles the BackendWrapper boilerplate.
    pub fn register_portable<B, F>(&self, name: impl Into<String>, constructor: F)
    where
        B: PortableBackend + 'static,
        F: Fn() -> B + Send + Sync + 'static,
    {
        self.register(name, move || Box::new(BackendWrapper::new(constructor())));
    }

    /// Creates a backend instance by name.
    ///
    /// Returns `None` if no backend with the given name has been registered.
    pub fn create(&self, name: &str) -> Option<Box<dyn ErasedBackend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    /// Lists all registered backend names.
    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Checks if a backend with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Recovers the typed backend behind an erased one.
///
/// Needed whenever selected-by-name backends feed typed surfaces such as
/// `DeviceTensor<B>`; returns `None` if `B` is not the registered type.
pub fn get_typed_backend<B: PortableBackend + 'static>(
    backend: &dyn ErasedBackend,
) -> Option<Arc<B>> {
    let wrapper = backend.as_any().downcast_ref::<BackendWrapper<B>>()?;
    Some(Arc::clone(&wrapper.inner))
}
