pub mod cpu;

pub use cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend, NoopInterceptor,
    TensorData,
};

use loop_rs::backend::registry::BackendRegistry;

/// Registers the CPU backend with the given registry.
///
/// The backend is registered under both "cpu" and "cpu-portable" names.
/// Registration is explicit: link this crate and call this on whichever
/// registry instance your application uses for backend selection.
pub fn register_cpu_backend(registry: &BackendRegistry) {
    let constructor = || GenericCpuBackend::with_interceptor(NoopInterceptor);
    registry.register_portable("cpu", constructor);
    registry.register_portable("cpu-portable", constructor);
}
