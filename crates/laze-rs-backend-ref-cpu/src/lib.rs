pub mod cpu;

pub use cpu::{
    CpuKernelInterceptor, CpuRefBackend, CpuStorage, CpuTensor, GenericCpuBackend, NoopInterceptor,
};
