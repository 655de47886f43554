pub mod cpu;
pub mod stub;

pub use cpu::CpuBackend;
pub use stub::{scripted_palm, ScriptedBackend};
