//! The execution loop and fault recovery: CPU state, the handful of
//! opcodes always interpreted rather than copy-through translated, the
//! `sigsetjmp`/`siglongjmp` nonlocal-transfer primitive, and the signal
//! handler that ties a translation cache (`bt-chunk`) and address space
//! (`guest-memory`) to real guest execution (this design, §5, §6).

mod cpu;
mod exec_loop;
mod fault;
mod interpret;
mod process;
mod resume_point;
mod sink;

pub use cpu::{CpuState, FLAG_DF, FLAG_OF};
pub use exec_loop::{terminate_current_thread, terminate_other_thread, ExecutionLoop};
pub use fault::{deliver_cpu_exception, install_handlers, ActiveFaultGuard, CpuExceptionKind, UNWIND_SIGNAL};
pub use interpret::{interpret_exit_site, NextEip};
pub use process::{GuestProcess, GuestThread, StackWindow};
pub use resume_point::{enter_chunk, ResumePoint, UnwindReason};
pub use sink::{GuestFaultSink, RecordedFault, RecordingFaultSink};
