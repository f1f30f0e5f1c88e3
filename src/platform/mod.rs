// Platform-specific process termination
//
// A single terminate_tree(pid) capability with two implementations selected
// at build time, instead of conditionals scattered through the executor.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{configure_detached, terminate, terminate_tree};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{configure_detached, terminate, terminate_tree};
