//! Builtin functions registered into the global environment.

pub mod base;
pub mod math;

use crescent_vm::vm::Vm;

/// Install the builtin set into a VM's globals.
pub fn register_all(vm: &mut Vm) {
    base::register(vm);
    math::register(vm);
}
