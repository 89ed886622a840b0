//! Calling conventions.
//!
//! A [`CallingConvention`] pairs the volatile-register set with a procedure
//! that computes a [`FunctionCallSetup`] for a signature: which storage
//! holds each parameter on the caller and callee side, where the return
//! value travels in each direction, and how much stack the outgoing
//! arguments need. Conventions are statics compared by reference.

mod system_v;
mod windows_x64;

pub use system_v::{classify as system_v_classify, SystemVClass, SystemVClassification};

use crate::context::Compilation;
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::function::FunctionInfo;
use crate::storage::{Register, StackArea, Storage};

/// How control transfers into the callee.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionCallJump {
    Call,
    Syscall,
}

/// Whether an argument is viewed from the call site or from inside the
/// callee body; decides which stack area a base-relative argument lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentMode {
    Call,
    Body,
}

/// Where one argument lives.
#[derive(Clone, Copy, Debug)]
pub enum ArgumentPlacement<'c> {
    /// A concrete storage, the same from both sides of the call.
    Absolute(Storage<'c>),
    /// On the stack, `offset` bytes into the argument area; the concrete
    /// storage depends on the viewing side.
    BaseRelative { offset: i32 },
}

#[derive(Clone, Copy, Debug)]
pub struct ArgumentsLayoutItem<'c> {
    pub name: &'c str,
    pub descriptor: &'c Descriptor<'c>,
    pub placement: ArgumentPlacement<'c>,
}

impl<'c> ArgumentsLayoutItem<'c> {
    pub fn storage(&self, mode: ArgumentMode) -> Storage<'c> {
        match self.placement {
            ArgumentPlacement::Absolute(storage) => storage,
            ArgumentPlacement::BaseRelative { offset } => {
                let area = match mode {
                    ArgumentMode::Call => StackArea::CallTargetArgument,
                    ArgumentMode::Body => StackArea::ReceivedArgument,
                };
                Storage::stack(area, offset, self.descriptor.bit_size())
            }
        }
    }
}

/// The computed argument/return placement for one signature.
#[derive(Clone, Debug)]
pub struct FunctionCallSetup<'c> {
    pub jump: FunctionCallJump,
    pub calling_convention: &'static CallingConvention,
    /// Where the caller sees the returned value.
    pub caller_return: Storage<'c>,
    /// Where the callee must leave the returned value.
    pub callee_return: Storage<'c>,
    pub arguments_layout: Vec<ArgumentsLayoutItem<'c>>,
    /// Bytes of stack the caller sets aside for arguments to this function.
    pub parameters_stack_size: u32,
}

impl<'c> FunctionCallSetup<'c> {
    pub fn argument_storage(&self, index: usize, mode: ArgumentMode) -> Storage<'c> {
        self.arguments_layout[index].storage(mode)
    }
}

pub struct CallingConvention {
    pub name: &'static str,
    /// Caller-saved registers; the callee may clobber them without saving.
    pub register_volatile_bitset: u32,
    pub call_setup_proc:
        for<'c> fn(&'c Compilation, &'c FunctionInfo<'c>) -> Result<FunctionCallSetup<'c>>,
}

impl CallingConvention {
    pub fn call_setup<'c>(
        &'static self,
        compilation: &'c Compilation,
        function: &'c FunctionInfo<'c>,
    ) -> Result<FunctionCallSetup<'c>> {
        (self.call_setup_proc)(compilation, function)
    }

    pub fn is_volatile(&self, register: Register) -> bool {
        self.register_volatile_bitset & (1 << register.bit()) != 0
    }

    #[inline]
    pub fn same(a: &'static CallingConvention, b: &'static CallingConvention) -> bool {
        core::ptr::eq(a, b)
    }
}

impl core::fmt::Debug for CallingConvention {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(self.name)
    }
}

const fn bit(register: Register) -> u32 {
    1 << register as u8
}

pub static CALLING_CONVENTION_X86_64_WINDOWS: CallingConvention = CallingConvention {
    name: "windows_x64",
    register_volatile_bitset:
        // Arguments
        bit(Register::C) | bit(Register::D) | bit(Register::R8) | bit(Register::R9)
        // Return
        | bit(Register::A)
        // Other
        | bit(Register::R10) | bit(Register::R11),
    call_setup_proc: windows_x64::call_setup,
};

pub static CALLING_CONVENTION_X86_64_SYSTEM_V: CallingConvention = CallingConvention {
    name: "system_v",
    register_volatile_bitset:
        // Arguments
        bit(Register::Di) | bit(Register::Si) | bit(Register::D)
        | bit(Register::C) | bit(Register::R8) | bit(Register::R9)
        // Return
        | bit(Register::A)
        // Other
        | bit(Register::R10) | bit(Register::R11),
    call_setup_proc: system_v::call_setup,
};

pub static CALLING_CONVENTION_X86_64_SYSTEM_V_SYSCALL: CallingConvention = CallingConvention {
    name: "system_v_syscall",
    register_volatile_bitset:
        // Arguments
        bit(Register::Di) | bit(Register::Si) | bit(Register::D)
        | bit(Register::R10) | bit(Register::R8) | bit(Register::R9)
        // Return
        | bit(Register::A)
        // Other
        | bit(Register::C) | bit(Register::R11),
    call_setup_proc: system_v::syscall_setup,
};
