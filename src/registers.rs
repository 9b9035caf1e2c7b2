use crate::log::LogLevel::LogError;
use crate::remote_ptr::RemotePtr;
use std::fmt::{Debug, Formatter, Result};

/// Debugger-visible register identifiers for the x86-64 user register set.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DbgRegister {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    OrigRax,
}

/// The registers a debugger sees, in reply order.
pub const DBG_REGISTER_FILE: [DbgRegister; 25] = [
    DbgRegister::Rax,
    DbgRegister::Rbx,
    DbgRegister::Rcx,
    DbgRegister::Rdx,
    DbgRegister::Rsi,
    DbgRegister::Rdi,
    DbgRegister::Rbp,
    DbgRegister::Rsp,
    DbgRegister::R8,
    DbgRegister::R9,
    DbgRegister::R10,
    DbgRegister::R11,
    DbgRegister::R12,
    DbgRegister::R13,
    DbgRegister::R14,
    DbgRegister::R15,
    DbgRegister::Rip,
    DbgRegister::Eflags,
    DbgRegister::Cs,
    DbgRegister::Ss,
    DbgRegister::Ds,
    DbgRegister::Es,
    DbgRegister::Fs,
    DbgRegister::Gs,
    DbgRegister::OrigRax,
];

#[derive(Copy, Clone, Debug)]
pub struct DbgRegValue {
    pub reg: DbgRegister,
    pub value: u64,
    pub defined: bool,
}

/// The trap flag is set while single-stepping and the resume flag can leak
/// out of a trap; neither is meaningful replay state.
const EFLAGS_COMPARE_MASK: u64 = !(0x100 /* TF */ | 0x10000 /* RF */);

/// An x86-64 user register file, as read from and written to a stopped
/// tracee.
#[derive(Copy, Clone)]
pub struct Registers {
    u: libc::user_regs_struct,
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            u: unsafe { std::mem::zeroed() },
        }
    }

    pub fn from_raw(u: libc::user_regs_struct) -> Registers {
        Registers { u }
    }

    pub fn raw(&self) -> &libc::user_regs_struct {
        &self.u
    }

    pub fn raw_mut(&mut self) -> &mut libc::user_regs_struct {
        &mut self.u
    }

    pub fn ip(&self) -> RemotePtr<u8> {
        RemotePtr::new_from_val(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemotePtr<u8>) {
        self.u.rip = addr.as_uint() as u64;
    }

    /// The syscall number as loaded before the syscall instruction.
    pub fn syscallno(&self) -> i64 {
        self.u.rax as i64
    }

    pub fn set_syscallno(&mut self, no: i64) {
        self.u.rax = no as u64;
    }

    /// The syscall number the kernel latched at a syscall boundary.
    pub fn original_syscallno(&self) -> i64 {
        self.u.orig_rax as i64
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        self.u.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> u64 {
        self.u.rax
    }

    pub fn set_syscall_result(&mut self, result: u64) {
        self.u.rax = result;
    }

    pub fn set_arg1(&mut self, value: u64) {
        self.u.rdi = value;
    }

    pub fn set_arg2(&mut self, value: u64) {
        self.u.rsi = value;
    }

    pub fn set_arg3(&mut self, value: u64) {
        self.u.rdx = value;
    }

    pub fn set_arg4(&mut self, value: u64) {
        self.u.r10 = value;
    }

    pub fn set_arg5(&mut self, value: u64) {
        self.u.r8 = value;
    }

    pub fn set_arg6(&mut self, value: u64) {
        self.u.r9 = value;
    }

    /// The value of `reg` as a debugger sees it.
    pub fn read_register(&self, reg: DbgRegister) -> u64 {
        match reg {
            DbgRegister::Rax => self.u.rax,
            DbgRegister::Rbx => self.u.rbx,
            DbgRegister::Rcx => self.u.rcx,
            DbgRegister::Rdx => self.u.rdx,
            DbgRegister::Rsi => self.u.rsi,
            DbgRegister::Rdi => self.u.rdi,
            DbgRegister::Rbp => self.u.rbp,
            DbgRegister::Rsp => self.u.rsp,
            DbgRegister::R8 => self.u.r8,
            DbgRegister::R9 => self.u.r9,
            DbgRegister::R10 => self.u.r10,
            DbgRegister::R11 => self.u.r11,
            DbgRegister::R12 => self.u.r12,
            DbgRegister::R13 => self.u.r13,
            DbgRegister::R14 => self.u.r14,
            DbgRegister::R15 => self.u.r15,
            DbgRegister::Rip => self.u.rip,
            DbgRegister::Eflags => self.u.eflags,
            DbgRegister::Cs => self.u.cs,
            DbgRegister::Ss => self.u.ss,
            DbgRegister::Ds => self.u.ds,
            DbgRegister::Es => self.u.es,
            DbgRegister::Fs => self.u.fs,
            DbgRegister::Gs => self.u.gs,
            DbgRegister::OrigRax => self.u.orig_rax,
        }
    }

    /// The whole debugger-visible register file.
    pub fn debugger_register_file(&self) -> Vec<DbgRegValue> {
        DBG_REGISTER_FILE
            .iter()
            .map(|&reg| DbgRegValue {
                reg,
                value: self.read_register(reg),
                defined: true,
            })
            .collect()
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Registers {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{{ rip: {:#x}, rax: {:#x}, orig_rax: {:#x}, rsp: {:#x} }}",
            self.u.rip, self.u.rax, self.u.orig_rax, self.u.rsp
        )
    }
}

/// Compare two register files and log each mismatching register. Returns
/// the number of mismatches; zero means the files agree.
pub fn compare_register_files(
    name1: &str,
    regs1: &Registers,
    name2: &str,
    regs2: &Registers,
) -> usize {
    let mut mismatches = 0;
    for &reg in DBG_REGISTER_FILE.iter() {
        let mut val1 = regs1.read_register(reg);
        let mut val2 = regs2.read_register(reg);
        if reg == DbgRegister::Eflags {
            val1 &= EFLAGS_COMPARE_MASK;
            val2 &= EFLAGS_COMPARE_MASK;
        }
        if val1 != val2 {
            mismatches += 1;
            log!(
                LogError,
                "{:?} {:#x} != {:#x} ({} vs. {})",
                reg,
                val1,
                val2,
                name1,
                name2
            );
        }
    }

    mismatches
}
