#![allow(non_camel_case_types)]

use libc::{c_int, pid_t};

pub const F_SETOWN_EX: c_int = 15;
pub const F_SETSIG: c_int = 10;

pub const F_OWNER_TID: c_int = 0;

#[repr(C)]
pub struct f_owner_ex {
    pub type_: c_int,
    pub pid: pid_t,
}
