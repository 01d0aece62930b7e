//! # Seccomp Filter Compilation
//!
//! Turns a manifest seccomp section into a classic BPF filter program
//! with default-deny semantics. Compilation happens in two phases:
//!
//! 1. Name-based merge into an [`AllowList`]: the named profile's
//!    syscall set plus the manifest's explicit rules. Union semantics
//!    apply, except that two constraints on the same argument index
//!    with different masks are a hard [`Error::SeccompConflict`].
//! 2. Code generation: syscall names resolve to numbers for the build
//!    target and each allow-list entry becomes a compare-and-allow
//!    block. Anything that falls through hits the deny action.
//!
//! Phase 1 is platform independent, so rule conflicts are caught even
//! where syscall numbers cannot be resolved.
//!
//! Argument constraints compare both 32-bit halves of the u64 argument,
//! with the optional mask applied first. Constraints on different
//! indices must all hold; values on one index are alternatives.

use crate::error::{Error, Result};
use crate::manifest::{DenyAction, Profile, Seccomp, SyscallRule};
use crate::platform::{KernelInventory, SeccompAction};
use std::collections::{BTreeMap, BTreeSet};

// Classic BPF opcodes and seccomp return values. Kept local; the
// values are kernel ABI and do not change.
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_ALU: u16 = 0x04;
const BPF_AND: u16 = 0x50;
const BPF_K: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const EPERM: u32 = 1;

// Offsets into struct seccomp_data.
const DATA_NR: u32 = 0;
const DATA_ARCH: u32 = 4;
const DATA_ARGS: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: Option<u32> = Some(0xc000_003e);
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: Option<u32> = Some(0xc000_00b7);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const AUDIT_ARCH: Option<u32> = None;

/// Baseline syscall set for [`Profile::Default`].
///
/// Restricted to syscalls present on both x86_64 and aarch64: enough
/// for an ordinary dynamically linked application doing file and
/// socket I/O, nothing that grants new privilege.
const DEFAULT_PROFILE: &[&str] = &[
    "accept4",
    "bind",
    "brk",
    "chdir",
    "clock_gettime",
    "clock_nanosleep",
    "clone",
    "close",
    "connect",
    "dup",
    "dup3",
    "epoll_create1",
    "epoll_ctl",
    "epoll_pwait",
    "eventfd2",
    "execve",
    "exit",
    "exit_group",
    "fchmod",
    "fchown",
    "fcntl",
    "fdatasync",
    "flock",
    "fstat",
    "fsync",
    "futex",
    "getcwd",
    "getdents64",
    "getegid",
    "geteuid",
    "getgid",
    "getpeername",
    "getpid",
    "getrandom",
    "getsockname",
    "getsockopt",
    "gettid",
    "getuid",
    "ioctl",
    "kill",
    "listen",
    "lseek",
    "madvise",
    "memfd_create",
    "mkdirat",
    "mmap",
    "mprotect",
    "munmap",
    "nanosleep",
    "openat",
    "pipe2",
    "ppoll",
    "pread64",
    "prctl",
    "pselect6",
    "pwrite64",
    "read",
    "readlinkat",
    "readv",
    "recvfrom",
    "recvmsg",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sched_yield",
    "sendmsg",
    "sendto",
    "set_robust_list",
    "set_tid_address",
    "setsockopt",
    "shutdown",
    "sigaltstack",
    "socket",
    "statx",
    "timerfd_create",
    "timerfd_gettime",
    "timerfd_settime",
    "uname",
    "unlinkat",
    "wait4",
    "write",
    "writev",
];

// =============================================================================
// Allow List
// =============================================================================

/// Predicate over one syscall argument: `(arg & mask) ∈ values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgPredicate {
    pub mask: Option<u64>,
    pub values: BTreeSet<u64>,
}

/// Resolved permission for one syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSet {
    /// Permitted with any arguments.
    Any,
    /// Permitted only when every indexed predicate holds.
    Args(BTreeMap<usize, ArgPredicate>),
}

/// Name-keyed merge result of profile and explicit rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    rules: BTreeMap<String, RuleSet>,
}

impl AllowList {
    /// Builds the allow-list from a manifest seccomp section.
    ///
    /// # Errors
    ///
    /// [`Error::SeccompConflict`] when two rules constrain the same
    /// argument index of one syscall with different masks.
    pub fn from_manifest(seccomp: &Seccomp) -> Result<AllowList> {
        let mut rules: BTreeMap<String, RuleSet> = BTreeMap::new();

        if let Some(Profile::Default) = seccomp.profile {
            for name in DEFAULT_PROFILE {
                rules.insert((*name).to_string(), RuleSet::Any);
            }
        }

        for (syscall, rule) in &seccomp.allow {
            match rule {
                SyscallRule::Any(_) => {
                    rules.insert(syscall.clone(), RuleSet::Any);
                }
                SyscallRule::Args(args) => {
                    // Union with an existing Any stays Any.
                    if matches!(rules.get(syscall), Some(RuleSet::Any)) {
                        continue;
                    }
                    let mut predicates: BTreeMap<usize, ArgPredicate> = BTreeMap::new();
                    for arg in args {
                        match predicates.get_mut(&arg.index) {
                            None => {
                                predicates.insert(
                                    arg.index,
                                    ArgPredicate {
                                        mask: arg.mask,
                                        values: arg.values.iter().copied().collect(),
                                    },
                                );
                            }
                            Some(existing) if existing.mask == arg.mask => {
                                existing.values.extend(arg.values.iter().copied());
                            }
                            Some(_) => {
                                return Err(Error::SeccompConflict {
                                    syscall: syscall.clone(),
                                    index: arg.index,
                                });
                            }
                        }
                    }
                    rules.insert(syscall.clone(), RuleSet::Args(predicates));
                }
            }
        }

        Ok(AllowList { rules })
    }

    /// Iterates the resolved rules.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RuleSet)> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// =============================================================================
// Filter Program
// =============================================================================

/// One classic BPF instruction, layout-compatible with the kernel's
/// `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// Immutable compiled seccomp filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    instructions: Vec<SockFilter>,
}

impl FilterProgram {
    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Installs the filter on the calling thread.
    ///
    /// Sets `no_new_privs` first, which the kernel requires for
    /// unprivileged filter installation. Called in the child between
    /// fork and exec.
    #[cfg(target_os = "linux")]
    pub fn install(&self) -> Result<()> {
        let prog = libc::sock_fprog {
            len: self.instructions.len() as u16,
            filter: self.instructions.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: prog points at memory owned by self for the duration
        // of both calls.
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(Error::Sandbox(format!(
                "set no_new_privs: {}",
                std::io::Error::last_os_error()
            )));
        }
        let rc = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog) };
        if rc != 0 {
            return Err(Error::Sandbox(format!(
                "install seccomp filter: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Compiles a manifest seccomp section into a filter program.
///
/// Pure function of the section and the kernel inventory. All merge
/// conflicts and unknown explicit syscalls are compile errors; a
/// default-profile name the target does not know is skipped silently
/// (the profile is a superset across architectures).
pub fn compile(seccomp: &Seccomp, inventory: &KernelInventory) -> Result<FilterProgram> {
    if !inventory.seccomp {
        return Err(Error::Sandbox(
            "manifest requests seccomp but the kernel does not support it".to_string(),
        ));
    }
    let deny = deny_return(seccomp.deny, inventory)?;
    let allow_list = AllowList::from_manifest(seccomp)?;

    let mut resolved: Vec<(u32, &RuleSet)> = Vec::with_capacity(allow_list.len());
    for (name, rule) in allow_list.iter() {
        match syscall_number(name) {
            Some(nr) => resolved.push((nr, rule)),
            None if seccomp.allow.contains_key(name) => {
                return Err(Error::UnknownSyscall(name.clone()));
            }
            None => {}
        }
    }
    resolved.sort_by_key(|(nr, _)| *nr);

    let mut program = Builder::default();

    // Reject foreign-architecture syscalls outright.
    if let Some(arch) = AUDIT_ARCH {
        program.stmt(BPF_LD | BPF_W | BPF_ABS, DATA_ARCH);
        program.raw_jump(BPF_JMP | BPF_JEQ | BPF_K, arch, 1, 0);
        program.stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS);
    }

    program.stmt(BPF_LD | BPF_W | BPF_ABS, DATA_NR);
    for (nr, rule) in resolved {
        match rule {
            RuleSet::Any => {
                // If not this syscall, skip the allow and keep probing.
                program.raw_jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1);
                program.stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
            }
            RuleSet::Args(predicates) => {
                emit_arg_block(&mut program, nr, predicates, deny)?;
            }
        }
    }
    program.stmt(BPF_RET | BPF_K, deny);

    program.finish()
}

/// Emits the compare block for one argument-constrained syscall.
///
/// Layout:
///
/// ```text
/// JEQ nr ? +0 : end
///   per index: per value: load lo/hi, mask, compare
///   RET ALLOW          (all indices matched)
/// fail: RET deny       (matched syscall, bad arguments)
/// end:                 (accumulator still holds the syscall number)
/// ```
fn emit_arg_block(
    program: &mut Builder,
    nr: u32,
    predicates: &BTreeMap<usize, ArgPredicate>,
    deny: u32,
) -> Result<()> {
    let end = program.label();
    let fail = program.label();

    program.jump(BPF_JMP | BPF_JEQ | BPF_K, nr, Target::Next, Target::At(end));

    for (index, predicate) in predicates {
        let lo_offset = DATA_ARGS + 8 * *index as u32;
        let hi_offset = lo_offset + 4;
        let (mask_lo, mask_hi) = match predicate.mask {
            Some(mask) => (Some(mask as u32), Some((mask >> 32) as u32)),
            None => (None, None),
        };

        let index_ok = program.label();
        let values: Vec<u64> = predicate.values.iter().copied().collect();
        for (i, value) in values.iter().enumerate() {
            let masked = match predicate.mask {
                Some(mask) => value & mask,
                None => *value,
            };
            let last = i + 1 == values.len();
            let value_fail = program.label();
            let on_fail = if last { fail } else { value_fail };

            program.stmt(BPF_LD | BPF_W | BPF_ABS, lo_offset);
            if let Some(mask) = mask_lo {
                program.stmt(BPF_ALU | BPF_AND | BPF_K, mask);
            }
            program.jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                masked as u32,
                Target::Next,
                Target::At(on_fail),
            );
            program.stmt(BPF_LD | BPF_W | BPF_ABS, hi_offset);
            if let Some(mask) = mask_hi {
                program.stmt(BPF_ALU | BPF_AND | BPF_K, mask);
            }
            program.jump(
                BPF_JMP | BPF_JEQ | BPF_K,
                (masked >> 32) as u32,
                Target::At(index_ok),
                Target::At(on_fail),
            );
            program.bind(value_fail);
        }
        program.bind(index_ok);
    }

    program.stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
    program.bind(fail);
    program.stmt(BPF_RET | BPF_K, deny);
    program.bind(end);
    // Reload the syscall number clobbered by the argument loads. Only
    // the entry-jump path reaches here with the accumulator intact, but
    // reloading keeps the invariant local.
    program.stmt(BPF_LD | BPF_W | BPF_ABS, DATA_NR);
    Ok(())
}

fn deny_return(action: DenyAction, inventory: &KernelInventory) -> Result<u32> {
    match action {
        DenyAction::Kill => {
            if inventory.seccomp_actions.contains(&SeccompAction::KillProcess) {
                Ok(SECCOMP_RET_KILL_PROCESS)
            } else {
                Ok(SECCOMP_RET_KILL_THREAD)
            }
        }
        DenyAction::Errno => {
            if inventory.seccomp_actions.contains(&SeccompAction::Errno) {
                Ok(SECCOMP_RET_ERRNO | EPERM)
            } else {
                Err(Error::Sandbox(
                    "kernel lacks the errno seccomp action".to_string(),
                ))
            }
        }
    }
}

// =============================================================================
// Program Builder
// =============================================================================

/// Forward jump target.
#[derive(Debug, Clone, Copy)]
enum Target {
    /// Fall through to the next instruction.
    Next,
    /// Jump to a label bound later.
    At(Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

#[derive(Default)]
struct Builder {
    instructions: Vec<SockFilter>,
    // (instruction index, jt target, jf target)
    patches: Vec<(usize, Target, Target)>,
    labels: Vec<Option<usize>>,
}

impl Builder {
    fn stmt(&mut self, code: u16, k: u32) {
        self.instructions.push(SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        });
    }

    /// Jump with immediate numeric offsets.
    fn raw_jump(&mut self, code: u16, k: u32, jt: u8, jf: u8) {
        self.instructions.push(SockFilter { code, jt, jf, k });
    }

    /// Jump with label targets resolved at finish.
    fn jump(&mut self, code: u16, k: u32, jt: Target, jf: Target) {
        self.patches.push((self.instructions.len(), jt, jf));
        self.instructions.push(SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        });
    }

    fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.instructions.len());
    }

    fn finish(mut self) -> Result<FilterProgram> {
        for (index, jt, jf) in &self.patches {
            let jt = self.resolve(*index, *jt)?;
            let jf = self.resolve(*index, *jf)?;
            self.instructions[*index].jt = jt;
            self.instructions[*index].jf = jf;
        }
        Ok(FilterProgram {
            instructions: self.instructions,
        })
    }

    fn resolve(&self, from: usize, target: Target) -> Result<u8> {
        let to = match target {
            Target::Next => return Ok(0),
            Target::At(label) => self.labels[label.0]
                .ok_or_else(|| Error::Sandbox("unbound jump target".to_string()))?,
        };
        let offset = to
            .checked_sub(from + 1)
            .ok_or_else(|| Error::Sandbox("backward seccomp jump".to_string()))?;
        u8::try_from(offset)
            .map_err(|_| Error::Sandbox("seccomp filter block too large".to_string()))
    }
}

/// Resolves a syscall name to its number on the build target.
#[cfg(target_os = "linux")]
fn syscall_number(name: &str) -> Option<u32> {
    use libc::*;
    let nr: libc::c_long = match name {
        "accept4" => SYS_accept4,
        "bind" => SYS_bind,
        "brk" => SYS_brk,
        "chdir" => SYS_chdir,
        "clock_gettime" => SYS_clock_gettime,
        "clock_nanosleep" => SYS_clock_nanosleep,
        "clone" => SYS_clone,
        "close" => SYS_close,
        "connect" => SYS_connect,
        "dup" => SYS_dup,
        "dup3" => SYS_dup3,
        "epoll_create1" => SYS_epoll_create1,
        "epoll_ctl" => SYS_epoll_ctl,
        "epoll_pwait" => SYS_epoll_pwait,
        "eventfd2" => SYS_eventfd2,
        "execve" => SYS_execve,
        "exit" => SYS_exit,
        "exit_group" => SYS_exit_group,
        "fchmod" => SYS_fchmod,
        "fchown" => SYS_fchown,
        "fcntl" => SYS_fcntl,
        "fdatasync" => SYS_fdatasync,
        "flock" => SYS_flock,
        "fstat" => SYS_fstat,
        "fsync" => SYS_fsync,
        "futex" => SYS_futex,
        "getcwd" => SYS_getcwd,
        "getdents64" => SYS_getdents64,
        "getegid" => SYS_getegid,
        "geteuid" => SYS_geteuid,
        "getgid" => SYS_getgid,
        "getpeername" => SYS_getpeername,
        "getpid" => SYS_getpid,
        "getrandom" => SYS_getrandom,
        "getsockname" => SYS_getsockname,
        "getsockopt" => SYS_getsockopt,
        "gettid" => SYS_gettid,
        "getuid" => SYS_getuid,
        "ioctl" => SYS_ioctl,
        "kill" => SYS_kill,
        "listen" => SYS_listen,
        "lseek" => SYS_lseek,
        "madvise" => SYS_madvise,
        "memfd_create" => SYS_memfd_create,
        "mkdirat" => SYS_mkdirat,
        "mmap" => SYS_mmap,
        "mprotect" => SYS_mprotect,
        "munmap" => SYS_munmap,
        "nanosleep" => SYS_nanosleep,
        "openat" => SYS_openat,
        "pipe2" => SYS_pipe2,
        "ppoll" => SYS_ppoll,
        "pread64" => SYS_pread64,
        "prctl" => SYS_prctl,
        "pselect6" => SYS_pselect6,
        "pwrite64" => SYS_pwrite64,
        "read" => SYS_read,
        "readlinkat" => SYS_readlinkat,
        "readv" => SYS_readv,
        "recvfrom" => SYS_recvfrom,
        "recvmsg" => SYS_recvmsg,
        "rt_sigaction" => SYS_rt_sigaction,
        "rt_sigprocmask" => SYS_rt_sigprocmask,
        "rt_sigreturn" => SYS_rt_sigreturn,
        "sched_yield" => SYS_sched_yield,
        "sendmsg" => SYS_sendmsg,
        "sendto" => SYS_sendto,
        "set_robust_list" => SYS_set_robust_list,
        "set_tid_address" => SYS_set_tid_address,
        "setsockopt" => SYS_setsockopt,
        "shutdown" => SYS_shutdown,
        "sigaltstack" => SYS_sigaltstack,
        "socket" => SYS_socket,
        "statx" => SYS_statx,
        "timerfd_create" => SYS_timerfd_create,
        "timerfd_gettime" => SYS_timerfd_gettime,
        "timerfd_settime" => SYS_timerfd_settime,
        "uname" => SYS_uname,
        "unlinkat" => SYS_unlinkat,
        "wait4" => SYS_wait4,
        "write" => SYS_write,
        "writev" => SYS_writev,
        _ => return None,
    };
    Some(nr as u32)
}

#[cfg(not(target_os = "linux"))]
fn syscall_number(_name: &str) -> Option<u32> {
    None
}
