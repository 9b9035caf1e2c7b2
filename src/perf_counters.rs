use crate::bindings::fcntl::{f_owner_ex, F_OWNER_TID, F_SETOWN_EX, F_SETSIG};
use crate::flags::Flags;
use crate::kernel_metadata::signal_name;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use crate::util::{running_under_retrace, u8_slice};
use libc::{fcntl, pid_t, F_SETFL, O_ASYNC};
use nix::errno::errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::read;
use perf_event_open_sys::bindings as perf;
use perf_event_open_sys::bindings::perf_event_attr;
use perf_event_open_sys::ioctls;
use raw_cpuid::CpuId;
use std::io::{stderr, Write};
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

lazy_static! {
    static ref PMU_BRANCHES_ACCUMULATOR: Mutex<u32> = Mutex::new(0);
    static ref PMU_ATTRIBUTES: PmuAttributes = init_attributes();
    static ref PMU_BUGS: PmuBugs = check_for_bugs();
}

/// Force the PMU registry and the bug probes to run; any configuration
/// problem aborts here, before any tracee work begins.
pub fn init_pmu() {
    let activate_useless_counter = PMU_BUGS.activate_useless_counter;
    log!(
        LogDebug,
        "Initialized PMU successfully (activate_useless_counter={})",
        activate_useless_counter
    );
}

const NUM_BRANCHES: u64 = 500;

/// The magic hardware event an outer engine instance emulates for a nested
/// one; the nested instance must not program real raw events through an
/// emulated PMU.
const PERF_COUNT_NESTED_TICKS: u32 = 0x72747263;

/// This choice is fairly arbitrary; linux doesn't use SIGSTKFLT so we
/// hope that tracees don't either.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

const IN_TX: u64 = 1 << 32;
const IN_TXCP: u64 = 1 << 33;

/// Find out the cpu model using the cpuid instruction.
/// Full list of CPUIDs at http://sandpile.org/x86/cpuid.htm
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuMicroarch {
    UnknownCpu,
    IntelMerom,
    IntelPenryn,
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelKabylake,
}
use CpuMicroarch::*;

pub struct PmuConfig {
    uarch: CpuMicroarch,
    name: &'static str,
    rcb_cntr_event: u32,
    rinsn_cntr_event: u32,
    hw_intr_cntr_event: u32,
    supported: bool,
    /// Some CPUs turn off the whole PMU when there are no remaining events
    /// scheduled (perhaps as a power consumption optimization). This can be
    /// a very expensive operation, and is thus best avoided. For cpus where
    /// this is a problem, we keep a cycles counter (which corresponds to
    /// one of the fixed function counters, so we don't use up a
    /// programmable PMC) that we don't otherwise use, but keeps the PMU
    /// active, greatly increasing performance.
    benefits_from_useless_counter: bool,
}

/// XXX please only edit this if you really know what you're doing.
/// event = 0x5101c4:
/// - 51 = generic PMU
/// - 01 = umask for event BR_INST_RETIRED.CONDITIONAL
/// - c4 = eventsel for event BR_INST_RETIRED.CONDITIONAL
/// event = 0x5301cb:
/// - 53 = generic PMU
/// - 01 = umask for event HW_INTERRUPTS.RECEIVED
/// - cb = eventsel for event HW_INTERRUPTS.RECEIVED
/// See Intel 64 and IA32 Architectures Performance Monitoring Events.
const PMU_CONFIGS: [PmuConfig; 11] = [
    PmuConfig {
        uarch: IntelKabylake,
        name: "Intel Kabylake",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelSilvermont,
        name: "Intel Silvermont",
        rcb_cntr_event: 0x517ec4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: true,
    },
    PmuConfig {
        uarch: IntelSkylake,
        name: "Intel Skylake",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelBroadwell,
        name: "Intel Broadwell",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelHaswell,
        name: "Intel Haswell",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelIvyBridge,
        name: "Intel Ivy Bridge",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelSandyBridge,
        name: "Intel Sandy Bridge",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x5301cb,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelNehalem,
        name: "Intel Nehalem",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelWestmere,
        name: "Intel Westmere",
        rcb_cntr_event: 0x5101c4,
        rinsn_cntr_event: 0x5100c0,
        hw_intr_cntr_event: 0x50011d,
        supported: true,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelPenryn,
        name: "Intel Penryn",
        rcb_cntr_event: 0,
        rinsn_cntr_event: 0,
        hw_intr_cntr_event: 0,
        supported: false,
        benefits_from_useless_counter: false,
    },
    PmuConfig {
        uarch: IntelMerom,
        name: "Intel Merom",
        rcb_cntr_event: 0,
        rinsn_cntr_event: 0,
        hw_intr_cntr_event: 0,
        supported: false,
        benefits_from_useless_counter: false,
    },
];

/// The config whose display name contains `forced` (already lowercased),
/// if any.
fn find_forced_uarch(forced: &str) -> Option<&'static PmuConfig> {
    PMU_CONFIGS
        .iter()
        .find(|pmu| pmu.name.to_lowercase().contains(forced))
}

/// Return the detected, known microarchitecture of this CPU, or don't
/// return; i.e. never return UnknownCpu.
fn get_cpu_microarch() -> CpuMicroarch {
    let maybe_forced_uarch = Flags::get().forced_uarch.as_ref().map(|u| u.to_lowercase());
    if let Some(forced_uarch) = maybe_forced_uarch {
        match find_forced_uarch(&forced_uarch) {
            Some(pmu) => {
                log!(LogInfo, "Using forced uarch {}", pmu.name);
                return pmu.uarch;
            }
            None => {
                clean_fatal!(
                    "Forced uarch {} isn't known",
                    Flags::get().forced_uarch.as_ref().unwrap()
                );
            }
        }
    }

    let cpuid = CpuId::new();
    let cpuid_data = match cpuid.get_feature_info() {
        Some(info) => info,
        None => {
            clean_fatal!("CPUID leaf 1 unavailable; cannot detect microarchitecture");
        }
    };
    // The switch below matches eax & 0xF0FF0 of CPUID leaf 1.
    let cpu_type: u32 = ((cpuid_data.model_id() as u32) << 4)
        + ((cpuid_data.family_id() as u32) << 8)
        + ((cpuid_data.extended_model_id() as u32) << 16);
    match cpu_type {
        0x006F0 | 0x10660 => IntelMerom,
        0x10670 | 0x106D0 => IntelPenryn,
        0x106A0 | 0x106E0 | 0x206E0 => IntelNehalem,
        0x20650 | 0x206C0 | 0x206F0 => IntelWestmere,
        0x206A0 | 0x206D0 | 0x306e0 => IntelSandyBridge,
        0x306A0 => IntelIvyBridge,
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => IntelHaswell,
        0x306D0 | 0x40670 | 0x406F0 | 0x50660 => IntelBroadwell,
        0x406e0 | 0x506e0 => IntelSkylake,
        0x30670 | 0x406c0 | 0x50670 => IntelSilvermont,
        0x806e0 | 0x906e0 => IntelKabylake,
        _ => {
            clean_fatal!("CPU type {:#x} unknown", cpu_type);
        }
    }
}

/// init_perf_event_attr: the engine requires that its events count
/// userspace tracee code only.
fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_id;
    attr.size = size_of::<perf_event_attr>() as u32;
    attr.config = config;
    attr.set_exclude_kernel(1);
    attr.set_exclude_guest(1);
    attr
}

struct PmuAttributes {
    ticks_attr: perf_event_attr,
    cycles_attr: perf_event_attr,
    page_faults_attr: perf_event_attr,
    hw_interrupts_attr: perf_event_attr,
    instructions_retired_attr: perf_event_attr,
}

fn init_attributes() -> PmuAttributes {
    let uarch = get_cpu_microarch();
    let pmu = match PMU_CONFIGS.iter().find(|config| config.uarch == uarch) {
        Some(pmu) => pmu,
        None => {
            fatal!("No PMU config for detected uarch {:?}", uarch);
            unreachable!()
        }
    };
    if !pmu.supported {
        fatal!("Microarchitecture `{}' currently unsupported.", pmu.name);
    }

    let ticks_attr = if running_under_retrace() {
        new_perf_event_attr(
            perf::perf_type_id_PERF_TYPE_HARDWARE,
            PERF_COUNT_NESTED_TICKS as u64,
        )
    } else {
        new_perf_event_attr(perf::perf_type_id_PERF_TYPE_RAW, pmu.rcb_cntr_event as u64)
    };
    let cycles_attr = new_perf_event_attr(
        perf::perf_type_id_PERF_TYPE_HARDWARE,
        perf::perf_hw_id_PERF_COUNT_HW_CPU_CYCLES as u64,
    );
    let instructions_retired_attr = new_perf_event_attr(
        perf::perf_type_id_PERF_TYPE_RAW,
        pmu.rinsn_cntr_event as u64,
    );
    let mut hw_interrupts_attr = new_perf_event_attr(
        perf::perf_type_id_PERF_TYPE_RAW,
        pmu.hw_intr_cntr_event as u64,
    );
    // libpfm encodes the event with this bit set, so we'll do the
    // same thing.  Unclear if necessary.
    hw_interrupts_attr.set_exclude_hv(1);
    let page_faults_attr = new_perf_event_attr(
        perf::perf_type_id_PERF_TYPE_SOFTWARE,
        perf::perf_sw_ids_PERF_COUNT_SW_PAGE_FAULTS as u64,
    );

    PmuAttributes {
        ticks_attr,
        cycles_attr,
        page_faults_attr,
        hw_interrupts_attr,
        instructions_retired_attr,
    }
}

struct PmuBugs {
    has_ioc_period_bug: bool,
    has_kvm_in_txcp_bug: bool,
    activate_useless_counter: bool,
}

fn check_for_bugs() -> PmuBugs {
    if running_under_retrace() {
        // The outer engine presents an idealized performance counter, so
        // probing it is pointless. Probing would also take up an extra PMC
        // in the outer session; on CPUs with only 2 general purpose PMCs
        // we'd run out.
        return PmuBugs {
            has_ioc_period_bug: false,
            has_kvm_in_txcp_bug: false,
            activate_useless_counter: false,
        };
    }

    let has_ioc_period_bug = check_for_ioc_period_bug();
    let has_kvm_in_txcp_bug = check_for_kvm_in_txcp_bug();
    let activate_useless_counter = has_ioc_period_bug;
    PmuBugs {
        has_ioc_period_bug,
        has_kvm_in_txcp_bug,
        activate_useless_counter,
    }
}

/// Shortening a sample period with PERF_EVENT_IOC_PERIOD does not take
/// effect on some kernels: an overflow that the new period implies never
/// produces a pending event. Probe for that once; counters must be fully
/// recreated on every reset when the bug is present.
fn check_for_ioc_period_bug() -> bool {
    let mut attr: perf_event_attr = PMU_ATTRIBUTES.ticks_attr;
    attr.__bindgen_anon_1.sample_period = 0xffffffff;
    let (bug_fd, _) = start_counter(0, -1, &mut attr);

    let mut new_period: u64 = 1;
    if unsafe { ioctls::PERIOD(bug_fd.as_raw(), new_period) } != 0 {
        fatal!("ioctl(PERF_EVENT_IOC_PERIOD) failed");
    }

    let mut poll_bug_fd = [PollFd::new(bug_fd.as_raw(), PollFlags::POLLIN)];
    poll(&mut poll_bug_fd, 0).unwrap();

    let has_ioc_period_bug = poll_bug_fd[0]
        .revents()
        .unwrap_or_else(PollFlags::empty)
        .is_empty();
    log!(LogDebug, "has_ioc_period_bug={}", has_ioc_period_bug);
    has_ioc_period_bug
}

/// Under KVM's PMU virtualization an IN_TXCP counter can miss events
/// entirely. Count a known number of conditional branches through one and
/// see whether they all arrive; when they don't, the measure counter is
/// unusable and ticks fall back to the in-transaction strategy.
fn check_for_kvm_in_txcp_bug() -> bool {
    let mut count: u64 = 0;
    let mut attr: perf_event_attr = PMU_ATTRIBUTES.ticks_attr;
    attr.config |= IN_TXCP;
    attr.__bindgen_anon_1.sample_period = 0;
    let (fd, disabled_txcp) = start_counter(0, -1, &mut attr);
    if fd.is_open() && !disabled_txcp {
        unsafe {
            ioctls::DISABLE(fd.as_raw(), 0);
            ioctls::ENABLE(fd.as_raw(), 0);
        }
        do_branches();
        count = read_counter(&fd);
    }

    let has_kvm_in_txcp_bug = count > 0 && count < NUM_BRANCHES;
    log!(
        LogDebug,
        "has_kvm_in_txcp_bug={} count={}",
        has_kvm_in_txcp_bug,
        count
    );
    has_kvm_in_txcp_bug
}

fn always_recreate_counters() -> bool {
    // When we have the KVM IN_TXCP bug, reenabling the TXCP counter after
    // disabling it does not work.
    PMU_BUGS.has_ioc_period_bug || PMU_BUGS.has_kvm_in_txcp_bug
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut buf = [0u8; size_of::<u64>()];
    match read(fd.as_raw(), &mut buf) {
        Ok(nread) if nread == size_of::<u64>() => u64::from_le_bytes(buf),
        // A partial read of a perf counter indicates a kernel bug.
        _ => {
            fatal!("Could not read perf counter");
            unreachable!()
        }
    }
}

fn start_counter(tid: pid_t, group_fd: RawFd, attr: &mut perf_event_attr) -> (ScopedFd, bool) {
    let mut disabled_txcp = false;

    attr.set_pinned(0);
    if group_fd == -1 {
        attr.set_pinned(1);
    }

    let mut fd: RawFd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        ) as RawFd
    };
    if 0 > fd
        && errno() == libc::EINVAL
        && attr.type_ == perf::perf_type_id_PERF_TYPE_RAW
        && (attr.config & IN_TXCP == IN_TXCP)
    {
        // The kernel might not support IN_TXCP, so try again without it.
        let mut tmp_attr: perf_event_attr = *attr;
        tmp_attr.config &= !IN_TXCP;
        fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &mut tmp_attr,
                tid,
                -1,
                group_fd,
                0,
            ) as RawFd
        };
        if fd >= 0 {
            disabled_txcp = true;

            log!(LogWarn, "kernel does not support IN_TXCP");
            let cpuid = CpuId::new();
            let has_hle = cpuid
                .get_extended_feature_info()
                .map_or(false, |info| info.has_hle());
            if has_hle && !Flags::get().suppress_environment_warnings {
                write!(
                    stderr(),
                    "Your CPU supports Hardware Lock Elision but your kernel does\n\
                     not support setting the IN_TXCP PMU flag. Record and replay\n\
                     of code that uses HLE will fail unless you update your\n\
                     kernel.\n"
                )
                .unwrap();
            }
        }
    }

    if 0 > fd {
        if errno() == libc::EACCES {
            fatal!(
                "Permission denied to use 'perf_event_open'; are perf events \n\
                 enabled? Try 'perf record'."
            );
        }
        if errno() == libc::ENOENT {
            fatal!(
                "Unable to open performance counter with 'perf_event_open'; \n\
                 are perf events enabled? Try 'perf record'."
            );
        }
        fatal!("Failed to initialize counter");
    }

    (ScopedFd::from_raw(fd), disabled_txcp)
}

fn do_branches() {
    // Do NUM_BRANCHES conditional branches that can't be optimized out.
    // 'accumulator' is always odd and can't be zero.
    let mut accumulator: u32 = (unsafe { libc::rand() } as u32)
        .overflowing_mul(2)
        .0
        .overflowing_add(1)
        .0;
    for _ in 0..NUM_BRANCHES {
        if accumulator == 0 {
            break;
        }
        accumulator = accumulator.overflowing_mul(7).0.overflowing_add(2).0 & 0xffffff;
    }

    // Store the result where the optimizer can't prove it dead.
    let mut lock = PMU_BRANCHES_ACCUMULATOR.lock().unwrap();
    *lock = accumulator;
}

fn make_counter_async(fd: &ScopedFd, signal: i32) {
    if unsafe {
        fcntl(fd.as_raw(), F_SETFL, O_ASYNC) != 0 || fcntl(fd.as_raw(), F_SETSIG, signal) != 0
    } {
        fatal!(
            "Failed to make ticks counter ASYNC with {}",
            signal_name(signal)
        );
    }
}

/// `attr` describes the same event as the canonical ticks event, modulo
/// the sample period and the IN_TXCP bit.
fn is_same_event_modulo_period_and_txcp(
    canonical: &perf_event_attr,
    attr: &perf_event_attr,
) -> bool {
    let mut tmp_attr: perf_event_attr = *attr;
    tmp_attr.__bindgen_anon_1.sample_period = 0;
    tmp_attr.config &= !IN_TXCP;
    let mut canonical_attr: perf_event_attr = *canonical;
    canonical_attr.__bindgen_anon_1.sample_period = 0;
    u8_slice(&canonical_attr) == u8_slice(&tmp_attr)
}

/// Extra per-task counts, only meaningful when extra counters are enabled
/// by configuration.
#[derive(Copy, Clone, Default, Debug)]
pub struct Extra {
    pub page_faults: u64,
    pub hw_interrupts: u64,
    pub instructions_retired: u64,
}

/// A per-task ticks counter.
///
/// We use separate fds for counting ticks and for generating interrupts.
/// The former ignores ticks in aborted transactions, and does not support
/// sample_period; the latter does not ignore ticks in aborted transactions,
/// but does support sample_period.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks_interrupt: ScopedFd,
    fd_ticks_measure: ScopedFd,
    fd_ticks_in_transaction: ScopedFd,
    fd_useless_counter: ScopedFd,
    fd_page_faults: ScopedFd,
    fd_hw_interrupts: ScopedFd,
    fd_instructions_retired: ScopedFd,
    started: bool,
    counting: bool,
}

impl PerfCounters {
    /// Bind to `tid`. No kernel counter is opened until the first `reset`.
    pub fn new(tid: pid_t) -> Self {
        PerfCounters {
            tid,
            fd_ticks_interrupt: ScopedFd::new(),
            fd_ticks_measure: ScopedFd::new(),
            fd_ticks_in_transaction: ScopedFd::new(),
            fd_useless_counter: ScopedFd::new(),
            fd_page_faults: ScopedFd::new(),
            fd_hw_interrupts: ScopedFd::new(),
            fd_instructions_retired: ScopedFd::new(),
            started: false,
            counting: false,
        }
    }

    pub fn set_tid(&mut self, tid: pid_t) {
        self.stop();
        self.tid = tid;
    }

    /// True when `attr` is an event this engine programs for ticks,
    /// whatever its sample period and IN_TXCP bit.
    pub fn is_ticks_attr(attr: &perf_event_attr) -> bool {
        is_same_event_modulo_period_and_txcp(&PMU_ATTRIBUTES.ticks_attr, attr)
    }

    /// When an interrupt is requested, at most this many ticks may elapse
    /// before the interrupt is delivered.
    pub fn skid_size() -> Ticks {
        100
    }

    /// Reset all counter values to 0 and program the counters to send
    /// TIME_SLICE_SIGNAL when `ticks_period` tick events have elapsed. (In
    /// reality the hardware triggers its interrupt some time after that;
    /// see `skid_size`.) This must be called while the task is stopped, and
    /// before the task is allowed to run again.
    /// A `ticks_period` of zero means don't interrupt at all.
    pub fn reset(&mut self, param_ticks_period: Ticks) {
        let mut ticks_period = param_ticks_period;
        if ticks_period == 0 && !always_recreate_counters() {
            // We can't switch a counter between sampling and non-sampling
            // via PERF_EVENT_IOC_PERIOD so just turn 0 into a very big
            // number.
            ticks_period = 1 << 60;
        }

        if !self.started {
            log!(
                LogDebug,
                "Recreating counters with period {} ({:#x})",
                ticks_period,
                ticks_period
            );

            let mut attr = PMU_ATTRIBUTES.ticks_attr;
            attr.__bindgen_anon_1.sample_period = ticks_period;
            self.fd_ticks_interrupt = start_counter(self.tid, -1, &mut attr).0;

            if PMU_BUGS.has_kvm_in_txcp_bug {
                // IN_TXCP isn't going to work reliably. Assume that HLE/RTM
                // are not used, and check that in read_ticks.
                attr.__bindgen_anon_1.sample_period = 0;
                attr.config |= IN_TX;
                self.fd_ticks_in_transaction =
                    start_counter(self.tid, self.fd_ticks_interrupt.as_raw(), &mut attr).0;
            } else {
                // Set up a separate counter for measuring ticks, which does
                // not have a sample period and does not count events during
                // aborted transactions. We have to use two separate
                // counters here because the kernel does not support setting
                // a sample_period with IN_TXCP, apparently for reasons
                // related to this Intel note on IA32_PERFEVTSEL2:
                // ``When IN_TXCP=1 & IN_TX=1 and in sampling, spurious PMI
                // may occur and transactions may continuously abort near
                // overflow conditions. Software should favor using IN_TXCP
                // for counting over sampling.''
                attr.__bindgen_anon_1.sample_period = 0;
                attr.config |= IN_TXCP;
                self.fd_ticks_measure =
                    start_counter(self.tid, self.fd_ticks_interrupt.as_raw(), &mut attr).0;
            }

            if PMU_BUGS.activate_useless_counter && !self.fd_useless_counter.is_open() {
                // N.B.: This is deliberately not in the same group as the
                // other counters since we want to keep it scheduled at all
                // times.
                let mut cycles_attr = PMU_ATTRIBUTES.cycles_attr;
                self.fd_useless_counter = start_counter(self.tid, -1, &mut cycles_attr).0;
            }

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe {
                fcntl(
                    self.fd_ticks_interrupt.as_raw(),
                    F_SETOWN_EX,
                    &own as *const f_owner_ex,
                )
            } != 0
            {
                fatal!("Failed to SETOWN_EX ticks event fd");
            }
            make_counter_async(&self.fd_ticks_interrupt, TIME_SLICE_SIGNAL);

            if Flags::get().extra_perf_counters {
                let group_leader = self.fd_ticks_interrupt.as_raw();
                let mut hw_interrupts_attr = PMU_ATTRIBUTES.hw_interrupts_attr;
                self.fd_hw_interrupts =
                    start_counter(self.tid, group_leader, &mut hw_interrupts_attr).0;
                let mut instructions_retired_attr = PMU_ATTRIBUTES.instructions_retired_attr;
                self.fd_instructions_retired =
                    start_counter(self.tid, group_leader, &mut instructions_retired_attr).0;
                let mut page_faults_attr = PMU_ATTRIBUTES.page_faults_attr;
                self.fd_page_faults =
                    start_counter(self.tid, group_leader, &mut page_faults_attr).0;
            }
        } else {
            log!(
                LogDebug,
                "Resetting counters with period {} ({:#x})",
                ticks_period,
                ticks_period
            );

            if unsafe { ioctls::RESET(self.fd_ticks_interrupt.as_raw(), 0) } != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
            }
            if unsafe { ioctls::PERIOD(self.fd_ticks_interrupt.as_raw(), ticks_period) } != 0
            {
                fatal!(
                    "ioctl(PERF_EVENT_IOC_PERIOD) failed with period {}",
                    ticks_period
                );
            }
            if unsafe { ioctls::ENABLE(self.fd_ticks_interrupt.as_raw(), 0) } != 0 {
                fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
            }
            if self.fd_ticks_measure.is_open() {
                if unsafe { ioctls::RESET(self.fd_ticks_measure.as_raw(), 0) } != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
                }
                if unsafe { ioctls::ENABLE(self.fd_ticks_measure.as_raw(), 0) } != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
                }
            }
            if self.fd_ticks_in_transaction.is_open() {
                if unsafe { ioctls::RESET(self.fd_ticks_in_transaction.as_raw(), 0) } != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_RESET) failed");
                }
                if unsafe { ioctls::ENABLE(self.fd_ticks_in_transaction.as_raw(), 0) } != 0 {
                    fatal!("ioctl(PERF_EVENT_IOC_ENABLE) failed");
                }
            }
        }

        self.started = true;
        self.counting = true;
    }

    /// Close the perf counter fds. They will be automatically reopened
    /// if/when reset is called again.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;

        self.fd_ticks_interrupt.close();
        self.fd_ticks_measure.close();
        self.fd_ticks_in_transaction.close();
        self.fd_useless_counter.close();
        self.fd_page_faults.close();
        self.fd_hw_interrupts.close();
        self.fd_instructions_retired.close();
    }

    /// Suspend counting until the next reset. This may or may not actually
    /// stop the performance counters, depending on whether or not this is
    /// required for correctness on this kernel version.
    pub fn stop_counting(&mut self) {
        if !self.counting {
            return;
        }

        self.counting = false;
        if always_recreate_counters() {
            self.stop();
        } else {
            unsafe {
                ioctls::DISABLE(self.fd_ticks_interrupt.as_raw(), 0);
                if self.fd_ticks_measure.is_open() {
                    ioctls::DISABLE(self.fd_ticks_measure.as_raw(), 0);
                }
                if self.fd_ticks_in_transaction.is_open() {
                    ioctls::DISABLE(self.fd_ticks_in_transaction.as_raw(), 0);
                }
            }
        }
    }

    /// Read the current value of the ticks counter. Returns 0 unless the
    /// counter is started and counting.
    pub fn read_ticks(&self) -> Ticks {
        if !self.started || !self.counting {
            return 0;
        }

        if self.fd_ticks_in_transaction.is_open() {
            let transaction_ticks = read_counter(&self.fd_ticks_in_transaction);
            if transaction_ticks > 0 {
                log!(LogDebug, "{} IN_TX ticks detected", transaction_ticks);
                if !Flags::get().force_things {
                    fatal!(
                        "{} IN_TX ticks detected while HLE not supported due to KVM PMU\n\
                         virtualization bug. See \
                         http://marc.info/?l=linux-kernel&m=148582794808419&w=2\n\
                         Aborting. Retry with -F to override, but it will probably\n\
                         fail.",
                        transaction_ticks
                    );
                }
            }
        }

        let interrupt_val = read_counter(&self.fd_ticks_interrupt);
        if !self.fd_ticks_measure.is_open() {
            return interrupt_val;
        }

        let measure_val = read_counter(&self.fd_ticks_measure);
        if measure_val > interrupt_val {
            // There is some kind of kernel or hardware bug that means we
            // sometimes see more events with IN_TXCP set than without.
            // These are clearly spurious events :-(. For now, work around
            // it by returning the interrupt_val. That will work if HLE
            // hasn't been used in this interval. Note that
            // interrupt_val > measure_val is valid behavior (when HLE is
            // being used).
            log!(
                LogDebug,
                "Measured too many ticks; measure={}, interrupt={}",
                measure_val,
                interrupt_val
            );
            return interrupt_val;
        }
        measure_val
    }

    /// Read the counts beyond ticks. Only meaningful when extra counters
    /// are enabled by configuration; returns zeros when stopped.
    pub fn read_extra(&self) -> Extra {
        debug_assert!(Flags::get().extra_perf_counters);

        if self.started {
            Extra {
                page_faults: read_counter(&self.fd_page_faults),
                hw_interrupts: read_counter(&self.fd_hw_interrupts),
                instructions_retired: read_counter(&self.fd_instructions_retired),
            }
        } else {
            Extra::default()
        }
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_config_has_a_distinct_uarch() {
        for (i, a) in PMU_CONFIGS.iter().enumerate() {
            for b in PMU_CONFIGS.iter().skip(i + 1) {
                assert!(a.uarch != b.uarch);
            }
        }
    }

    #[test]
    fn supported_configs_have_event_codes() {
        for pmu in PMU_CONFIGS.iter() {
            if pmu.supported {
                assert!(pmu.rcb_cntr_event != 0, "{} has no ticks event", pmu.name);
                assert!(
                    pmu.rinsn_cntr_event != 0,
                    "{} has no instructions event",
                    pmu.name
                );
            }
        }
    }

    #[test]
    fn forced_uarch_matches_by_substring() {
        assert_eq!(
            IntelSkylake,
            find_forced_uarch("skylake").unwrap().uarch
        );
        assert_eq!(
            IntelSandyBridge,
            find_forced_uarch("sandy bridge").unwrap().uarch
        );
        // Substring matching: "bridge" picks whichever bridge comes first
        // in the table.
        assert!(find_forced_uarch("bridge").is_some());
        assert!(find_forced_uarch("zen5").is_none());
    }

    #[test]
    fn ticks_attr_probe_ignores_period_and_txcp() {
        let canonical = new_perf_event_attr(perf::perf_type_id_PERF_TYPE_RAW, 0x5101c4);

        let mut attr = canonical;
        attr.__bindgen_anon_1.sample_period = 123456;
        attr.config |= IN_TXCP;
        assert!(is_same_event_modulo_period_and_txcp(&canonical, &attr));

        let mut other_event = canonical;
        other_event.config = 0x5101c0;
        assert!(!is_same_event_modulo_period_and_txcp(
            &canonical,
            &other_event
        ));

        let mut in_tx = canonical;
        in_tx.config |= IN_TX;
        assert!(!is_same_event_modulo_period_and_txcp(&canonical, &in_tx));
    }
}
