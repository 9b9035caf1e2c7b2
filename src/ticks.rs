/// Counts of retired conditional branches executed in user mode by a
/// tracee. This is the engine's unit of logical time.
pub type Ticks = u64;
