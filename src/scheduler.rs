use crate::log::LogLevel::LogDebug;
use crate::task::Task;
use crate::trace::TraceReader;
use libc::pid_t;
use std::collections::BTreeMap;

/// The replay-side task registry. The trace decides which thread runs
/// next: each frame names its recorded tid, and the owning task is checked
/// out, given the frame, and driven by the replay loop.
pub struct Scheduler {
    tasks: BTreeMap<pid_t, Box<dyn Task>>,
    trace: Box<dyn TraceReader>,
}

impl Scheduler {
    pub fn new(trace: Box<dyn TraceReader>) -> Scheduler {
        Scheduler {
            tasks: BTreeMap::new(),
            trace,
        }
    }

    pub fn register_thread(&mut self, t: Box<dyn Task>) {
        log!(LogDebug, "registering rec tid {}", t.rec_tid());
        self.tasks.insert(t.rec_tid(), t);
    }

    pub fn num_threads(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_thread_alive(&self, rec_tid: pid_t) -> bool {
        self.tasks.contains_key(&rec_tid)
    }

    pub fn thread_list(&self) -> Vec<pid_t> {
        self.tasks.keys().copied().collect()
    }

    pub fn find_task(&self, rec_tid: pid_t) -> Option<&dyn Task> {
        self.tasks.get(&rec_tid).map(|t| &**t)
    }

    pub fn find_task_mut(&mut self, rec_tid: pid_t) -> Option<&mut (dyn Task + 'static)> {
        self.tasks.get_mut(&rec_tid).map(|t| &mut **t)
    }

    /// Check out the thread the next trace frame belongs to, with the frame
    /// already installed. Returns `None` at end of trace. The caller either
    /// returns the task with `put_thread` or drops it with
    /// `deregister_thread`.
    pub fn get_thread(&mut self) -> Option<Box<dyn Task>> {
        let frame = self.trace.next_frame()?;
        match self.tasks.remove(&frame.tid) {
            Some(mut t) => {
                t.set_frame(frame);
                Some(t)
            }
            None => {
                fatal!("Trace frame {} names unknown thread {}", frame.global_time, frame.tid);
                unreachable!()
            }
        }
    }

    pub fn put_thread(&mut self, t: Box<dyn Task>) {
        self.tasks.insert(t.rec_tid(), t);
    }

    /// The thread no longer exists; its counters and fds go with it.
    pub fn deregister_thread(&mut self, mut t: Box<dyn Task>) {
        log!(LogDebug, "deregistering rec tid {}", t.rec_tid());
        t.stop_hpc();
    }

    pub fn trace_mut(&mut self) -> &mut dyn TraceReader {
        &mut *self.trace
    }
}
