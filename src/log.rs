use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::collections::HashMap;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Result, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    // Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send>;
        if let Ok(filename) = env::var("RETRACE_LOG_FILE") {
            f = Box::new(File::create(&filename).unwrap());
        } else if let Ok(append_filename) = env::var("RETRACE_APPEND_LOG_FILE") {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&append_filename)
                    .unwrap(),
            );
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("RETRACE_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        let mut default_level = LogWarn;
        let mut level_map: HashMap<String, LogLevel> = HashMap::new();
        if let Ok(spec) = env::var("RETRACE_LOG") {
            parse_log_spec(&spec, &mut default_level, &mut level_map);
        }

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

/// Parse a spec of the form `all:warn,perf_counters:debug,replayer:info`.
/// `all` sets the default level; anything unparseable is skipped.
fn parse_log_spec(
    spec: &str,
    default_level: &mut LogLevel,
    level_map: &mut HashMap<String, LogLevel>,
) {
    for item in spec.split(',') {
        let mut parts = item.splitn(2, ':');
        let name = parts.next().unwrap_or("").trim();
        let level = match parts.next().map(|l| l.trim().to_lowercase()) {
            Some(l) => match l.as_str() {
                "fatal" => LogFatal,
                "error" => LogError,
                "warn" => LogWarn,
                "info" => LogInfo,
                "debug" => LogDebug,
                _ => continue,
            },
            None => continue,
        };
        if name == "all" {
            *default_level = level;
        } else if !name.is_empty() {
            level_map.insert(name.to_owned(), level);
        }
    }
}

/// Given a module name, what is its log level?
fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // We DONT lowercase here as filenames are usually case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

/// Given a filename what is the corresponding module name?
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    path.file_stem().unwrap().to_string_lossy().to_string()
}

/// Given the filename get the corresponding LogModule.
fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        log_module.to_owned()
    } else {
        let name = filename_to_module_name(filename);
        let level = get_log_level(&name, l);
        let m = LogModule { level, name };
        l.log_modules_cache.insert(filename.to_owned(), m.clone());
        m
    }
}

fn log_name(level: LogLevel) -> String {
    match level {
        LogFatal => "FATAL".into(),
        LogError => "ERROR".into(),
        LogWarn => "WARN".into(),
        LogInfo => "INFO".into(),
        LogDebug => "DEBUG".into(),
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        func_name: &str,
        always_enabled: bool,
    ) -> NewLineTerminatingOstream {
        let mut lock = LOG_GLOBALS.lock().unwrap();
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        let mut this = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if enabled {
            if level == LogDebug {
                write!(this, "[{}] ", m.name).unwrap();
            } else {
                write_prefix(&mut this, level, filename, line, func_name);
            }
        }

        this
    }
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap();
            self.flush().unwrap();
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
            self.lock.log_file.flush()?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Need to pretend these were written. Otherwise we get a `Err` value
        // Custom { kind: WriteZero, error: "failed to write whole buffer" }
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    func_name: &str,
) {
    write!(stream, "[{} ", log_name(level)).unwrap();
    if level <= LogError {
        write!(stream, "{}:{} ", filename, line).unwrap();
    }

    write!(stream, "{}()", func_name).unwrap();
    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap();
    }
    write!(stream, "] ").unwrap();
}

pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> NewLineTerminatingOstream {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file
/// was specified). After this the program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let mut stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            write!(stream, $($args)+).unwrap()
        }
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file
/// was specified). Prints out the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let mut stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                write!(stream, $($args)+).unwrap();
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {{
        use std::io::stderr;
        use std::io::Write;
        crate::log::write_prefix(
            &mut stderr(),
            crate::log::LogFatal,
            file!(),
            line!(),
            module_path!(),
        );
        write!(stderr(), $($args)+).unwrap();
        write!(stderr(), "\n").unwrap();
        std::process::exit(1)
    }};
}

/// Assert a condition that must hold for replay to stay on the recorded
/// timeline; failure means the tracee has diverged from the trace.
macro_rules! ed_assert {
    ($task:expr, $cond:expr) => {
        {
            let t: &dyn crate::task::Task = &*$task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "Assertion `{}' failed to hold in task {} (rec tid {}). ",
                        stringify!($cond),
                        t.tid(),
                        t.rec_tid()
                    ).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
    ($task:expr, $cond:expr, $($args:tt)+) => {
        {
            let t: &dyn crate::task::Task = &*$task;
            if !$cond {
                {
                    use std::io::Write;
                    use crate::log::LogFatal;
                    let mut stream = crate::log::log(
                        LogFatal,
                        file!(),
                        line!(),
                        module_path!(),
                        true
                    );
                    write!(
                        stream,
                        "Assertion `{}' failed to hold in task {} (rec tid {}). ",
                        stringify!($cond),
                        t.tid(),
                        t.rec_tid()
                    ).unwrap();
                    write!(stream, $($args)+).unwrap();
                }
                crate::log::notifying_abort(backtrace::Backtrace::new());
            }
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_stack(bt);
    std::process::abort();
}

/// Write the backtrace to stderr.
fn dump_stack(bt: Backtrace) {
    write!(io::stderr(), "=== Start retrace backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End retrace backtrace\n").unwrap();
}
