//! The `ncron` daemon binary: CLI flags, logging, signal handling, the
//! process-spawn collaborator (with optional chroot/rlimit/uid-gid
//! enforcement), s6-style readiness notification, and the main dispatch
//! loop that drives `ncron::scheduler::Scheduler`. Everything spec.md §1
//! calls an "external collaborator" to the core lives here.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag as signal_flag;

use ncron::job::Job;
use ncron::scheduler::{DispatchOutcome, Scheduler, Spawn};
use ncron::ConfigLoader;

/// A cron/at hybrid scheduling daemon.
#[derive(Parser, Debug)]
#[command(name = "ncron", version, about)]
struct Cli {
    /// Path to the crontab file.
    #[arg(short = 't', long, default_value = "/etc/ncron/crontab")]
    crontab: PathBuf,

    /// Path to the history file.
    #[arg(short = 'H', long, default_value = "/var/lib/ncron/history")]
    history: PathBuf,

    /// Initial startup sleep, in seconds, before the dispatch loop begins.
    #[arg(short = 's', long, default_value_t = 0)]
    sleep: u64,

    /// Suppress all history writes.
    #[arg(short = '0', long)]
    noexecsave: bool,

    /// Persist history after every dispatch, regardless of each job's own
    /// `journal` setting.
    #[arg(short = 'j', long)]
    journal: bool,

    /// Write one byte to this file descriptor and close it once startup
    /// has completed, for supervisor readiness notification (s6 style).
    #[arg(short = 'd', long = "s6-notify")]
    s6_notify: Option<i32>,

    /// IANA timezone name used for all local-time decomposition. Defaults
    /// to the system's local timezone.
    #[arg(long)]
    timezone: Option<String>,

    /// Raise the log level from `info` to `debug`.
    #[arg(short = 'V', long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {:<28} {}",
                Local::now().format("%d/%m/%Y %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("ncron"),
                record.args()
            )
        })
        .init();
}

fn now_secs() -> ncron::Seconds {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs() as ncron::Seconds
}

/// Spawns jobs via `std::process::Command`, applying chroot/user/group/
/// rlimit enforcement in the child before `exec` on Unix targets (spec.md
/// §1's "optional chroot / rlimit / uid-gid enforcement applied inside a
/// spawned child").
struct ProcessSpawner;

impl Spawn for ProcessSpawner {
    fn spawn(&mut self, job: &Job) -> bool {
        let mut cmd = Command::new(&job.command);
        cmd.args(job.args.split_whitespace());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        #[cfg(unix)]
        apply_child_enforcement(&mut cmd, job);

        match cmd.spawn() {
            Ok(child) => {
                // Fire-and-forget: the daemon never wait()s on children
                // (spec.md §5). Dropping the handle lets the OS reap it.
                drop(child);
                true
            }
            Err(e) => {
                error!("job {}: failed to spawn `{}`: {e}", job.id, job.command);
                false
            }
        }
    }
}

#[cfg(unix)]
fn apply_child_enforcement(cmd: &mut Command, job: &Job) {
    use std::os::unix::process::CommandExt;

    let chroot = job.chroot.clone();
    let user = job.user.clone();
    let group = job.group.clone();
    let rlimits = job.rlimits.clone();

    unsafe {
        cmd.pre_exec(move || {
            // chroot(2) requires root, so it must run before the uid/gid
            // drop below — the original's `imprison` runs before its uid
            // drop for the same reason.
            if let Some(path) = &chroot {
                chroot_into(path)?;
            }
            if let Some(group) = &group {
                set_group(group)?;
            }
            if let Some(user) = &user {
                set_user(user)?;
            }
            apply_rlimits(&rlimits)?;
            Ok(())
        });
    }
}

#[cfg(unix)]
fn chroot_into(path: &str) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(path)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul in chroot path"))?;
    if unsafe { libc::chroot(c_path.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn set_user(name: &str) -> std::io::Result<()> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul in user name"))?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("unknown user `{name}`"),
        ));
    }
    let uid = unsafe { (*pw).pw_uid };
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn set_group(name: &str) -> std::io::Result<()> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "nul in group name"))?;
    let gr = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if gr.is_null() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("unknown group `{name}`"),
        ));
    }
    let gid = unsafe { (*gr).gr_gid };
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn apply_rlimits(rlimits: &ncron::job::Rlimits) -> std::io::Result<()> {
    let pairs: &[(libc::c_int, Option<(u64, u64)>)] = &[
        (libc::RLIMIT_CPU, rlimits.cpu),
        (libc::RLIMIT_FSIZE, rlimits.fsize),
        (libc::RLIMIT_DATA, rlimits.data),
        (libc::RLIMIT_STACK, rlimits.stack),
        (libc::RLIMIT_CORE, rlimits.core),
        (libc::RLIMIT_RSS, rlimits.rss),
        (libc::RLIMIT_NPROC, rlimits.nproc),
        (libc::RLIMIT_NOFILE, rlimits.nofile),
        (libc::RLIMIT_MEMLOCK, rlimits.memlock),
        (libc::RLIMIT_AS, rlimits.address_space),
    ];
    for (resource, pair) in pairs {
        let Some((soft, hard)) = pair else { continue };
        let to_rlim = |v: u64| if v == 0 { libc::RLIM_INFINITY } else { v as libc::rlim_t };
        let limit = libc::rlimit {
            rlim_cur: to_rlim(*soft),
            rlim_max: to_rlim(*hard),
        };
        if unsafe { libc::setrlimit(*resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn notify_ready(fd: i32) {
    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    if let Err(e) = file.write_all(b"\n") {
        warn!("failed to write s6 readiness notification to fd {fd}: {e}");
    }
    // `file`'s Drop closes the fd.
}

#[cfg(not(unix))]
fn notify_ready(_fd: i32) {
    warn!("--s6-notify is only supported on unix targets");
}

fn run_with_timezone<Tz>(cli: &Cli, tz: Tz, shutdown: Arc<AtomicBool>) -> i32
where
    Tz: chrono::TimeZone + Copy,
{
    let now = now_secs();
    let outcome = match ConfigLoader::load(&cli.crontab, &cli.history, &tz, now) {
        Ok(o) => o,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    info!(
        "loaded {} job(s) ({} live, {} dead)",
        outcome.table.len(),
        outcome.queue.len_live(),
        outcome.queue.len_dead()
    );

    if let Some(fd) = cli.s6_notify {
        notify_ready(fd);
    }

    let mut dispatcher = Scheduler::new(outcome.table, outcome.queue, cli.journal);
    let mut spawner = ProcessSpawner;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return final_save(&mut dispatcher, cli);
        }

        if dispatcher.pending_save() && !cli.noexecsave {
            if let Err(e) = dispatcher.save(&cli.history) {
                warn!("history save failed, will retry: {e}");
            }
        }

        let now = now_secs();
        match dispatcher.run_once(&tz, now, &mut spawner) {
            DispatchOutcome::QueueEmpty => {
                return final_save(&mut dispatcher, cli);
            }
            DispatchOutcome::SleepUntil(until) => {
                sleep_until(until, &shutdown);
            }
            DispatchOutcome::Dispatched(_) => {
                // More jobs may already be due; loop immediately instead
                // of sleeping (spec.md §4.8 step 3's inner `while`).
            }
        }
    }
}

/// Sleeps until wall-clock reaches `until`, recomputing the remaining
/// duration on every wake so a spurious or signal-interrupted wake doesn't
/// overshoot. This is the portable stand-in for the original's single
/// `clock_nanosleep(CLOCK_REALTIME, TIMER_ABSTIME, ...)` call (spec.md §9).
fn sleep_until(until: ncron::Seconds, shutdown: &Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let now = now_secs();
        if now >= until {
            return;
        }
        // Poll in one-second slices so a signal sets `shutdown` and is
        // observed promptly, rather than blocking for the full remainder.
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn final_save(dispatcher: &mut Scheduler, cli: &Cli) -> i32 {
    if cli.noexecsave {
        return 0;
    }
    match dispatcher.save(&cli.history) {
        Ok(()) => 0,
        Err(e) => {
            error!("final history save failed: {e}");
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.sleep > 0 {
        std::thread::sleep(Duration::from_secs(cli.sleep));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT, SIGHUP] {
        if let Err(e) = signal_flag::register(signal, Arc::clone(&shutdown)) {
            error!("failed to install handler for signal {signal}: {e}");
            std::process::exit(1);
        }
    }

    let code = match &cli.timezone {
        Some(name) => match name.parse::<chrono_tz::Tz>() {
            Ok(tz) => run_with_timezone(&cli, tz, shutdown),
            Err(_) => {
                error!("unknown timezone `{name}`");
                1
            }
        },
        None => run_with_timezone(&cli, Local, shutdown),
    };
    std::process::exit(code);
}
