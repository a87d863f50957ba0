//! Run a child process under a pseudo-terminal, rewriting its output.
//!
//! The child gets the PTY slave as its controlling terminal; the parent
//! keeps the master, forwards the invoker's stdin verbatim, and hands the
//! child's output to the rule engine in line-bounded chunks. A 5 ms flush
//! timeout pushes out pending partial lines (prompts) so they are never
//! held back indefinitely.
//!
//! Signal handlers cannot capture state, so the master fd, child pid and
//! saved terminal attributes live in a process-wide registry initialized
//! on spawn and cleared on drop.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use libc::c_int;

use crate::rewriter;

/// PTY setup failures.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    Open(io::Error),
    #[error("failed to fork: {0}")]
    Fork(io::Error),
}

static PTY_MASTER: AtomicI32 = AtomicI32::new(-1);
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);
static TTY_ACTIVE: AtomicBool = AtomicBool::new(false);
static TERMIOS_SAVED: AtomicBool = AtomicBool::new(false);

struct TermiosCell(UnsafeCell<MaybeUninit<libc::termios>>);
// Written before handlers are installed and inside the handlers themselves;
// the process is single-threaded.
unsafe impl Sync for TermiosCell {}

static SAVED_TERMIOS: TermiosCell = TermiosCell(UnsafeCell::new(MaybeUninit::uninit()));

fn install_handler(signum: c_int, handler: extern "C" fn(c_int), flags: c_int) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = flags;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signum, &sa, std::ptr::null_mut());
    }
}

/// Put the invoker's terminal in raw mode, keeping signal generation on.
fn setup_raw_terminal() {
    unsafe {
        let mut current: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(libc::STDIN_FILENO, &mut current) != 0 {
            return;
        }
        *SAVED_TERMIOS.0.get() = MaybeUninit::new(current);
        TERMIOS_SAVED.store(true, Ordering::Relaxed);
        let mut raw = current;
        libc::cfmakeraw(&mut raw);
        raw.c_lflag |= libc::ISIG;
        libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw);
    }
}

fn restore_terminal() {
    if TERMIOS_SAVED.load(Ordering::Relaxed) {
        unsafe {
            libc::tcsetattr(
                libc::STDIN_FILENO,
                libc::TCSANOW,
                (*SAVED_TERMIOS.0.get()).as_ptr(),
            );
        }
    }
}

fn copy_window_size() {
    let master = PTY_MASTER.load(Ordering::Relaxed);
    if master < 0 {
        return;
    }
    unsafe {
        let mut ws: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 {
            libc::ioctl(master, libc::TIOCSWINSZ, &ws);
        }
    }
}

extern "C" fn handle_sigwinch(_: c_int) {
    if TTY_ACTIVE.load(Ordering::Relaxed) {
        copy_window_size();
        let child = CHILD_PID.load(Ordering::Relaxed);
        if child > 0 {
            unsafe {
                libc::kill(child, libc::SIGWINCH);
            }
        }
    }
}

extern "C" fn handle_sigint(_: c_int) {
    // The PTY line discipline delivers this to the child's foreground group.
    let master = PTY_MASTER.load(Ordering::Relaxed);
    if master >= 0 {
        unsafe {
            libc::write(master, b"\x03".as_ptr().cast(), 1);
        }
    }
}

extern "C" fn handle_sigtstp(_: c_int) {
    if TTY_ACTIVE.load(Ordering::Relaxed) {
        restore_terminal();
    }
    let child = CHILD_PID.load(Ordering::Relaxed);
    if child > 0 {
        unsafe {
            libc::kill(child, libc::SIGSTOP);
        }
    }
    unsafe {
        libc::signal(libc::SIGTSTP, libc::SIG_DFL);
        libc::raise(libc::SIGTSTP);
    }
}

extern "C" fn handle_sigcont(_: c_int) {
    install_handler(libc::SIGTSTP, handle_sigtstp, 0);
    let child = CHILD_PID.load(Ordering::Relaxed);
    if child > 0 {
        unsafe {
            libc::kill(child, libc::SIGCONT);
        }
    }
    if TTY_ACTIVE.load(Ordering::Relaxed) {
        setup_raw_terminal();
    }
}

/// One `exec` invocation: the PTY master, the child, and the context the
/// rule engine needs per chunk.
pub struct ExecRunner {
    master: c_int,
    child: libc::pid_t,
    command_line: String,
    db_path: PathBuf,
    is_tty: bool,
}

impl ExecRunner {
    /// Open a PTY pair, fork, and exec `argv` on the slave side.
    pub fn spawn(argv: &[String], db_path: PathBuf) -> Result<Self, PtyError> {
        let command_line = argv.join(" ");
        let is_tty = unsafe {
            libc::isatty(libc::STDIN_FILENO) == 1 && libc::isatty(libc::STDOUT_FILENO) == 1
        };

        // CStrings are prepared before fork; the child must not allocate.
        let c_args: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).unwrap_or_default())
            .collect();
        let mut c_argv: Vec<*const libc::c_char> =
            c_args.iter().map(|a| a.as_ptr()).collect();
        c_argv.push(std::ptr::null());

        let mut master_fd: c_int = -1;
        let mut slave_fd: c_int = -1;
        unsafe {
            if libc::openpty(
                &mut master_fd,
                &mut slave_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ) != 0
            {
                return Err(PtyError::Open(io::Error::last_os_error()));
            }

            let pid = libc::fork();
            if pid < 0 {
                libc::close(master_fd);
                libc::close(slave_fd);
                return Err(PtyError::Fork(io::Error::last_os_error()));
            }

            if pid == 0 {
                // Child: new session, slave as controlling terminal.
                libc::close(master_fd);
                libc::setsid();
                libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0);
                libc::dup2(slave_fd, libc::STDIN_FILENO);
                libc::dup2(slave_fd, libc::STDOUT_FILENO);
                libc::dup2(slave_fd, libc::STDERR_FILENO);
                if slave_fd > libc::STDERR_FILENO {
                    libc::close(slave_fd);
                }
                libc::execvp(c_argv[0], c_argv.as_ptr());
                let msg = b"clitheme: exec failed\n";
                libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
                libc::_exit(127);
            }

            // Parent.
            libc::close(slave_fd);
            PTY_MASTER.store(master_fd, Ordering::Relaxed);
            CHILD_PID.store(pid, Ordering::Relaxed);
            TTY_ACTIVE.store(is_tty, Ordering::Relaxed);

            if is_tty {
                setup_raw_terminal();
                copy_window_size();
            }
            install_handler(libc::SIGWINCH, handle_sigwinch, libc::SA_RESTART);
            install_handler(libc::SIGINT, handle_sigint, 0);
            install_handler(libc::SIGTSTP, handle_sigtstp, 0);
            install_handler(libc::SIGCONT, handle_sigcont, libc::SA_RESTART);

            Ok(Self {
                master: master_fd,
                child: pid,
                command_line,
                db_path,
                is_tty,
            })
        }
    }

    fn emit(&self, chunk: &[u8]) {
        let processed =
            rewriter::process_chunk(&self.db_path, chunk, Some(&self.command_line), false);
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(&processed);
        let _ = stdout.flush();
    }

    fn write_master(&self, data: &[u8]) {
        let mut written = 0;
        while written < data.len() {
            let n = unsafe {
                libc::write(
                    self.master,
                    data[written..].as_ptr().cast(),
                    data.len() - written,
                )
            };
            if n < 0 {
                if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return;
            }
            written += n as usize;
        }
    }

    /// Event loop: poll the master (and stdin on a terminal), buffer child
    /// output to line boundaries, flush stalled partial lines after 5 ms.
    /// Returns the exit code to propagate.
    pub fn run(&mut self) -> i32 {
        let mut buffer: Vec<u8> = Vec::new();
        let mut read_buf = [0u8; 4096];
        let mut last_data = Instant::now();
        let flush_timeout = Duration::from_millis(5);

        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.master,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: libc::STDIN_FILENO,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let nfds: libc::nfds_t = if self.is_tty { 2 } else { 1 };
            let timeout: c_int = if buffer.is_empty() { -1 } else { 5 };

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout) };
            if ret == -1 {
                if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break;
            }
            if ret == 0 {
                if !buffer.is_empty() && last_data.elapsed() >= flush_timeout {
                    self.emit(&buffer);
                    buffer.clear();
                }
                continue;
            }

            if self.is_tty && fds[1].revents & libc::POLLIN != 0 {
                let n = unsafe {
                    libc::read(
                        libc::STDIN_FILENO,
                        read_buf.as_mut_ptr().cast(),
                        read_buf.len(),
                    )
                };
                if n > 0 {
                    self.write_master(&read_buf[..n as usize]);
                }
            }

            if fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                let n = unsafe {
                    libc::read(self.master, read_buf.as_mut_ptr().cast(), read_buf.len())
                };
                if n > 0 {
                    buffer.extend_from_slice(&read_buf[..n as usize]);
                    last_data = Instant::now();
                    if let Some(cut) = buffer.iter().rposition(|&b| b == b'\n' || b == b'\r') {
                        let complete: Vec<u8> = buffer.drain(..=cut).collect();
                        self.emit(&complete);
                    }
                } else if n < 0
                    && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
                {
                    continue;
                } else {
                    // EOF or EIO from the master: the child is gone.
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            self.emit(&buffer);
        }

        let mut status: c_int = 0;
        unsafe {
            libc::waitpid(self.child, &mut status, 0);
        }
        if self.is_tty {
            restore_terminal();
        }

        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        }
    }
}

impl Drop for ExecRunner {
    fn drop(&mut self) {
        if self.is_tty {
            restore_terminal();
        }
        unsafe {
            libc::close(self.master);
        }
        PTY_MASTER.store(-1, Ordering::Relaxed);
        CHILD_PID.store(-1, Ordering::Relaxed);
        TTY_ACTIVE.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_command(argv: &[&str]) -> i32 {
        let dir = TempDir::new().unwrap();
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let mut runner =
            ExecRunner::spawn(&argv, dir.path().join("absent.db")).expect("spawn failed");
        runner.run()
    }

    #[test]
    fn child_exit_code_is_propagated() {
        assert_eq!(run_command(&["sh", "-c", "exit 0"]), 0);
        assert_eq!(run_command(&["sh", "-c", "exit 3"]), 3);
    }

    #[test]
    fn signal_death_maps_to_128_plus_signo() {
        assert_eq!(run_command(&["sh", "-c", "kill -TERM $$"]), 128 + 15);
    }

    #[test]
    fn missing_command_exits_127() {
        assert_eq!(run_command(&["definitely-not-a-real-command-xyz"]), 127);
    }
}
