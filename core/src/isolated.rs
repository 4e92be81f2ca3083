//! Evaluation hosted in a child process.
//!
//! An in-process thread can only be stopped when it cooperates. A child
//! process can always be killed, so evaluations that may spin in native code
//! should run here. The child gets its own process group (signals reach
//! whatever it spawns), and on Linux it dies with the server.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::process::Child;
use std::process::ChildStdin;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::error::TerminationError;
use crate::input::InputReader;
use crate::sink::ByteSink;
use crate::sink::lock_state;
use crate::termination::StopDelivery;
use crate::termination::Terminable;
use crate::termination::TerminationSignal;

const PUMP_BUFFER_SIZE: usize = 8 * 1024;
const EXIT_POLL: Duration = Duration::from_millis(10);

pub struct IsolatedProcess {
    label: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    status: Arc<Mutex<Option<ExitStatus>>>,
    done: Arc<watch::Sender<bool>>,
    waiter: Mutex<Option<JoinHandle<()>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl IsolatedProcess {
    /// Spawns `command` with piped stdio. Everything the child prints is
    /// pumped into `stdout` and `stderr`, which are flushed (not closed) when
    /// the child's side of the pipe closes.
    pub fn spawn(
        label: impl Into<String>,
        mut command: Command,
        stdout: Arc<dyn ByteSink>,
        stderr: Arc<dyn ByteSink>,
    ) -> Result<Self, TerminationError> {
        let label = label.into();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let stdin = child.stdin.take();
        debug!(label = %label, pid, "isolated process spawned");

        let mut pumps = Vec::new();
        if let Some(pipe) = child_stdout {
            pumps.push(spawn_pump(format!("{label}-stdout"), pipe, stdout)?);
        }
        if let Some(pipe) = child_stderr {
            pumps.push(spawn_pump(format!("{label}-stderr"), pipe, stderr)?);
        }

        let child = Arc::new(Mutex::new(child));
        let status = Arc::new(Mutex::new(None));
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);
        let waiter = thread::Builder::new().name(format!("{label}-wait")).spawn({
            let child = Arc::clone(&child);
            let status = Arc::clone(&status);
            let done = Arc::clone(&done);
            let label = label.clone();
            move || wait_for_exit(&label, &child, &status, &done)
        })?;

        Ok(Self {
            label,
            pid,
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            status,
            done,
            waiter: Mutex::new(Some(waiter)),
            pumps: Mutex::new(pumps),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *lock_state(&self.status)
    }

    pub fn write_stdin(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdin = lock_state(&self.stdin);
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        pipe.write_all(bytes)?;
        pipe.flush()
    }

    /// Closes the child's stdin so it sees end of file.
    pub fn close_stdin(&self) {
        lock_state(&self.stdin).take();
    }

    /// Feeds `reader` into the child's stdin on a background thread until
    /// the reader reaches end of stream, then closes stdin.
    pub fn attach_input(&self, mut reader: InputReader) -> io::Result<JoinHandle<()>> {
        let label = self.label.clone();
        let stdin = Arc::clone(&self.stdin);
        thread::Builder::new()
            .name(format!("{label}-stdin"))
            .spawn(move || {
                let mut buf = [0u8; PUMP_BUFFER_SIZE];
                loop {
                    let n = match Read::read(&mut reader, &mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) => {
                            debug!(label = %label, error = %err, "stdin feed stopped");
                            break;
                        }
                    };
                    let mut slot = lock_state(&stdin);
                    let Some(pipe) = slot.as_mut() else {
                        break;
                    };
                    if let Err(err) = pipe.write_all(&buf[..n]).and_then(|()| pipe.flush()) {
                        warn!(label = %label, error = %err, "failed to feed isolated process stdin");
                        break;
                    }
                }
                lock_state(&stdin).take();
            })
    }

    /// Waits up to `timeout` for the child to exit.
    pub async fn wait_finished(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut finished = self.done.subscribe();
        let in_time = tokio::time::timeout(timeout, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if !in_time {
            return None;
        }
        self.exit_status()
    }

    /// Blocks until the child has exited and its output has been pumped.
    pub fn join(&self) -> Option<ExitStatus> {
        let waiter = lock_state(&self.waiter).take();
        if let Some(waiter) = waiter {
            if waiter.join().is_err() {
                warn!(label = %self.label, "isolated process waiter panicked");
            }
        }
        let pumps: Vec<_> = lock_state(&self.pumps).drain(..).collect();
        for pump in pumps {
            if pump.join().is_err() {
                warn!(label = %self.label, "output pump panicked");
            }
        }
        self.exit_status()
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> Result<(), TerminationError> {
        let pgid = self.pid as libc::pid_t;
        // SAFETY: plain syscall on a pid we spawned; no memory is shared.
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(TerminationError::Signal {
            label: self.label.clone(),
            source: err,
        })
    }
}

impl Terminable for IsolatedProcess {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn request_interrupt(&self) -> Result<(), TerminationError> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGINT)
        }
        #[cfg(not(unix))]
        {
            Ok(())
        }
    }

    fn force_stop(&self, _signal: TerminationSignal) -> Result<StopDelivery, TerminationError> {
        if self.is_finished() {
            return Err(TerminationError::AlreadyFinished(self.label.clone()));
        }
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL)?;
        match lock_state(&self.child).kill() {
            Ok(()) => {}
            // Already reaped by the waiter.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(TerminationError::Signal {
                    label: self.label.clone(),
                    source: err,
                });
            }
        }
        Ok(StopDelivery::Immediate)
    }

    fn finished(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }
}

impl Drop for IsolatedProcess {
    fn drop(&mut self) {
        if !self.is_finished() {
            let _ = self.force_stop(TerminationSignal);
        }
    }
}

impl fmt::Debug for IsolatedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedProcess")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("status", &self.exit_status())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn isolate(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: `getpid` is read before forking.
    let parent_pid = unsafe { libc::getpid() };
    // SAFETY: the hook only makes async-signal-safe calls.
    unsafe {
        command.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            crate::process_death::set_parent_death(parent_pid)
        });
    }
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

fn spawn_pump<R>(name: String, mut pipe: R, sink: Arc<dyn ByteSink>) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new().name(name.clone()).spawn(move || {
        let mut buf = [0u8; PUMP_BUFFER_SIZE];
        // After a sink failure (quota, closed peer) keep draining so the
        // child never blocks on a full pipe.
        let mut forwarding = true;
        loop {
            let n = match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(pump = %name, error = %err, "failed to read isolated process output");
                    break;
                }
            };
            if !forwarding {
                continue;
            }
            if let Err(err) = sink.write_bytes(&buf[..n]) {
                warn!(pump = %name, error = %err, "dropping isolated process output");
                forwarding = false;
            }
        }
        if forwarding {
            if let Err(err) = sink.flush() {
                warn!(pump = %name, error = %err, "failed to flush isolated process output");
            }
        }
    })
}

fn wait_for_exit(
    label: &str,
    child: &Mutex<Child>,
    status: &Mutex<Option<ExitStatus>>,
    done: &watch::Sender<bool>,
) {
    loop {
        let polled = lock_state(child).try_wait();
        match polled {
            Ok(Some(exit)) => {
                debug!(label = %label, status = %exit, "isolated process exited");
                *lock_state(status) = Some(exit);
                break;
            }
            Ok(None) => thread::sleep(EXIT_POLL),
            Err(err) => {
                warn!(label = %label, error = %err, "failed to wait for isolated process");
                break;
            }
        }
    }
    done.send_replace(true);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::input::InputChannel;
    use crate::interrupt::InterruptHandle;
    use crate::sink::CaptureBuffer;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn spawn(script: &str) -> (IsolatedProcess, Arc<CaptureBuffer>, Arc<CaptureBuffer>) {
        let out = Arc::new(CaptureBuffer::new());
        let err = Arc::new(CaptureBuffer::new());
        let process = IsolatedProcess::spawn("test-child", sh(script), out.clone(), err.clone())
            .expect("spawn");
        (process, out, err)
    }

    #[test]
    fn pumps_both_streams() {
        let (process, out, err) = spawn("printf 'to out\\n'; printf 'to err\\n' >&2");
        let status = process.join().expect("status");
        assert!(status.success());
        assert_eq!(out.contents_lossy(), "to out\n");
        assert_eq!(err.contents_lossy(), "to err\n");
    }

    #[test]
    fn stdin_round_trips_until_closed() {
        let (process, out, _err) = spawn("cat");
        process.write_stdin(b"echoed\n").expect("write stdin");
        process.close_stdin();
        let status = process.join().expect("status");
        assert!(status.success());
        assert_eq!(out.contents_lossy(), "echoed\n");
        assert_eq!(
            process.write_stdin(b"late").map_err(|err| err.kind()),
            Err(io::ErrorKind::BrokenPipe)
        );
    }

    #[test]
    fn attached_input_is_fed_to_the_child() {
        let (process, out, _err) = spawn("cat");
        let (tx, rx) = InputChannel::new(InterruptHandle::new()).split();
        let feeder = process.attach_input(rx).expect("attach");
        tx.send_text("from the client\n").expect("send");
        tx.send_eof().expect("eof");
        feeder.join().expect("feeder");
        process.join().expect("status");
        assert_eq!(out.contents_lossy(), "from the client\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interrupt_stops_a_default_child() {
        let (process, _out, _err) = spawn("sleep 30");
        process.request_interrupt().expect("interrupt");
        let status = process
            .wait_finished(Duration::from_secs(5))
            .await
            .expect("exited");
        assert!(!status.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn force_stop_kills_a_child_ignoring_interrupts() {
        let (process, _out, _err) = spawn("trap '' INT; while :; do :; done");
        process.request_interrupt().expect("interrupt");
        assert_eq!(process.wait_finished(Duration::from_millis(100)).await, None);

        let delivery = process.force_stop(TerminationSignal).expect("kill");
        assert_eq!(delivery, StopDelivery::Immediate);
        let status = process
            .wait_finished(Duration::from_secs(5))
            .await
            .expect("exited");
        assert!(!status.success());
    }
}
