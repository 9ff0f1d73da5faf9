use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::sandbox::sanitize::truncate_utf8;

/// Captured result of one supervised process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Signal that terminated the process, if any
    pub signal: Option<i32>,
    /// The deadline fired and the process group was killed
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Spawn `cmd`, capture stdout/stderr (each kept up to `capture_cap` bytes)
/// and wait at most `deadline`.
///
/// The child gets its own process group so a timeout kills everything it
/// spawned. Output past the cap is drained and discarded so the child never
/// blocks on a full pipe.
pub async fn run_captured(
    mut cmd: Command,
    deadline: Duration,
    capture_cap: usize,
) -> io::Result<ProcessOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    // Taken now: once the leader is reaped `child.id()` returns None, while
    // grandchildren may still hold the pipes open.
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (out, err, status) = tokio::join!(
            read_capped(stdout, capture_cap),
            read_capped(stderr, capture_cap),
            child.wait()
        );
        Ok::<_, io::Error>((out?, err?, status?))
    };
    let waited = tokio::time::timeout(deadline, collect).await;
    let elapsed = start.elapsed();

    match waited {
        Ok(collected) => {
            let (out, err, status) = collected?;
            let (exit_code, signal) = decode_status(status);
            debug!(
                exit_code = exit_code,
                stdout_len = out.len(),
                stderr_len = err.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Process completed"
            );
            Ok(ProcessOutput {
                stdout: lossy_capped(&out, capture_cap),
                stderr: lossy_capped(&err, capture_cap),
                exit_code,
                signal,
                timed_out: false,
                elapsed,
            })
        }
        Err(_) => {
            debug!(
                deadline_ms = deadline.as_millis() as u64,
                "Process exceeded deadline, killing process group"
            );
            kill_tree(&mut child, pid).await;
            Ok(ProcessOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: crate::sandbox::result::TIMEOUT_EXIT_CODE,
                signal: None,
                timed_out: true,
                elapsed: start.elapsed(),
            })
        }
    }
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };

    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(kept)
}

fn lossy_capped(bytes: &[u8], cap: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    truncate_utf8(&mut text, cap);
    text
}

/// Map an exit status to `(code, signal)`; signal deaths report 128+N.
fn decode_status(status: ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (status.code().unwrap_or(1), None)
}

#[cfg_attr(not(unix), allow(unused_variables))]
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid = pid, error = %e, "killpg failed");
        }
    }

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill child");
    }
}
