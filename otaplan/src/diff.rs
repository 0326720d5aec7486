// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! File-level binary diffs computed by external programs on a bounded pool of
//! workers.

use std::{
    cmp::Reverse,
    fmt, fs,
    io::{self, Read, Write},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
    vec,
};

use rayon::ThreadPoolBuilder;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{config::Config, format::transfer::PatchKind};

/// How often a running diff process is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to write {0} to temporary file")]
    WriteTemp(&'static str, #[source] io::Error),
    #[error("Failed to run {0:?}")]
    Spawn(Vec<String>, #[source] io::Error),
    #[error("Failed to wait for {0:?}")]
    Wait(Vec<String>, #[source] io::Error),
    #[error("{program:?} timed out after {timeout:?}")]
    Timeout {
        program: Vec<String>,
        timeout: Duration,
    },
    #[error("{program:?} failed with {status}:\n{stderr}")]
    Failed {
        program: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Failed to read patch")]
    ReadPatch(#[source] io::Error),
    #[error("Failed to create diff worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

type Result<T> = std::result::Result<T, Error>;

/// A named blob taking part in a diff.
#[derive(Clone, PartialEq, Eq)]
pub struct DiffFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl DiffFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn write_to_temp(&self, kind: &'static str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new().map_err(|e| Error::WriteTemp(kind, e))?;
        file.write_all(&self.data)
            .and_then(|()| file.flush())
            .map_err(|e| Error::WriteTemp(kind, e))?;
        Ok(file)
    }
}

impl fmt::Debug for DiffFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffFile")
            .field("name", &self.name)
            .field("size", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffProgram {
    Bsdiff,
    Imgdiff,
    /// imgdiff in zip mode for archives.
    ImgdiffZip,
}

impl DiffProgram {
    /// Pick the program based on the target file's extension.
    pub fn for_name(name: &str, disable_imgdiff: bool) -> Self {
        if disable_imgdiff {
            return Self::Bsdiff;
        }

        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext {
            "gz" | "img" => Self::Imgdiff,
            "zip" | "jar" | "apk" => Self::ImgdiffZip,
            _ => Self::Bsdiff,
        }
    }

    pub fn patch_kind(self) -> PatchKind {
        match self {
            Self::Bsdiff => PatchKind::Bsdiff,
            Self::Imgdiff | Self::ImgdiffZip => PatchKind::Imgdiff,
        }
    }

    fn command(self, config: &Config) -> Vec<String> {
        match self {
            Self::Bsdiff => config.bsdiff_program.clone(),
            Self::Imgdiff => config.imgdiff_program.clone(),
            Self::ImgdiffZip => {
                let mut cmd = config.imgdiff_program.clone();
                cmd.push("-z".to_owned());
                cmd
            }
        }
    }
}

/// Put the child in its own process group so that a timeout reaches every
/// process the diff program starts.
#[cfg(unix)]
fn isolate(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: rustix::process::Signal) -> io::Result<()> {
    use rustix::process::{Pid, kill_process_group};

    match i32::try_from(child.id()).ok().and_then(Pid::from_raw) {
        Some(pid) => kill_process_group(pid, signal).map_err(io::Error::from),
        None => child.kill(),
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    signal_group(child, rustix::process::Signal::TERM)
}

#[cfg(unix)]
fn kill(child: &mut Child) -> io::Result<()> {
    signal_group(child, rustix::process::Signal::KILL)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

#[cfg(not(unix))]
fn kill(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// Poll `child` until it exits or `timeout` elapses.
fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        } else if start.elapsed() >= timeout {
            return Ok(None);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// A target/source pair awaiting a patch.
#[derive(Debug)]
pub struct Difference {
    pub target: DiffFile,
    pub source: DiffFile,
    pub program: DiffProgram,
    /// Patch data, if it was computed successfully.
    pub patch: Option<Vec<u8>>,
}

impl Difference {
    pub fn new(target: DiffFile, source: DiffFile, disable_imgdiff: bool) -> Self {
        let program = DiffProgram::for_name(&target.name, disable_imgdiff);

        Self {
            target,
            source,
            program,
            patch: None,
        }
    }

    /// Name for log messages.
    pub fn name(&self) -> String {
        if self.source.name == self.target.name {
            self.target.name.clone()
        } else {
            format!("{} ({})", self.target.name, self.source.name)
        }
    }

    /// Run the diff program and return the patch. The program is invoked as
    /// `<program> <source> <target> <patch>`. If it runs for longer than the
    /// configured timeout, it is asked to terminate, then killed if it is still
    /// alive after the grace period.
    pub fn compute_patch(&self, config: &Config) -> Result<Vec<u8>> {
        let target_temp = self.target.write_to_temp("target")?;
        let source_temp = self.source.write_to_temp("source")?;
        let patch_temp = NamedTempFile::new().map_err(|e| Error::WriteTemp("patch", e))?;

        let program = self.program.command(config);
        let (name, args) = program
            .split_first()
            .ok_or_else(|| Error::Spawn(program.clone(), io::ErrorKind::InvalidInput.into()))?;

        let mut command = Command::new(name);
        command
            .args(args)
            .arg(source_temp.path())
            .arg(target_temp.path())
            .arg(patch_temp.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        isolate(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(program.clone(), e))?;

        // Drain stderr on a separate thread so the child never blocks on a
        // full pipe.
        let stderr_thread = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let wait_err = |e: io::Error| Error::Wait(program.clone(), e);

        if wait_timeout(&mut child, config.diff_timeout())
            .map_err(wait_err)?
            .is_none()
        {
            warn!("diff command timed out: {program:?}");

            if let Err(e) = terminate(&mut child) {
                warn!("Failed to terminate {program:?}: {e}");
            }

            wait_timeout(&mut child, config.terminate_grace()).map_err(wait_err)?;

            // Processes that ignored the request may outlive the direct child.
            if let Err(e) = kill(&mut child)
                && child.try_wait().map_err(wait_err)?.is_none()
            {
                warn!("Failed to kill {program:?}: {e}");
            }

            child.wait().map_err(wait_err)?;

            // The stderr reader is left detached. A process that escaped the
            // group may still hold the pipe open.
            return Err(Error::Timeout {
                program,
                timeout: config.diff_timeout(),
            });
        }

        let status = child.wait().map_err(wait_err)?;
        let stderr = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(Error::Failed {
                program,
                status,
                stderr,
            });
        }

        fs::read(patch_temp.path()).map_err(Error::ReadPatch)
    }
}

/// Shared queue of indices into the list of differences, ordered largest
/// target first. The lock is only held while dequeuing.
pub struct DiffQueue {
    order: Mutex<vec::IntoIter<usize>>,
}

impl DiffQueue {
    pub fn new(diffs: &[Difference]) -> Self {
        let mut order = (0..diffs.len()).collect::<Vec<_>>();
        // Stable, so equally sized targets keep their input order.
        order.sort_by_key(|&i| Reverse(diffs[i].target.size()));

        Self {
            order: Mutex::new(order.into_iter()),
        }
    }

    pub fn next(&self) -> Option<usize> {
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.next()
    }
}

fn log_result(diff: &Difference, patch: &Result<Vec<u8>>, duration: Duration) {
    let name = diff.name();

    match patch {
        Ok(patch) => {
            let target_size = diff.target.size();
            let percent = if target_size == 0 {
                0.0
            } else {
                100.0 * patch.len() as f64 / target_size as f64
            };

            info!(
                "{:8.2} sec {:8} / {:8} bytes ({percent:6.2}%) {name}",
                duration.as_secs_f64(),
                patch.len(),
                target_size,
            );
        }
        Err(e) => {
            error!("Patching failed: {name}: {e}");
        }
    }
}

/// Compute the patch for every difference using `config.worker_threads`
/// workers. Differences whose program fails or times out are left without a
/// patch. This only returns once every difference has been processed.
pub fn compute_differences(diffs: &mut [Difference], config: &Config) -> Result<()> {
    info!("{} diffs to compute", diffs.len());

    if diffs.is_empty() {
        return Ok(());
    }

    let num_workers = config.worker_threads.clamp(1, diffs.len());
    let pool = ThreadPoolBuilder::new().num_threads(num_workers).build()?;

    let queue = DiffQueue::new(diffs);
    let results = Mutex::new(Vec::with_capacity(diffs.len()));

    {
        let diffs = &*diffs;
        let queue = &queue;
        let results = &results;

        pool.scope(|s| {
            for _ in 0..num_workers {
                s.spawn(move |_| {
                    while let Some(index) = queue.next() {
                        let diff = &diffs[index];
                        let start = Instant::now();
                        let patch = diff.compute_patch(config);

                        log_result(diff, &patch, start.elapsed());

                        results
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push((index, patch.ok()));
                    }
                });
            }
        });
    }

    for (index, patch) in results.into_inner().unwrap_or_else(|e| e.into_inner()) {
        diffs[index].patch = patch;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(name: &str, size: usize) -> Difference {
        Difference::new(
            DiffFile::new(name, vec![0u8; size]),
            DiffFile::new(name, vec![]),
            false,
        )
    }

    #[test]
    fn program_selection() {
        assert_eq!(DiffProgram::for_name("boot.img", false), DiffProgram::Imgdiff);
        assert_eq!(DiffProgram::for_name("a/b.apk", false), DiffProgram::ImgdiffZip);
        assert_eq!(DiffProgram::for_name("x.gz", false), DiffProgram::Imgdiff);
        assert_eq!(DiffProgram::for_name("libfoo.so", false), DiffProgram::Bsdiff);
        assert_eq!(DiffProgram::for_name("__NONZERO", false), DiffProgram::Bsdiff);
        assert_eq!(DiffProgram::for_name("boot.img", true), DiffProgram::Bsdiff);

        let config = Config::default();
        assert_eq!(
            DiffProgram::ImgdiffZip.command(&config),
            ["imgdiff", "-z"]
        );
        assert_eq!(DiffProgram::ImgdiffZip.patch_kind(), PatchKind::Imgdiff);
    }

    #[test]
    fn queue_is_largest_first() {
        let diffs = [diff("a", 10), diff("b", 1), diff("c", 5), diff("d", 5)];
        let queue = DiffQueue::new(&diffs);

        let order = std::iter::from_fn(|| queue.next()).collect::<Vec<_>>();
        assert_eq!(order, [0, 2, 3, 1]);
    }

    #[test]
    fn names() {
        let d = Difference::new(
            DiffFile::new("new.apk", vec![]),
            DiffFile::new("old.apk", vec![]),
            false,
        );
        assert_eq!(d.name(), "new.apk (old.apk)");
        assert_eq!(diff("same", 0).name(), "same");
    }
}
