//! Payload sources.
//!
//! The patcher asks a [`PayloadSource`] for each target's bytes. A source
//! answers with the payload, with `Ok(None)` when it has nothing for that
//! name (the target is skipped), or with an error that aborts the run.

use crate::error::{Error, Result};

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Supplies encoded payloads by target name.
pub trait PayloadSource {
    fn fetch(&mut self, name: &str) -> Result<Option<Vec<u8>>>;
}

impl<F> PayloadSource for F
where
    F: FnMut(&str) -> Result<Option<Vec<u8>>>,
{
    fn fetch(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self(name)
    }
}

/// Encodes WAV files to raw SBC frames with `ffmpeg`.
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    /// ffmpeg binary (name on `PATH` or full path).
    pub ffmpeg: PathBuf,
    /// Directory holding the source audio, one file per target name.
    pub sounds_dir: PathBuf,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Kill ffmpeg if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl FfmpegEncoder {
    pub fn new<P: AsRef<Path>>(sounds_dir: P) -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            sounds_dir: sounds_dir.as_ref().to_path_buf(),
            sample_rate: 48_000,
            timeout: Some(Duration::from_secs(60)),
        }
    }

    /// 48 kHz mono, raw SBC to stdout.
    fn command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-y", "-v", "error", "-i"])
            .arg(input)
            .args(["-ar", &self.sample_rate.to_string()])
            .args(["-ac", "1", "-f", "sbc", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn encode(&self, name: &str, input: &Path) -> Result<Vec<u8>> {
        let fail = |message: String| Error::Encoder {
            name: name.to_string(),
            message,
        };

        let mut child = self.command(input).spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => fail(format!("binary not found: {}", self.ffmpeg.display())),
            _ => fail(e.to_string()),
        })?;

        // Drain both pipes while waiting, or a large payload fills the pipe
        // buffer and ffmpeg never exits.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                reap(&mut child);
                return Err(fail(format!(
                    "timed out after {:?}",
                    self.timeout.unwrap_or_default()
                )));
            }
            Err(e) => {
                reap(&mut child);
                return Err(e);
            }
        };

        let data = join(stdout)?;
        let err_text = String::from_utf8_lossy(&join(stderr)?).trim().to_string();

        if !status.success() {
            return Err(fail(if err_text.is_empty() {
                format!("exited with {status}")
            } else {
                err_text
            }));
        }
        if data.is_empty() {
            return Err(fail("ffmpeg returned empty data".into()));
        }

        tracing::debug!("{}: encoded {} bytes from {}", name, data.len(), input.display());
        Ok(data)
    }
}

impl PayloadSource for FfmpegEncoder {
    fn fetch(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let input = self.sounds_dir.join(name);
        if !input.is_file() {
            return Ok(None);
        }
        self.encode(name, &input).map(Some)
    }
}

/// Reads already-encoded payloads verbatim from a directory.
#[derive(Clone, Debug)]
pub struct RawFileSource {
    pub dir: PathBuf,
}

impl RawFileSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl PayloadSource for RawFileSource {
    fn fetch(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    pipe.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn join(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match handle {
        Some(h) => h
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("pipe reader panicked")))?
            .map_err(Error::Io),
        None => Ok(Vec::new()),
    }
}

/// Kill the child and wait for it so it does not outlive the run.
fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("kill failed: {}", e);
    }
    let _ = child.wait();
}

/// Poll the child until it exits or `timeout` elapses (`Ok(None)`).
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_source() {
        let mut src = |name: &str| -> Result<Option<Vec<u8>>> {
            Ok((name == "ID_00.wav").then(|| vec![0x9C, 1, 2]))
        };
        assert_eq!(src.fetch("ID_00.wav").unwrap(), Some(vec![0x9C, 1, 2]));
        assert_eq!(src.fetch("ID_01.wav").unwrap(), None);
    }

    #[test]
    fn test_raw_file_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ID_00.wav"), [0x9C, 0xAA]).unwrap();

        let mut src = RawFileSource::new(dir.path());
        assert_eq!(src.fetch("ID_00.wav").unwrap(), Some(vec![0x9C, 0xAA]));
        assert_eq!(src.fetch("ID_01.wav").unwrap(), None);
    }

    #[test]
    fn test_ffmpeg_missing_input_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = FfmpegEncoder::new(dir.path());
        enc.ffmpeg = PathBuf::from("/nonexistent/ffmpeg");
        assert_eq!(enc.fetch("ID_00.wav").unwrap(), None);
    }

    #[test]
    fn test_ffmpeg_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ID_00.wav"), b"RIFF").unwrap();

        let mut enc = FfmpegEncoder::new(dir.path());
        enc.ffmpeg = PathBuf::from("/nonexistent/ffmpeg");
        let err = enc.fetch("ID_00.wav").unwrap_err();
        assert!(matches!(err, Error::Encoder { ref message, .. } if message.contains("binary not found")));
    }

    /// Install `body` as a stand-in ffmpeg and return an encoder using it.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> FfmpegEncoder {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("ffmpeg.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.join("ID_00.wav"), b"RIFF").unwrap();

        let mut enc = FfmpegEncoder::new(dir);
        enc.ffmpeg = script;
        enc
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = fake_ffmpeg(dir.path(), "exec sleep 10");
        enc.timeout = Some(Duration::from_millis(300));

        let start = Instant::now();
        let err = enc.fetch("ID_00.wav").unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, Error::Encoder { ref message, .. } if message.contains("timed out")));
        assert_eq!(err.exit_code(), 12);
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = fake_ffmpeg(dir.path(), "echo 'bad input' >&2\nexit 3");

        let err = enc.fetch("ID_00.wav").unwrap_err();
        assert!(matches!(err, Error::Encoder { ref name, ref message } if name == "ID_00.wav" && message == "bad input"));
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = fake_ffmpeg(dir.path(), "exit 0");

        let err = enc.fetch("ID_00.wav").unwrap_err();
        assert!(matches!(err, Error::Encoder { ref message, .. } if message.contains("empty data")));
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_large_output_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        // More than a pipe buffer on stdout, plus some stderr noise.
        let mut enc = fake_ffmpeg(
            dir.path(),
            "echo 'warning' >&2\nhead -c 200000 /dev/zero | tr '\\000' '\\234'",
        );

        let data = enc.fetch("ID_00.wav").unwrap().unwrap();
        assert_eq!(data.len(), 200_000);
        assert!(data.iter().all(|&b| b == 0x9C));
    }

    #[test]
    fn test_command_line() {
        let enc = FfmpegEncoder::new("sounds_src");
        let cmd = enc.command(Path::new("sounds_src/ID_00.wav"));
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            ["-y", "-v", "error", "-i", "sounds_src/ID_00.wav", "-ar", "48000", "-ac", "1", "-f", "sbc", "-"]
        );
    }
}
