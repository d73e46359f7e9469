//! Running the external encoder: either fed through its stdin, or pointed at
//! a staged temp file once the WAV is complete.

use std::{
    io::{self, BufWriter, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
};

use anyhow::Context;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    config::ConverterConfig,
    error::{ConvertError, Result},
    types::InvocationMethod,
};

/// Environment variable carrying the staged WAV path to TempFile encoders.
pub const INPUT_ENV: &str = "TRACK_CONVERTER_INPUT";

/// Expands an encoder command template.
///
/// `%s` becomes the output path, `%i` the staged input path (TempFile only,
/// left untouched otherwise) and `%%` a literal percent sign.
pub fn expand_command(template: &str, output: &Path, input: Option<&Path>) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('s') => {
                chars.next();
                out.push_str(&output.to_string_lossy());
            }
            Some('i') if input.is_some() => {
                chars.next();
                if let Some(p) = input {
                    out.push_str(&p.to_string_lossy());
                }
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => out.push('%'),
        }
    }
    out
}

fn shell_command(config: &ConverterConfig, command: &str) -> Command {
    let mut cmd = Command::new(&config.shell);
    cmd.arg(&config.shell_arg).arg(command);
    cmd
}

/// Where converted WAV bytes go.
pub enum EncoderSink {
    Pipe(PipeSink),
    TempFile(TempFileSink),
}

impl EncoderSink {
    /// Pipe: spawns the encoder now. TempFile: creates the staging file; the
    /// encoder runs in [`EncoderSink::finish`].
    pub fn open(
        method: InvocationMethod,
        template: &str,
        output: &Path,
        config: &ConverterConfig,
    ) -> Result<Self> {
        match method {
            InvocationMethod::Pipe => {
                let command = expand_command(template, output, None);
                PipeSink::spawn(command, config).map(EncoderSink::Pipe)
            }
            InvocationMethod::TempFile => {
                TempFileSink::create(template, output, config).map(EncoderSink::TempFile)
            }
        }
    }

    /// Closes the stream and waits for the encoder to finish.
    pub fn finish(self) -> Result<()> {
        match self {
            EncoderSink::Pipe(p) => p.finish(),
            EncoderSink::TempFile(t) => t.finish(),
        }
    }
}

impl Write for EncoderSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EncoderSink::Pipe(p) => p.write(buf),
            EncoderSink::TempFile(t) => t.file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncoderSink::Pipe(p) => p.flush(),
            EncoderSink::TempFile(t) => t.file.flush(),
        }
    }
}

/// A running encoder reading from our end of its stdin. Dropping it closes
/// the pipe and reaps the process.
pub struct PipeSink {
    command: String,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl PipeSink {
    fn spawn(command: String, config: &ConverterConfig) -> Result<Self> {
        info!("executing: {}", command);
        let mut child = shell_command(config, &command)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| ConvertError::EncoderSpawn {
                command: command.clone(),
                source,
            })?;
        let stdin = child.stdin.take().map(BufWriter::new);
        Ok(Self {
            command,
            child,
            stdin,
        })
    }

    fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.flush()?;
        }
        let status = self.child.wait()?;
        debug!("encoder `{}` exited with {}", self.command, status);
        if !status.success() {
            return Err(ConvertError::EncoderFailed {
                command: self.command.clone(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl Write for PipeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder stdin closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PipeSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.wait();
    }
}

/// WAV staged on disk for an encoder that wants a file. The temp file is
/// removed when the sink is dropped, whether or not the encoder ran.
pub struct TempFileSink {
    template: String,
    output: std::path::PathBuf,
    shell: String,
    shell_arg: String,
    file: BufWriter<NamedTempFile>,
}

impl TempFileSink {
    fn create(template: &str, output: &Path, config: &ConverterConfig) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix("track-converter-")
            .suffix(".wav")
            .tempfile_in(&config.temp_dir)
            .with_context(|| format!("failed to open temp file in {:?}", config.temp_dir))?;
        debug!("staging WAV in {}", tmp.path().display());
        Ok(Self {
            template: template.to_string(),
            output: output.to_path_buf(),
            shell: config.shell.clone(),
            shell_arg: config.shell_arg.clone(),
            file: BufWriter::new(tmp),
        })
    }

    fn finish(self) -> Result<()> {
        let tmp = self
            .file
            .into_inner()
            .map_err(|e| ConvertError::from(e.into_error()))?;
        let command = expand_command(&self.template, &self.output, Some(tmp.path()));
        info!("executing: {}", command);

        let status = Command::new(&self.shell)
            .arg(&self.shell_arg)
            .arg(&command)
            .env(INPUT_ENV, tmp.path())
            .stdin(Stdio::null())
            .status()
            .map_err(|source| ConvertError::EncoderSpawn {
                command: command.clone(),
                source,
            })?;
        debug!("encoder `{}` exited with {}", command, status);
        if !status.success() {
            return Err(ConvertError::EncoderFailed {
                command,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}
