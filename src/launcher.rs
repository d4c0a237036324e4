//! Backend process launching: port allocation, command rendering, env
//! files and the merged stdout/stderr stream.

use crate::config::AdapterConfig;
use crate::error::AdapterError;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Ask the OS for a free port by binding port 0 and releasing it.
///
/// Another process may grab the port before the backend binds it.
pub fn find_available_port() -> Result<u16, AdapterError> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").map_err(AdapterError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(AdapterError::PortAllocation)?
        .port();
    drop(listener);
    Ok(port)
}

/// Fill the two `%s` slots of `template` with the port, then the host
pub fn render_command(template: &str, port: u16, host: &str) -> String {
    let port = port.to_string();
    let mut out = String::with_capacity(template.len() + port.len() + host.len());
    let mut values = [port.as_str(), host].into_iter();
    let mut rest = template;

    while let Some(idx) = rest.find("%s") {
        out.push_str(&rest[..idx]);
        out.push_str(values.next().unwrap_or("%s"));
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    out
}

/// Parse `KEY=value` pairs from an env file body.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix and
/// matching surrounding quotes are stripped.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read the env file at `path`. A missing file yields no pairs.
pub fn read_env_file(path: &Path) -> std::io::Result<Vec<(String, String)>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_env(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Combined stdout/stderr of a backend, one line at a time.
///
/// Both streams write into one pipe, so lines arrive in the order the
/// backend wrote them.
pub struct OutputStream {
    reader: BufReader<pipe::Receiver>,
    buf: Vec<u8>,
}

impl OutputStream {
    fn new(receiver: pipe::Receiver) -> Self {
        Self {
            reader: BufReader::new(receiver),
            buf: Vec::new(),
        }
    }

    /// Next output line without its line ending. `None` once every write
    /// end of the pipe is closed. Invalid UTF-8 is replaced, not an error.
    pub async fn next_line(&mut self) -> Option<std::io::Result<String>> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf);
                Some(Ok(line.trim_end_matches(['\r', '\n']).to_string()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// A freshly spawned backend
pub struct Launched {
    pub child: Child,
    pub pid: u32,
    /// The command after substitution
    pub command: String,
    pub output: OutputStream,
}

/// Start the backend for `config` on `port`
pub fn launch(config: &AdapterConfig, port: u16) -> Result<Launched, AdapterError> {
    let command = render_command(&config.shell_command, port, &config.host);
    info!(host = %config.host, port, command = %command, "Starting backend");

    let mut cmd = Command::new(&config.shell);
    cmd.args(&config.shell_args);
    cmd.arg(&command);
    cmd.current_dir(&config.dir);

    // stderr shares stdout's pipe
    let (reader, writer) = std::io::pipe().map_err(AdapterError::ProcessStart)?;
    let stderr_writer = writer.try_clone().map_err(AdapterError::ProcessStart)?;
    cmd.stdin(Stdio::null());
    cmd.stdout(writer);
    cmd.stderr(stderr_writer);
    cmd.kill_on_drop(true);

    // The parent environment is inherited
    if let Some(ref name) = config.env_port_name {
        cmd.env(name, port.to_string());
    }

    match read_env_file(&config.env_file_path()) {
        Ok(pairs) => {
            for (key, value) in pairs {
                info!(host = %config.host, key = %key, "Added env var");
                cmd.env(key, value);
            }
        }
        Err(e) => {
            warn!(host = %config.host, error = %e, "Couldn't read env file");
        }
    }

    // Own session so a stop can kill everything the shell started
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(AdapterError::ProcessStart)?;
    let pid = child.id().unwrap_or(0);

    // The command still holds our copies of the write ends; EOF only
    // arrives once they are closed
    drop(cmd);

    let receiver =
        pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(AdapterError::ProcessStart)?;

    info!(host = %config.host, port, pid, "Backend process spawned");

    Ok(Launched {
        child,
        pid,
        command,
        output: OutputStream::new(receiver),
    })
}

/// Kill the backend's whole process group
#[cfg(unix)]
pub fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
