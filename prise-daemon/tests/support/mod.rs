// Shared helpers for the daemon integration tests. Compiled once per test
// binary that declares `mod support;`.
#![allow(dead_code)]

use std::{
    env,
    io::Read,
    os::unix::net::UnixStream,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use prise_protocol::{Codec, Message, Value};
use tempfile::TempDir;

pub fn cargo_dir() -> PathBuf {
    env::var_os("CARGO_BIN_PATH").map(PathBuf::from).or_else(|| {
        env::current_exe().ok().map(|mut path| {
            path.pop();
            if path.ends_with("deps") {
                path.pop();
            }
            path
        })
    }).unwrap_or_else(|| panic!("CARGO_BIN_PATH wasn't set, cannot find prised"))
}

pub fn prised_bin() -> PathBuf {
    cargo_dir().join("prised")
}

/// Owns a `prised daemon` subprocess and its socket dir; kills the process
/// and removes the dir when dropped.
pub struct DaemonProc {
    child: Child,
    _tmp_dir: TempDir,
    pub socket_path: PathBuf,
}

impl DaemonProc {
    pub fn spawn() -> Result<DaemonProc> {
        let tmp_dir = tempfile::Builder::new().prefix("prise-test").tempdir().context("creating tmp dir")?;
        let socket_path = tmp_dir.path().join("prise.socket");
        let config_path = tmp_dir.path().join("config.toml");
        std::fs::write(&config_path, format!("sock = \"{}\"\n", socket_path.display()))
            .context("writing test config")?;

        let child = Command::new(prised_bin())
            .arg("daemon")
            .arg("--config")
            .arg(&config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning prised")?;

        let daemon = DaemonProc { child, _tmp_dir: tmp_dir, socket_path };
        daemon.wait_for_socket()?;
        Ok(daemon)
    }

    fn wait_for_socket(&self) -> Result<()> {
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(20);
        while !self.socket_path.exists() {
            std::thread::sleep(step);
            waited += step;
            if waited > Duration::from_secs(5) {
                anyhow::bail!("daemon never created its socket");
            }
        }
        Ok(())
    }

    pub fn connect(&self) -> Result<RpcClient> {
        let stream = UnixStream::connect(&self.socket_path).context("connecting to daemon socket")?;
        Ok(RpcClient { stream, codec: Codec::new(), next_msgid: 0 })
    }
}

impl Drop for DaemonProc {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A minimal blocking RPC client over a `UnixStream`, used only by tests.
pub struct RpcClient {
    stream: UnixStream,
    codec: Codec,
    next_msgid: u32,
}

impl RpcClient {
    pub fn request(&mut self, method: &str, params: Value) -> Result<Message> {
        use std::io::Write;
        let msgid = self.next_msgid;
        self.next_msgid += 1;
        let msg = Message::request(msgid, method, params);
        let mut buf = Vec::new();
        prise_protocol::encode_to(msg, &mut buf)?;
        self.stream.write_all(&buf).context("writing request")?;
        self.read_one()
    }

    pub fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        use std::io::Write;
        let msg = Message::notification(method, params);
        let mut buf = Vec::new();
        prise_protocol::encode_to(msg, &mut buf)?;
        self.stream.write_all(&buf).context("writing notification")?;
        Ok(())
    }

    pub fn read_one(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.codec.next_message()? {
                return Ok(msg);
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).context("reading response")?;
            anyhow::ensure!(n > 0, "daemon closed the connection");
            self.codec.feed(&buf[..n]);
        }
    }
}
