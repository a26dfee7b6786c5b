//! Shared test infrastructure for integration tests.

use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

/// Isolated home/config dirs so no per-user config or credential leaks in.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create sandbox"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_config(&self, config: &Value) -> PathBuf {
        let path = self.path().join("config.json");
        std::fs::write(&path, config.to_string()).expect("write config");
        path
    }

    /// Run the binary with `args`, HOME and XDG dirs pointed into the sandbox.
    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_mcm-cascade"))
            .args(args)
            .env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path().join("config"))
            .env_remove("RUST_LOG")
            .env_remove("PDMV_COOKIE_PATH")
            .output()
            .expect("run mcm-cascade")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Serve one JSON body per connection, in order, recording request lines.
pub fn serve_json(bodies: Vec<Value>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind local server");
    let addr = listener.local_addr().expect("local addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    thread::spawn(move || {
        for body in bodies {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
            let mut request_line = String::new();
            let mut content_length = 0usize;
            let mut first = true;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
                if first {
                    request_line = line.trim_end().to_string();
                    first = false;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut payload = vec![0u8; content_length];
            reader.read_exact(&mut payload).expect("read request body");
            recorder.lock().expect("lock recorder").push(request_line);

            let text = body.to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{text}",
                text.len()
            );
            let mut stream = stream;
            stream.write_all(response.as_bytes()).expect("write response");
        }
    });
    (format!("http://{addr}/mcm/"), seen)
}

/// Anonymous client config against a local server.
pub fn local_config(server: &str) -> Value {
    serde_json::json!({
        "server_url": server,
        "auth": "none",
        "max_attempts": 1,
        "timeout_secs": 5,
    })
}
