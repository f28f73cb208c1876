// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Out-of-process model server
//!
//! The ML runtime that owns the checkpoint runs as a child process. It is
//! started as `<program> <args...> <checkpoint>` and speaks line-delimited
//! JSON over stdio:
//!
//! ```text
//! <- {"status":"ready"}
//! -> {"op":"predict","shape":[n,h,w,c],"data":"<base64 f32 LE>"}
//! <- {"probabilities":[[...], ...]}
//! -> {"op":"saliency","layer_idx":89,"filter_index":2,"width":224,"height":224,"data":"..."}
//! <- {"map":"<base64 f32 LE, height*width values>"}
//! <- {"error":"..."}                       (any request may fail)
//! ```

use crate::checkpoint::ModelLoader;
use crate::gallery::SaliencyMap;
use crate::inference::{Batch, Classifier};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};

/// Encode floats as base64 of their little-endian bytes
pub fn encode_f32(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    BASE64.encode(bytes)
}

/// Inverse of [`encode_f32`]
pub fn decode_f32(encoded: &str) -> Result<Vec<f32>> {
    let bytes = BASE64.decode(encoded).context("invalid base64 tensor")?;
    if bytes.len() % 4 != 0 {
        bail!("tensor byte length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Predict {
        shape: [usize; 4],
        data: String,
    },
    Saliency {
        layer_idx: usize,
        filter_index: usize,
        width: u32,
        height: u32,
        data: &'a str,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Response {
    status: Option<String>,
    probabilities: Option<Vec<Vec<f32>>>,
    map: Option<String>,
    error: Option<String>,
}

impl Response {
    fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(anyhow!("model server error: {}", err)),
            None => Ok(self),
        }
    }
}

struct ServerIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ServerIo {
    fn read_response(&mut self) -> Result<Response> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line)?;
        if n == 0 {
            bail!("model server closed its output");
        }
        serde_json::from_str::<Response>(line.trim())
            .with_context(|| format!("malformed model server response: {}", line.trim()))?
            .into_result()
    }

    fn call(&mut self, request: &Request<'_>) -> Result<Response> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;
        self.read_response()
    }

    /// Wait for the `ready` line the server sends after loading
    fn handshake(&mut self) -> Result<()> {
        let hello = self.read_response()?;
        if hello.status.as_deref() != Some("ready") {
            bail!("model server did not report ready");
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A checkpoint served by a child process
pub struct ServedModel {
    checkpoint: PathBuf,
    io: Mutex<ServerIo>,
}

impl ServedModel {
    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    fn call(&self, request: &Request<'_>) -> Result<Response> {
        let mut io = self
            .io
            .lock()
            .map_err(|_| anyhow!("model server connection poisoned"))?;
        io.call(request)
    }
}

impl Classifier for ServedModel {
    fn predict(&self, batch: &Batch) -> Result<Vec<Vec<f32>>> {
        let request = Request::Predict {
            shape: batch.shape,
            data: encode_f32(&batch.data),
        };
        self.call(&request)?
            .probabilities
            .context("model server response lacks probabilities")
    }

    fn class_activation_map(
        &self,
        layer_idx: usize,
        filter_index: usize,
        seed_input: &[f32],
        width: u32,
        height: u32,
    ) -> Result<SaliencyMap> {
        let data = encode_f32(seed_input);
        let request = Request::Saliency {
            layer_idx,
            filter_index,
            width,
            height,
            data: &data,
        };
        let encoded = self
            .call(&request)?
            .map
            .context("model server response lacks a saliency map")?;
        Ok(SaliencyMap {
            width,
            height,
            values: decode_f32(&encoded)?,
        })
    }
}

impl Drop for ServedModel {
    fn drop(&mut self) {
        if let Ok(io) = self.io.get_mut() {
            io.shutdown();
        }
    }
}

/// Starts one model server process per loaded checkpoint
#[derive(Debug, Clone)]
pub struct ModelServerLoader {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ModelServerLoader {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawn the server for `checkpoint` and wait for its ready line
    pub fn spawn(&self, checkpoint: &Path) -> Result<ServedModel> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(checkpoint)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start model server {}", self.program.display()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("model server stdio unavailable");
        };
        let mut io = ServerIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        // the child is reaped on every failed start
        if let Err(e) = io.handshake() {
            io.shutdown();
            return Err(e.context(format!("Model server failed to start for {}", checkpoint.display())));
        }
        tracing::debug!("Model server ready for {}", checkpoint.display());

        Ok(ServedModel {
            checkpoint: checkpoint.to_path_buf(),
            io: Mutex::new(io),
        })
    }
}

impl ModelLoader for ModelServerLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Classifier>> {
        Ok(Arc::new(self.spawn(path)?))
    }
}
