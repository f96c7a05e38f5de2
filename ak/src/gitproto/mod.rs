//! Git smart-HTTP transport for the base repository
//!
//! Frames follow the pkt-line format: each frame carries a four-hex-digit
//! length that includes the four length bytes themselves; a literal `0000`
//! is a flush marker. The endpoints bridge to the local git binary in
//! stateless-RPC mode, so the runtime can expose clone/fetch/push of the
//! workspace without reimplementing pack negotiation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;
use tracing::{debug, warn};

/// The `0000` flush marker
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Services the transport knows how to bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    /// fetch/clone
    UploadPack,
    /// push
    ReceivePack,
}

impl GitService {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand handed to the git binary
    fn subcommand(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Content type for ref advertisement responses
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type for command results
    pub fn result_content_type(&self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktFrame {
    /// A data frame
    Data(Bytes),
    /// The `0000` flush marker
    Flush,
}

/// Append a pkt-line frame carrying `data`
pub fn write_pkt_line(out: &mut BytesMut, data: &[u8]) {
    let length = data.len() + 4;
    out.put(format!("{length:04x}").as_bytes());
    out.put(data);
}

/// Append a flush marker
pub fn write_flush(out: &mut BytesMut) {
    out.put(&FLUSH_PKT[..]);
}

/// Read one frame from the front of `bytes`
///
/// Returns `None` when the buffer holds no complete frame (or is
/// malformed); the buffer is only advanced on a successful read.
pub fn read_pkt_line(bytes: &mut Bytes) -> Option<PktFrame> {
    if bytes.len() < 4 {
        return None;
    }

    let length_hex = &bytes[..4];
    let length_str = core::str::from_utf8(length_hex).ok()?;
    let length = usize::from_str_radix(length_str, 16).ok()?;

    if length == 0 {
        bytes.advance(4);
        return Some(PktFrame::Flush);
    }

    if length < 4 {
        warn!(length, "Invalid pkt-line length (must be >= 4)");
        return None;
    }

    if bytes.len() < length {
        return None;
    }

    bytes.advance(4);
    let data = bytes.copy_to_bytes(length - 4);
    Some(PktFrame::Data(data))
}

/// Build the ref-advertisement body for a smart-HTTP `info/refs` response
///
/// The HTTP flavour leads with a `# service=...` banner and a flush before
/// the ref listing.
pub fn advertisement_body(service: GitService, refs_payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    write_pkt_line(&mut body, format!("# service={}\n", service.name()).as_bytes());
    write_flush(&mut body);
    body.put(refs_payload);
    body
}

/// Error types for the git bridge
#[derive(Debug, thiserror::Error)]
pub enum GitProtoError {
    #[error("Unknown git service: {0}")]
    UnknownService(String),

    #[error("git exited with code {code}: {stderr}")]
    GitFailed { code: i32, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `git <service> --stateless-rpc --advertise-refs` for `info/refs`
pub async fn advertise_refs(repo: &Path, service: GitService) -> Result<BytesMut, GitProtoError> {
    debug!(service = service.name(), repo = %repo.display(), "gitproto::advertise_refs: called");
    let output = tokio::process::Command::new("git")
        .args([service.subcommand(), "--stateless-rpc", "--advertise-refs", "."])
        .current_dir(repo)
        .output()
        .await?;

    if !output.status.success() {
        return Err(GitProtoError::GitFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(advertisement_body(service, &output.stdout))
}

/// Run one stateless-RPC exchange: the request body in, the result out
pub async fn serve_rpc(repo: &Path, service: GitService, request_body: Bytes) -> Result<Bytes, GitProtoError> {
    debug!(service = service.name(), bytes = request_body.len(), "gitproto::serve_rpc: called");

    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new("git")
        .args([service.subcommand(), "--stateless-rpc", "."])
        .current_dir(repo)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&request_body).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(GitProtoError::GitFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(Bytes::from(output.stdout))
}
