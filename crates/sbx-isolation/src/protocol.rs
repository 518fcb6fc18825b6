//! Guest control protocol for the microVM driver.
//!
//! Length-prefixed JSON frames over a per-VM Unix socket. The host side
//! drives the conversation; the in-guest agent answers one response per
//! request, except `OpenStream`, after which the socket degrades into a
//! raw byte pipe attached to a guest terminal.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sbx_core::error::{Error, Result};

/// Maximum frame size for guest IPC (1 MiB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Request from the host to the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuestRequest {
    /// One-time VM configuration, sent right after boot.
    Configure {
        vcpus: u8,
        mem_mib: u32,
        workspace_guest_path: String,
    },
    /// Run a command to completion inside the guest.
    Exec {
        argv: Vec<String>,
        #[serde(default)]
        stdin: Option<Vec<u8>>,
        timeout_ms: u64,
    },
    /// Attach an interactive terminal; the socket becomes a byte pipe.
    OpenStream,
    /// Expose a host directory inside the guest.
    Mount {
        host_path: String,
        guest_path: String,
        read_only: bool,
    },
    /// Freeze guest vCPUs.
    Pause,
    /// Thaw guest vCPUs.
    Resume,
    /// Orderly guest shutdown.
    Shutdown,
    /// Health check.
    Ping,
}

/// Response from the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuestResponse {
    Ok,
    Exec {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// The guest killed the child at the exec deadline.
    TimedOut,
    Error {
        message: String,
    },
    Pong,
}

/// Read a length-prefixed JSON frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::transient(format!("read frame length: {}", e)))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(Error::fatal(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::transient(format!("read frame body: {}", e)))?;
    Ok(buf)
}

/// Write a length-prefixed JSON frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| Error::transient(format!("write frame length: {}", e)))?;
    writer
        .write_all(data)
        .await
        .map_err(|e| Error::transient(format!("write frame body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::transient(format!("flush frame: {}", e)))?;
    Ok(())
}

pub async fn send_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &GuestRequest,
) -> Result<()> {
    let data = serde_json::to_vec(req)?;
    write_frame(writer, &data).await
}

pub async fn recv_response<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<GuestResponse> {
    let data = read_frame(reader).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello guest";
        let mut buf = Vec::new();
        write_frame(&mut buf, data).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();
        assert_eq!(read_back, data);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(2 * 1024 * 1024u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn test_exec_request_roundtrip() {
        let req = GuestRequest::Exec {
            argv: vec!["echo".to_string(), "hello".to_string()],
            stdin: Some(b"input".to_vec()),
            timeout_ms: 5000,
        };
        let mut buf = Vec::new();
        send_request(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let data = read_frame(&mut cursor).await.unwrap();
        let parsed: GuestRequest = serde_json::from_slice(&data).unwrap();
        match parsed {
            GuestRequest::Exec {
                argv,
                stdin,
                timeout_ms,
            } => {
                assert_eq!(argv, vec!["echo", "hello"]);
                assert_eq!(stdin.as_deref(), Some(&b"input"[..]));
                assert_eq!(timeout_ms, 5000);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_response_roundtrip() {
        let resp = GuestResponse::Exec {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        let json = serde_json::to_vec(&resp).unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &json).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = recv_response(&mut cursor).await.unwrap();
        match parsed {
            GuestResponse::Exec {
                stdout, exit_code, ..
            } => {
                assert_eq!(stdout, "hello\n");
                assert_eq!(exit_code, 0);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_all_request_variants_serialize() {
        let variants = vec![
            GuestRequest::Configure {
                vcpus: 2,
                mem_mib: 1024,
                workspace_guest_path: "/workspace".to_string(),
            },
            GuestRequest::Exec {
                argv: vec!["true".to_string()],
                stdin: None,
                timeout_ms: 1000,
            },
            GuestRequest::OpenStream,
            GuestRequest::Mount {
                host_path: "/data".to_string(),
                guest_path: "/mnt/data".to_string(),
                read_only: true,
            },
            GuestRequest::Pause,
            GuestRequest::Resume,
            GuestRequest::Shutdown,
            GuestRequest::Ping,
        ];
        for req in &variants {
            let json = serde_json::to_string(req).unwrap();
            let _: GuestRequest = serde_json::from_str(&json).unwrap();
        }
    }
}
