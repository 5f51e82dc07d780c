use std::cmp::min;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::RudpError;
use crate::packet::MAX_DATA_LEN;

/// Abort a receive after this long without a single byte of progress.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-call receive buffer. A multiple of the segment size, and large enough
/// that a full out-of-order window can drain into it without truncation.
const RECV_CHUNK: usize = 16 * 1024;

/// Outcome of a completed file receive.
pub struct ReceivedFile {
    pub name: String,
    pub len: u64,
    pub digest: String,
}

/// Transfer framing: one byte of filename length, the filename, then the
/// file body prefixed with its u32 big-endian size.
pub async fn send_file(
    conn: &mut Connection,
    local_path: &Path,
    remote_name: &str,
) -> crate::Result<u64> {
    let name = remote_name.as_bytes();
    if name.is_empty() || name.len() > u8::MAX as usize {
        return Err(RudpError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "remote filename must be 1..=255 bytes",
        )));
    }

    let data = fs::read(local_path).await?;
    let size = u32::try_from(data.len()).map_err(|_| {
        RudpError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "file exceeds the u32 size prefix",
        ))
    })?;
    info!("sending {:?} as {:?} ({} bytes)", local_path, remote_name, size);

    conn.send(&[name.len() as u8]).await?;
    conn.send(name).await?;
    conn.send(&size.to_be_bytes()).await?;

    for chunk in data.chunks(MAX_DATA_LEN) {
        conn.send(chunk).await?;
    }

    info!("file sent ({} bytes)", size);
    Ok(size as u64)
}

/// Receive one file per the transfer framing, write it under the transmitted
/// name, and report its digest.
pub async fn recv_file(conn: &mut Connection) -> crate::Result<ReceivedFile> {
    let mut name_len = [0u8; 1];
    recv_exact(conn, &mut name_len).await?;

    let mut name_buf = vec![0u8; name_len[0] as usize];
    recv_exact(conn, &mut name_buf).await?;
    let name = String::from_utf8_lossy(&name_buf).into_owned();

    let mut size_buf = [0u8; 4];
    recv_exact(conn, &mut size_buf).await?;
    let size = u32::from_be_bytes(size_buf) as usize;
    info!("receiving file {:?} ({} bytes)", name, size);

    let mut contents = Vec::with_capacity(size);
    let mut chunk = vec![0u8; RECV_CHUNK];
    let mut last_progress = Instant::now();
    while contents.len() < size {
        let want = min(RECV_CHUNK, size - contents.len());
        let n = conn.recv(&mut chunk[..want]).await?;
        if n > 0 {
            contents.extend_from_slice(&chunk[..n]);
            last_progress = Instant::now();
            debug!("file progress: {}/{} bytes", contents.len(), size);
        } else if last_progress.elapsed() > STALL_TIMEOUT {
            warn!(
                "no progress for {:?} - aborting at {}/{} bytes",
                STALL_TIMEOUT,
                contents.len(),
                size
            );
            return Err(RudpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "file receive stalled",
            )));
        }
    }

    fs::write(&name, &contents).await?;
    let digest = hex_digest(&contents);
    info!("received {:?} ({} bytes, sha256 {})", name, contents.len(), digest);

    Ok(ReceivedFile {
        name,
        len: contents.len() as u64,
        digest,
    })
}

/// Receive exactly `out.len()` bytes, tolerating short reads, bounded by the
/// stall timeout.
async fn recv_exact(conn: &mut Connection, out: &mut [u8]) -> crate::Result<()> {
    let started = Instant::now();
    let mut got = 0;
    while got < out.len() {
        let n = conn.recv(&mut out[got..]).await?;
        got += n;
        if n == 0 && started.elapsed() > STALL_TIMEOUT {
            return Err(RudpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for transfer framing",
            )));
        }
    }
    Ok(())
}

/// Lower-case hex SHA-256 of `data`, the end-to-end transfer check.
pub fn hex_digest(data: &[u8]) -> String {
    use std::fmt::Write;

    Sha256::digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest_known_value() {
        // sha256 of the empty input
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
