use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Buffer size for streaming fingerprint computation.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Content fingerprint: SHA-256 digest rendered as 64 lowercase hex chars.
/// Identical bytes always produce an identical fingerprint, regardless of
/// who uploaded them; this is the dedup key together with the owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used to shard blob paths on disk.
    pub fn shard_prefix(&self) -> &str {
        &self.0[..2]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidRequest(format!(
                "invalid fingerprint: {}",
                s
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

/// Compute the fingerprint of an in-memory payload.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Fingerprint::from_digest(&hasher.finalize())
}

/// Compute the fingerprint of a byte stream without buffering it whole.
/// Any read failure aborts the computation; a partial read never yields
/// a fingerprint.
pub async fn fingerprint_reader<R>(reader: &mut R) -> Result<Fingerprint>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Fingerprint::from_digest(&hasher.finalize()))
}

/// Verify that data matches an expected fingerprint.
pub fn verify_fingerprint(data: &[u8], expected: &Fingerprint) -> Result<()> {
    let actual = fingerprint_bytes(data);
    if &actual != expected {
        return Err(VaultError::FingerprintMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint_bytes(b"hello world");
        let b = fingerprint_bytes(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_on_single_bit() {
        let a = fingerprint_bytes(b"hello world");
        let b = fingerprint_bytes(b"hello worle");
        assert_ne!(a, b);
    }

    #[test]
    fn test_reader_matches_buffered() {
        // Payload larger than the read buffer to exercise multiple reads.
        let data = vec![0xabu8; READ_BUF_SIZE * 3 + 17];
        let expected = fingerprint_bytes(&data);

        let actual = tokio_test::block_on(async {
            let mut cursor = io::Cursor::new(data.clone());
            fingerprint_reader(&mut cursor).await.unwrap()
        });

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_empty_stream() {
        let expected = fingerprint_bytes(b"");
        let actual = tokio_test::block_on(async {
            let mut cursor = io::Cursor::new(Vec::new());
            fingerprint_reader(&mut cursor).await.unwrap()
        });
        assert_eq!(actual, expected);
    }

    /// Reader that yields some bytes, then fails.
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream interrupted",
                )));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0x42u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_read_yields_no_fingerprint() {
        let mut reader = FailingReader { remaining: 1024 };
        let result = fingerprint_reader(&mut reader).await;
        assert!(matches!(result, Err(VaultError::Io(_))));
    }

    #[test]
    fn test_parse_roundtrip() {
        let fp = fingerprint_bytes(b"content");
        let parsed: Fingerprint = fp.as_str().parse().unwrap();
        assert_eq!(parsed, fp);
        assert_eq!(parsed.shard_prefix().len(), 2);

        assert!("not-a-fingerprint".parse::<Fingerprint>().is_err());
    }
}
