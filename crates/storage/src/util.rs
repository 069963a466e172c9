//! Small helpers shared by the backends.

use std::io;

/// Retries an interrupted syscall until it completes.
///
/// Blocking I/O in the daemon is broken by timers delivering signals; the
/// wrapped operation must be safe to re-issue after `EINTR`.
pub fn uninterruptible<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Returns true when the buffer contains only zero bytes.
///
/// Scans eight bytes at a time so the sparse-write detection in the transfer
/// engine keeps up with the network.
#[must_use]
pub fn is_zero(buf: &[u8]) -> bool {
    let mut chunks = buf.chunks_exact(8);
    if !chunks.all(|chunk| u64::from_ne_bytes(chunk.try_into().expect("sized chunk")) == 0) {
        return false;
    }
    chunks.remainder().iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::{is_zero, uninterruptible};
    use std::io;

    #[test]
    fn is_zero_on_empty_buffer() {
        assert!(is_zero(&[]));
    }

    #[test]
    fn is_zero_detects_aligned_and_unaligned_zeros() {
        assert!(is_zero(&[0u8; 16]));
        assert!(is_zero(&[0u8; 13]));
    }

    #[test]
    fn is_zero_rejects_nonzero_anywhere() {
        for i in [0usize, 7, 8, 12] {
            let mut buf = vec![0u8; 13];
            buf[i] = 1;
            assert!(!is_zero(&buf), "missed nonzero byte at {i}");
        }
    }

    #[test]
    fn uninterruptible_retries_eintr() {
        let mut attempts = 0;
        let result = uninterruptible(|| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::Interrupted))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn uninterruptible_propagates_other_errors() {
        let result: io::Result<()> =
            uninterruptible(|| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }
}
