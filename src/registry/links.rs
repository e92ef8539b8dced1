//! Link file analysis and verification
//!
//! A link file's digest is encoded twice: in its path and in its 71-byte
//! contents. Verification proves the two agree, via the ETag shortcut when
//! the backend advertises one and by reading the file otherwise.

use crate::digest::{Digest, REFERENCE_SIZE};
use crate::error::{Result, ScourError};
use crate::storage::SharedStorage;

/// Parse trailing link path components: `[sha256, <hex>, link]`.
pub fn analyze_link(args: &[&str]) -> Result<Digest> {
    if args.len() != 3 {
        return Err(ScourError::UnparseablePath(format!(
            "invalid components for link: {args:?}"
        )));
    }

    if args[2] != "link" {
        return Err(ScourError::UnparseablePath(format!(
            "expected link as last path component: {}",
            args[2]
        )));
    }

    Digest::from_path(&args[0..2])
}

/// Parse manifest signature link components:
/// `[sha256, <revision>, signatures, sha256, <signature>, link]`.
///
/// Returns `(revision, signature)`.
pub fn analyze_signature_link(args: &[&str]) -> Result<(Digest, Digest)> {
    if args.len() != 6 || args[2] != "signatures" {
        return Err(ScourError::UnparseablePath(format!(
            "invalid components for signature link: {args:?}"
        )));
    }

    let revision = Digest::from_path(&args[0..2])?;
    let signature = analyze_link(&args[3..6])?;
    Ok((revision, signature))
}

/// Read a link file and parse exactly one reference out of it.
pub async fn read_link(storage: &SharedStorage, path: &str, etag: &str) -> Result<Digest> {
    let data = storage.read(path, etag).await?;

    if data.len() != REFERENCE_SIZE as usize {
        return Err(ScourError::InvalidDigest(format!(
            "link file should hold exactly one reference: {path}"
        )));
    }

    Digest::from_reference(&data)
}

/// Verify that the link file at `path` names `expected`.
///
/// With a non-empty advertised ETag the check is a byte comparison against
/// the digest's own reference ETag and costs no I/O; a mismatch there is
/// already a verification failure. Without one the file is read and parsed.
pub async fn verify_link(
    storage: &SharedStorage,
    expected: Digest,
    path: &str,
    etag: &str,
) -> Result<()> {
    if !etag.is_empty() {
        let expected_etag = expected.etag();
        if etag == expected_etag {
            return Ok(());
        }
        return Err(ScourError::LinkMismatch {
            path: path.to_string(),
            expected: expected_etag,
            actual: etag.to_string(),
        });
    }

    let actual = read_link(storage, path, etag).await?;
    if actual != expected {
        return Err(ScourError::LinkMismatch {
            path: path.to_string(),
            expected: expected.reference(),
            actual: actual.reference(),
        });
    }

    Ok(())
}
