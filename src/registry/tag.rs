//! Per-tag state
//!
//! A tag has a `current` pointer naming the active manifest and an `index/`
//! of every manifest ever tagged under this name. Which of those stay alive
//! is a policy decision (`delete_old_tag_versions`); the tag itself holds
//! no back-reference to its repository, operations receive the repository
//! name explicitly.

use crate::digest::{Digest, REFERENCE_SIZE};
use crate::error::Result;
use crate::storage::Deleter;
use std::collections::HashMap;

/// One tag: the current manifest pointer plus historical versions.
#[derive(Debug, Clone, Default)]
pub struct Tag {
    /// Target of `current/link`; the zero digest when never observed.
    pub current: Digest,
    /// Targets of `index/sha256/<hex>/link`, in discovery order.
    pub versions: Vec<Digest>,
}

impl Tag {
    /// `repositories/<repo>/_manifests/tags/<name>/current/link`
    pub fn current_link_path(repository: &str, name: &str) -> String {
        format!("repositories/{repository}/_manifests/tags/{name}/current/link")
    }

    /// `repositories/<repo>/_manifests/tags/<name>/index/sha256/<hex>/link`
    pub fn version_link_path(repository: &str, name: &str, version: Digest) -> String {
        format!(
            "repositories/{repository}/_manifests/tags/{name}/index/{}/link",
            version.path()
        )
    }

    /// Bump the repository's manifest counters for everything this tag
    /// keeps alive: the current manifest, plus non-current versions unless
    /// old versions are being collected.
    pub(crate) fn mark(&self, manifests: &mut HashMap<Digest, u64>, delete_old_versions: bool) {
        if self.current.is_valid() {
            *manifests.entry(self.current).or_insert(0) += 1;
        }

        for version in &self.versions {
            if *version == self.current {
                continue;
            }
            if delete_old_versions {
                continue;
            }
            *manifests.entry(*version).or_insert(0) += 1;
        }
    }

    /// Delete this tag's dead links: a dangling `current/link` (never
    /// observed pointing anywhere) and, under the collection policy, every
    /// non-current version link.
    pub(crate) async fn sweep(
        &self,
        repository: &str,
        name: &str,
        deleter: &Deleter,
        delete_old_versions: bool,
    ) -> Result<()> {
        if !self.current.is_valid() {
            deleter
                .delete_file(&Self::current_link_path(repository, name), REFERENCE_SIZE)
                .await?;
        }

        for version in &self.versions {
            if *version == self.current {
                continue;
            }
            if delete_old_versions {
                deleter
                    .delete_file(
                        &Self::version_link_path(repository, name, *version),
                        REFERENCE_SIZE,
                    )
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(hex_byte: &str) -> Digest {
        let hex = hex_byte.repeat(32);
        Digest::from_path(&["sha256", hex.as_str()]).unwrap()
    }

    #[test]
    fn test_paths() {
        let version = digest("ab");
        assert_eq!(
            Tag::current_link_path("acme/app", "latest"),
            "repositories/acme/app/_manifests/tags/latest/current/link"
        );
        assert_eq!(
            Tag::version_link_path("acme/app", "latest", version),
            format!(
                "repositories/acme/app/_manifests/tags/latest/index/sha256/{}/link",
                "ab".repeat(32)
            )
        );
    }

    #[test]
    fn test_mark_current_and_versions() {
        let current = digest("11");
        let old = digest("22");
        let tag = Tag {
            current,
            versions: vec![current, old],
        };

        // collecting old versions: only current is marked
        let mut manifests = HashMap::new();
        tag.mark(&mut manifests, true);
        assert_eq!(manifests.get(&current), Some(&1));
        assert_eq!(manifests.get(&old), None);

        // keeping old versions: both are marked
        let mut manifests = HashMap::new();
        tag.mark(&mut manifests, false);
        assert_eq!(manifests.get(&current), Some(&1));
        assert_eq!(manifests.get(&old), Some(&1));
    }

    #[test]
    fn test_mark_without_current() {
        let tag = Tag {
            current: Digest::default(),
            versions: vec![digest("22")],
        };

        let mut manifests = HashMap::new();
        tag.mark(&mut manifests, true);
        assert!(manifests.is_empty());
    }
}
