//! Parsing and validation of OCI image references.

use std::{fmt, str::FromStr};

use getset::Getters;
use oci_spec::image::Digest;

use crate::EdgepackError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry assumed when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The API host used for the default registry.
pub const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";

/// The repository namespace prepended to single-segment repository names.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// The tag assumed when a reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// Environment variable overriding the default registry.
pub const REGISTRY_ENV_VAR: &str = "ECI_REGISTRY";

/// Maximum length of a tag, per the distribution spec.
const MAX_TAG_LEN: usize = 128;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed OCI image reference: registry, repository and a tag or digest selector.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry hosting the image.
    registry: String,

    /// The repository name of the image.
    repository: String,

    /// The tag or digest the image is selected by.
    selector: ReferenceSelector,
}

/// The selector part of an image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// A tag, optionally pinned to a digest.
    Tag {
        /// The image tag.
        tag: String,

        /// The optional pinning digest.
        digest: Option<Digest>,
    },

    /// A digest only.
    Digest(Digest),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Returns the host the distribution API of this reference's registry answers on.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }

    /// Returns the string used to address the manifest: the digest when pinned, the tag
    /// otherwise.
    pub fn tag_or_digest(&self) -> String {
        match &self.selector {
            ReferenceSelector::Tag {
                digest: Some(digest),
                ..
            } => digest.to_string(),
            ReferenceSelector::Tag { tag, .. } => tag.clone(),
            ReferenceSelector::Digest(digest) => digest.to_string(),
        }
    }

    /// Returns the tag to publish under, if the selector carries one.
    pub fn tag(&self) -> Option<&str> {
        match &self.selector {
            ReferenceSelector::Tag { tag, .. } => Some(tag),
            ReferenceSelector::Digest(_) => None,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the default registry, honoring the [`REGISTRY_ENV_VAR`] override.
pub fn default_registry() -> String {
    std::env::var(REGISTRY_ENV_VAR).unwrap_or_else(|_| DEFAULT_REGISTRY.to_string())
}

/// A segment before the first `/` only names a registry when it could be a host:
/// `localhost`, something dotted, or something carrying a port.
fn is_registry_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}

/// A registry is a host of alphanumerics, dots and dashes, with an optional numeric port.
fn is_valid_registry(registry: &str) -> bool {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };

    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && port.map_or(true, |port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

/// A repository is one or more `/`-separated components, each a run of lowercase
/// alphanumerics optionally broken up by single `.`, `_` or `-` separators.
fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty() && repository.split('/').all(is_valid_repo_component)
}

fn is_valid_repo_component(component: &str) -> bool {
    // Separators may not lead, trail or double up.
    let mut after_separator = true;
    for c in component.chars() {
        match c {
            'a'..='z' | '0'..='9' => after_separator = false,
            '.' | '_' | '-' if !after_separator => after_separator = true,
            _ => return false,
        }
    }
    !component.is_empty() && !after_separator
}

/// A tag starts with an alphanumeric or underscore and continues with at most 127 more
/// alphanumerics, underscores, dots or dashes.
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    tag.len() <= MAX_TAG_LEN
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = EdgepackError;

    /// Parses a reference of the forms `registry/repository:tag`, `repository:tag`,
    /// `repository`, `registry/repository@digest` or `registry/repository:tag@digest`,
    /// filling in the default registry, namespace and tag when omitted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EdgepackError::ImageReference("input string is empty".into()));
        }

        // A trailing `@<algorithm>:<hex>` pins the reference to a digest.
        let (name, digest) = match s.split_once('@') {
            Some((name, digest_str)) => {
                if !digest_str.contains(':') {
                    return Err(EdgepackError::ImageReference(format!(
                        "invalid digest: {}",
                        digest_str
                    )));
                }
                let digest = digest_str.parse::<Digest>().map_err(|e| {
                    EdgepackError::ImageReference(format!("invalid digest: {}", e))
                })?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        // A leading host-like segment names the registry; otherwise the default applies
        // and the whole name is the repository path.
        let (registry, path) = match name.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host.to_string(), rest),
            _ => (default_registry(), name),
        };
        if !is_valid_registry(&registry) {
            return Err(EdgepackError::ImageReference(format!(
                "invalid registry: {}",
                registry
            )));
        }

        // The tag follows the last `:`; a bare repository gets the default tag, and a
        // single-segment repository the default namespace.
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repository, tag)) => (repository, tag.to_string()),
            None => (path, DEFAULT_TAG.to_string()),
        };
        if repository.is_empty() {
            return Err(EdgepackError::ImageReference("repository is empty".into()));
        }
        let repository = if repository.contains('/') {
            repository.to_string()
        } else {
            format!("{}/{}", DEFAULT_REPO_NAMESPACE, repository)
        };
        if !is_valid_repository(&repository) {
            return Err(EdgepackError::ImageReference(format!(
                "invalid repository: {}",
                repository
            )));
        }
        if !is_valid_tag(&tag) {
            return Err(EdgepackError::ImageReference(format!("invalid tag: {}", tag)));
        }

        Ok(Reference {
            registry,
            repository,
            selector: ReferenceSelector::Tag { tag, digest },
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag {
                tag,
                digest: Some(digest),
            } => write!(f, ":{}@{}", tag, digest),
            ReferenceSelector::Tag { tag, digest: None } => write!(f, ":{}", tag),
            ReferenceSelector::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_with_registry_and_tag() {
        let reference = "registry.example.com/eve/uno:1.0".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "registry.example.com");
        assert_eq!(reference.get_repository(), "eve/uno");
        assert_eq!(reference.tag(), Some("1.0"));
        assert_eq!(reference.tag_or_digest(), "1.0");
        assert_eq!(reference.to_string(), "registry.example.com/eve/uno:1.0");
    }

    #[test]
    fn test_reference_defaults_applied() {
        let reference = "alpine".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), &default_registry());
        assert_eq!(reference.get_repository(), "library/alpine");
        assert_eq!(reference.tag(), Some(DEFAULT_TAG));
    }

    #[test]
    fn test_reference_digest_pinned() {
        let hex = "ab".repeat(32);
        let reference = format!("registry.io/eve/uno:1.0@sha256:{}", hex)
            .parse::<Reference>()
            .unwrap();
        assert_eq!(reference.tag_or_digest(), format!("sha256:{}", hex));
        assert_eq!(reference.tag(), Some("1.0"));
    }

    #[test]
    fn test_reference_registry_with_port() {
        let reference = "localhost:5000/uno:2".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "localhost:5000");
        assert_eq!(reference.get_repository(), "library/uno");
        assert_eq!(reference.api_host(), "localhost:5000");
    }

    #[test]
    fn test_reference_docker_hub_api_host() {
        let reference = "docker.io/library/alpine:3".parse::<Reference>().unwrap();
        assert_eq!(reference.api_host(), DEFAULT_REGISTRY_API_HOST);
    }

    #[test]
    fn test_reference_rejects_bad_inputs() {
        assert!("".parse::<Reference>().is_err());
        assert!("registry.example.com/:tag".parse::<Reference>().is_err());
        assert!("docker.io/Library/alpine:3".parse::<Reference>().is_err());
        assert!("docker.io/library/alpine:t!ag".parse::<Reference>().is_err());
        assert!("docker.io/library/alpine@notadigest".parse::<Reference>().is_err());
        assert!("inva!id-registry.com/library/alpine:3".parse::<Reference>().is_err());
    }

    #[test]
    fn test_reference_component_rules() {
        // Separators inside repository components are single and interior only.
        assert!("docker.io/my-org/my.repo:1".parse::<Reference>().is_ok());
        assert!("docker.io/-org/repo:1".parse::<Reference>().is_err());
        assert!("docker.io/org-/repo:1".parse::<Reference>().is_err());
        assert!("docker.io/o--rg/repo:1".parse::<Reference>().is_err());

        // Tag length is capped at 128 characters.
        let long_tag = "a".repeat(129);
        assert!(format!("docker.io/library/alpine:{}", long_tag)
            .parse::<Reference>()
            .is_err());
        let max_tag = "a".repeat(128);
        assert!(format!("docker.io/library/alpine:{}", max_tag)
            .parse::<Reference>()
            .is_ok());
    }
}
