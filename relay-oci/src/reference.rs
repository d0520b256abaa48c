use std::fmt;

use crate::descriptor::Digest;
use crate::error::{OciError, Result};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_V1_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_V2_REGISTRY: &str = "registry-1.docker.io";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// Whether `registry` is one of the Docker Hub host aliases.
pub fn is_docker_hub(registry: &str) -> bool {
    matches!(
        registry,
        DEFAULT_REGISTRY | DEFAULT_V1_REGISTRY | DEFAULT_V2_REGISTRY
    )
}

/// A parsed image reference: `[registry/][namespace/]name[:tag][@id]`.
///
/// Empty fields mean "not given"; call [`ImageReference::client_defaults`]
/// to fill them in the way container clients do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    pub id: String,
}

impl ImageReference {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine`
    /// - `alpine:3.20`
    /// - `quay.io/org/app:v1`
    /// - `localhost:5000/team/app@sha256:…`
    ///
    /// The first path component is a registry host when it contains a dot or
    /// a colon, or is exactly `localhost`. After that, the first remaining
    /// component is the namespace and the rest is the name.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = |reason: &str| OciError::InvalidReference {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (rest, id) = match raw.split_once('@') {
            Some((rest, id)) => {
                Digest::parse(id).map_err(|_| invalid("malformed digest"))?;
                (rest, id.to_string())
            }
            None => (raw, String::new()),
        };

        // A tag colon always comes after the last '/'; earlier colons belong
        // to a registry port.
        let after_last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (path, tag) = match rest.rfind(':') {
            Some(colon) if colon >= after_last_slash => {
                let tag = &rest[colon + 1..];
                if tag.is_empty() {
                    return Err(invalid("empty tag"));
                }
                (&rest[..colon], tag.to_string())
            }
            _ => (rest, String::new()),
        };

        if !tag.is_empty() && !valid_tag(&tag) {
            return Err(invalid("malformed tag"));
        }

        let (registry, remainder) = match path.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder)
            }
            _ => (String::new(), path),
        };

        if remainder.is_empty() || !remainder.split('/').all(valid_path_component) {
            return Err(invalid("malformed repository name"));
        }

        let (namespace, name) = match remainder.split_once('/') {
            Some((ns, name)) => (ns.to_string(), name.to_string()),
            None => (String::new(), remainder.to_string()),
        };

        Ok(Self {
            registry,
            namespace,
            name,
            tag,
            id,
        })
    }

    /// Fill in the defaults a container client would assume: Docker Hub for
    /// a missing registry, `library` for a missing Docker Hub namespace, and
    /// the `latest` tag.
    pub fn client_defaults(mut self) -> Self {
        if self.registry.is_empty() {
            self.registry = DEFAULT_REGISTRY.to_string();
        }
        if self.namespace.is_empty() && is_docker_hub(&self.registry) {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if self.tag.is_empty() {
            self.tag = DEFAULT_TAG.to_string();
        }
        self
    }

    /// The same reference with tag and id dropped, identifying the repository.
    pub fn as_repository(&self) -> Self {
        Self {
            tag: String::new(),
            id: String::new(),
            ..self.clone()
        }
    }

    /// Map Docker Hub aliases onto the host that actually speaks the v2 API.
    pub fn as_v2(&self) -> Self {
        let mut r = self.clone();
        if r.registry == DEFAULT_REGISTRY || r.registry == DEFAULT_V1_REGISTRY {
            r.registry = DEFAULT_V2_REGISTRY.to_string();
        }
        r
    }

    /// Repository path without registry, tag or id (e.g. `library/alpine`).
    pub fn repository_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Registry endpoint URL for v2 API calls.
    pub fn registry_url(&self) -> String {
        format!("https://{}", self.as_v2().registry)
    }

    fn name_string(&self) -> String {
        if self.name.is_empty() {
            String::new()
        } else if !self.tag.is_empty() {
            format!("{}:{}", self.name, self.tag)
        } else if !self.id.is_empty() {
            if Digest::parse(&self.id).is_ok() {
                format!("{}@{}", self.name, self.id)
            } else {
                format!("{}:{}", self.name, self.id)
            }
        } else {
            self.name.clone()
        }
    }

    /// The exact textual form, without adding any defaults.
    pub fn exact(&self) -> String {
        let name = self.name_string();
        if name.is_empty() {
            return name;
        }
        let mut s = String::new();
        if !self.registry.is_empty() {
            s.push_str(&self.registry);
            s.push('/');
        }
        if !self.namespace.is_empty() {
            s.push_str(&self.namespace);
            s.push('/');
        }
        s + &name
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() && is_docker_hub(&self.registry) {
            let mut r = self.clone();
            r.namespace = DEFAULT_NAMESPACE.to_string();
            return f.write_str(&r.exact());
        }
        f.write_str(&self.exact())
    }
}

fn valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        && component
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
}

fn valid_tag(tag: &str) -> bool {
    tag.len() <= 128
        && tag
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn parse_simple_name() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "");
        assert_eq!(r.namespace, "");
        assert_eq!(r.name, "ubuntu");
        assert_eq!(r.tag, "");
    }

    #[test]
    fn parse_registry_with_port_and_tag() {
        let r = ImageReference::parse("localhost:5000/team/app:v2").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.namespace, "team");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn parse_bare_localhost_is_registry() {
        let r = ImageReference::parse("localhost/app").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.name, "app");
    }

    #[test]
    fn parse_nested_name_keeps_rest_in_name() {
        let r = ImageReference::parse("quay.io/org/group/app").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.namespace, "org");
        assert_eq!(r.name, "group/app");
    }

    #[test]
    fn parse_digest_reference() {
        let r = ImageReference::parse(&format!("quay.io/org/app@{DIGEST}")).unwrap();
        assert_eq!(r.id, DIGEST);
        assert_eq!(r.tag, "");
        assert_eq!(r.exact(), format!("quay.io/org/app@{DIGEST}"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Upper/Case").is_err());
        assert!(ImageReference::parse("app@sha256:nothex").is_err());
        assert!(ImageReference::parse("quay.io/").is_err());
        assert!(ImageReference::parse("app:").is_err());
    }

    #[test]
    fn client_defaults_fill_docker_hub() {
        let r = ImageReference::parse("alpine").unwrap().client_defaults();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.namespace, "library");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.exact(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn client_defaults_leave_other_registries_namespace_empty() {
        let r = ImageReference::parse("quay.io/app").unwrap().client_defaults();
        assert_eq!(r.namespace, "");
        assert_eq!(r.exact(), "quay.io/app:latest");
    }

    #[test]
    fn as_repository_drops_tag_and_id() {
        let r = ImageReference::parse(&format!("quay.io/org/app:v1@{DIGEST}")).unwrap();
        assert_eq!(r.as_repository().exact(), "quay.io/org/app");
        assert_eq!(r.repository_name(), "org/app");
    }

    #[test]
    fn registry_url_maps_hub_to_v2_host() {
        let r = ImageReference::parse("alpine").unwrap().client_defaults();
        assert_eq!(r.registry_url(), "https://registry-1.docker.io");
        let q = ImageReference::parse("quay.io/org/app").unwrap();
        assert_eq!(q.registry_url(), "https://quay.io");
    }

    #[test]
    fn display_adds_library_for_hub() {
        let r = ImageReference {
            registry: "docker.io".into(),
            name: "busybox".into(),
            ..Default::default()
        };
        assert_eq!(r.to_string(), "docker.io/library/busybox");
    }
}
