use serde::Deserialize;

/// How image locators are split into name, tag and digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceMode {
    /// Digest at `@`, tag only after the last path separator, so a
    /// registry port (`host:5000/app`) stays part of the name.
    #[default]
    RegistryAware,
    /// Split on a single `:` first, then on `@`. A registry port is
    /// mistaken for a tag.
    Legacy,
}

/// Parsed components of an image locator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
    pub digest: String,
}

impl ImageReference {
    pub fn parse(locator: &str, mode: ReferenceMode) -> Self {
        match mode {
            ReferenceMode::RegistryAware => parse_registry_aware(locator),
            ReferenceMode::Legacy => parse_legacy(locator),
        }
    }
}

/// Rules tried in order: exactly one `:` splits name and tag, otherwise an
/// `@` splits name and digest, otherwise the whole locator is the name.
pub fn parse_legacy(locator: &str) -> ImageReference {
    if locator.matches(':').count() == 1 {
        if let Some((name, tag)) = locator.split_once(':') {
            return ImageReference {
                name: name.to_string(),
                tag: tag.to_string(),
                digest: String::new(),
            };
        }
    }

    if let Some((name, digest)) = locator.split_once('@') {
        return ImageReference {
            name: name.to_string(),
            tag: String::new(),
            digest: digest.to_string(),
        };
    }

    ImageReference {
        name: locator.to_string(),
        ..Default::default()
    }
}

pub fn parse_registry_aware(locator: &str) -> ImageReference {
    let (rest, digest) = match locator.split_once('@') {
        Some((rest, digest)) => (rest, digest),
        None => (locator, ""),
    };

    // A colon before the last '/' belongs to the registry host.
    let path_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match rest[path_start..].rfind(':') {
        Some(i) => (&rest[..path_start + i], &rest[path_start + i + 1..]),
        None => (rest, ""),
    };

    ImageReference {
        name: name.to_string(),
        tag: if digest.is_empty() {
            tag.to_string()
        } else {
            String::new()
        },
        digest: digest.to_string(),
    }
}

/// Registry host of an image name, or an empty string when the name carries
/// no explicit registry (e.g. `nginx`, `library/nginx`).
pub fn registry_domain(name: &str) -> &str {
    match name.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            first.split(':').next().unwrap_or(first)
        }
        _ => "",
    }
}
