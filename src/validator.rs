//! Admission of user-supplied video URLs.
//!
//! [`validate`] turns an arbitrary string into a [`CanonicalUrl`]: the host is
//! checked against a fixed allow-list, the path must address a single video,
//! and every query parameter outside the platform's keep-set is dropped along
//! with the fragment. Validation is pure and never touches the network.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
    TikTok,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::YouTube, Platform::Instagram, Platform::TikTok];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
        }
    }

    /// Registrable domains served by the platform. Subdomains match too.
    pub fn domains(self) -> &'static [&'static str] {
        match self {
            Platform::YouTube => &["youtube.com", "youtu.be"],
            Platform::Instagram => &["instagram.com"],
            Platform::TikTok => &["tiktok.com"],
        }
    }

    /// Query parameters that address content and survive sanitisation.
    fn kept_params(self) -> &'static [&'static str] {
        match self {
            Platform::YouTube => &["v", "t", "list"],
            Platform::Instagram | Platform::TikTok => &[],
        }
    }

    pub fn url_shapes(self) -> &'static [&'static str] {
        match self {
            Platform::YouTube => &[
                "youtube.com/watch?v=...",
                "youtube.com/shorts/...",
                "youtube.com/embed/...",
                "youtu.be/...",
            ],
            Platform::Instagram => &[
                "instagram.com/reel/...",
                "instagram.com/p/...",
                "instagram.com/tv/...",
            ],
            Platform::TikTok => &[
                "tiktok.com/@user/video/...",
                "tiktok.com/t/...",
                "vm.tiktok.com/...",
            ],
        }
    }

    fn for_host(host: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|platform| {
            platform
                .domains()
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed URL")]
    MalformedUrl,

    #[error("domain {host} is not supported")]
    DomainNotAllowed { host: String },

    #[error("URL does not point to a single video")]
    UnsupportedContent,
}

/// A URL that passed [`validate`]. Only the validator can build one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUrl {
    url: String,
    platform: Platform,
}

impl CanonicalUrl {
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.url
    }
}

pub fn validate(raw: &str) -> Result<CanonicalUrl, Rejection> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Rejection::MalformedUrl);
    }

    let mut parsed = Url::parse(raw).map_err(|_| Rejection::MalformedUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Rejection::MalformedUrl);
    }

    let host = parsed
        .host_str()
        .map(|host| host.to_ascii_lowercase())
        .ok_or(Rejection::MalformedUrl)?;
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    let platform =
        Platform::for_host(&host).ok_or_else(|| Rejection::DomainNotAllowed { host: host.clone() })?;

    if !addresses_video(platform, &host, &parsed) {
        return Err(Rejection::UnsupportedContent);
    }

    let kept = parsed
        .query_pairs()
        .filter(|(key, _)| platform.kept_params().contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();

    parsed
        .set_host(Some(&host))
        .map_err(|_| Rejection::MalformedUrl)?;
    parsed.set_username("").map_err(|()| Rejection::MalformedUrl)?;
    parsed.set_password(None).map_err(|()| Rejection::MalformedUrl)?;
    parsed.set_port(None).map_err(|()| Rejection::MalformedUrl)?;
    parsed.set_fragment(None);
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&kept);
    }

    Ok(CanonicalUrl {
        url: parsed.into(),
        platform,
    })
}

fn addresses_video(platform: Platform, host: &str, url: &Url) -> bool {
    let segments = url
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();

    match platform {
        Platform::YouTube if host == "youtu.be" || host.ends_with(".youtu.be") => {
            matches!(segments.as_slice(), [id, ..] if is_identifier(id))
        }
        Platform::YouTube => match segments.as_slice() {
            ["watch", ..] => url
                .query_pairs()
                .any(|(key, value)| key == "v" && is_identifier(&value)),
            ["shorts" | "embed", id, ..] => is_identifier(id),
            _ => false,
        },
        Platform::Instagram => {
            matches!(segments.as_slice(), ["p" | "reel" | "reels" | "tv", id, ..] if is_identifier(id))
        }
        Platform::TikTok if is_short_link_host(host) => {
            matches!(segments.as_slice(), [id, ..] if is_identifier(id))
        }
        Platform::TikTok => match segments.as_slice() {
            [user, "video", id, ..] => {
                user.len() > 1
                    && user.starts_with('@')
                    && user[1..]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
                    && !id.is_empty()
                    && id.chars().all(|c| c.is_ascii_digit())
            }
            ["t", id, ..] => is_identifier(id),
            _ => false,
        },
    }
}

fn is_short_link_host(host: &str) -> bool {
    matches!(host, "vm.tiktok.com" | "vt.tiktok.com")
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}
