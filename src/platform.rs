//! Maps source URLs to the platform that hosts them.
//!
//! Matching is done on the host only; paths, query strings and schemes never
//! influence the outcome. The table below is ordered, and when more than one
//! substring is contained in the host the longest one wins so that
//! `music.youtube.com` is never shadowed by `youtube.com`.

use serde::Serialize;
use url::Url;

/// Every platform the API knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
    Instagram,
    Facebook,
    Twitter,
    Vimeo,
    Soundcloud,
    Unknown,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Twitter => "twitter",
            Platform::Vimeo => "vimeo",
            Platform::Soundcloud => "soundcloud",
            Platform::Unknown => "unknown",
        }
    }

    pub fn is_supported(self) -> bool {
        self != Platform::Unknown
    }
}

/// Default kind of media a platform hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Unknown,
}

/// One row of the lookup table.
#[derive(Debug, Clone, Copy)]
pub struct PlatformEntry {
    pub domain: &'static str,
    pub platform: Platform,
    pub media_type: MediaType,
}

const fn entry(domain: &'static str, platform: Platform, media_type: MediaType) -> PlatformEntry {
    PlatformEntry {
        domain,
        platform,
        media_type,
    }
}

pub const PLATFORM_TABLE: &[PlatformEntry] = &[
    entry("youtube.com", Platform::Youtube, MediaType::Video),
    entry("youtu.be", Platform::Youtube, MediaType::Video),
    entry("music.youtube.com", Platform::Youtube, MediaType::Audio),
    entry("tiktok.com", Platform::Tiktok, MediaType::Video),
    entry("instagram.com", Platform::Instagram, MediaType::Video),
    entry("facebook.com", Platform::Facebook, MediaType::Video),
    entry("fb.watch", Platform::Facebook, MediaType::Video),
    entry("twitter.com", Platform::Twitter, MediaType::Video),
    entry("vimeo.com", Platform::Vimeo, MediaType::Video),
    entry("soundcloud.com", Platform::Soundcloud, MediaType::Audio),
];

/// Result of a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformMatch {
    pub platform: Platform,
    pub media_type: MediaType,
}

impl PlatformMatch {
    pub const UNKNOWN: Self = Self {
        platform: Platform::Unknown,
        media_type: MediaType::Unknown,
    };
}

/// Identifies the platform behind `url`. Malformed input falls through to
/// [`PlatformMatch::UNKNOWN`].
pub fn identify(url: &str) -> PlatformMatch {
    let host = match Url::parse(url.trim()) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return PlatformMatch::UNKNOWN,
        },
        Err(_) => return PlatformMatch::UNKNOWN,
    };
    identify_host(&host)
}

/// Longest-substring lookup over an already lower-cased host. Ties keep table
/// order.
pub fn identify_host(host: &str) -> PlatformMatch {
    let mut best: Option<&PlatformEntry> = None;
    for candidate in PLATFORM_TABLE.iter().filter(|e| host.contains(e.domain)) {
        if best.is_none_or(|current| candidate.domain.len() > current.domain.len()) {
            best = Some(candidate);
        }
    }

    best.map(|entry| PlatformMatch {
        platform: entry.platform,
        media_type: entry.media_type,
    })
    .unwrap_or(PlatformMatch::UNKNOWN)
}
