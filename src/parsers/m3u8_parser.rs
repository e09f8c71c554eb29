//! M3U8 playlist parsing
//!
//! Turns playlist text into either a [`Manifest`] of media segments or the list
//! of variants of a multivariant playlist. URI resolution happens here so every
//! [`SegmentRef`] and [`KeyRef`] leaves the parser absolute.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error_handling::{AppResult, DownloadError};

/// Encryption declared by an `#EXT-X-KEY` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMethod {
    Aes128,
    SampleAes,
    Other(String),
}

impl KeyMethod {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "NONE" => None,
            "AES-128" => Some(Self::Aes128),
            "SAMPLE-AES" => Some(Self::SampleAes),
            other => Some(Self::Other(other.to_string())),
        }
    }
}

/// Key reference attached to the segments that follow an `#EXT-X-KEY` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

/// One media segment in playback order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Position in the manifest; defines assembly order
    pub index: usize,
    /// Media sequence number (`EXT-X-MEDIA-SEQUENCE` + position)
    pub sequence: u64,
    pub uri: String,
    pub duration: f64,
    /// Inclusive byte range `(start, end)` within `uri`
    pub byte_range: Option<(u64, u64)>,
    pub key: Option<KeyRef>,
    /// Preceded by `#EXT-X-DISCONTINUITY`
    pub discontinuity: bool,
}

/// Parsed media playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub version: u32,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub segments: Vec<SegmentRef>,
    pub is_live: bool,
}

impl Manifest {
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn is_encrypted(&self) -> bool {
        self.segments.iter().any(|s| s.key.is_some())
    }
}

/// One entry of a multivariant playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<String>,
}

/// Either kind of playlist
#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Media(Manifest),
    Multivariant(Vec<Variant>),
}

/// Pick the variant with the highest `BANDWIDTH`; the first listed wins a tie
pub fn select_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().fold(None, |best: Option<&Variant>, v| match best {
        Some(b) if b.bandwidth >= v.bandwidth => Some(b),
        _ => Some(v),
    })
}

/// Parse playlist text.
///
/// Relative URIs resolve against `base_override` when given, otherwise against
/// `source_url` (the playlist's own location). With neither, relative URIs are
/// a format error.
pub fn parse_playlist(
    content: &str,
    source_url: Option<&Url>,
    base_override: Option<&Url>,
) -> AppResult<Playlist> {
    let content = content.trim_start_matches('\u{feff}');
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(first) if first.starts_with("#EXTM3U") => {}
        _ => return Err(DownloadError::playlist("missing #EXTM3U header")),
    }

    let base = base_override.or(source_url);
    if content.contains("#EXT-X-STREAM-INF") {
        return parse_multivariant(lines, base).map(Playlist::Multivariant);
    }
    parse_media(lines, base).map(Playlist::Media)
}

/// Parse text that must be a media playlist
pub fn parse_media_playlist(
    content: &str,
    source_url: Option<&Url>,
    base_override: Option<&Url>,
) -> AppResult<Manifest> {
    match parse_playlist(content, source_url, base_override)? {
        Playlist::Media(manifest) => Ok(manifest),
        Playlist::Multivariant(_) => Err(DownloadError::playlist(
            "expected a media playlist but found a multivariant playlist",
        )),
    }
}

fn parse_multivariant<'a>(
    lines: impl Iterator<Item = &'a str>,
    base: Option<&Url>,
) -> AppResult<Vec<Variant>> {
    let mut variants = Vec::new();
    let mut pending: Option<(u64, Option<String>)> = None;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let attrs = parse_attributes(attrs);
            let bandwidth = attribute(&attrs, "BANDWIDTH")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let resolution = attribute(&attrs, "RESOLUTION").map(str::to_string);
            pending = Some((bandwidth, resolution));
        } else if !line.starts_with('#') {
            if let Some((bandwidth, resolution)) = pending.take() {
                variants.push(Variant {
                    uri: resolve_uri(base, line)?,
                    bandwidth,
                    resolution,
                });
            }
        }
    }

    if variants.is_empty() {
        return Err(DownloadError::playlist(
            "multivariant playlist lists no variant streams",
        ));
    }
    Ok(variants)
}

fn parse_media<'a>(lines: impl Iterator<Item = &'a str>, base: Option<&Url>) -> AppResult<Manifest> {
    let mut manifest = Manifest {
        version: 1,
        is_live: true,
        ..Manifest::default()
    };

    let mut current_duration: Option<f64> = None;
    let mut current_key: Option<KeyRef> = None;
    let mut pending_range: Option<(u64, Option<u64>)> = None;
    let mut last_range: Option<(String, u64)> = None;
    let mut discontinuity = false;

    for line in lines {
        if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
            manifest.version = value.trim().parse().unwrap_or(1);
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            manifest.target_duration = value.trim().parse().unwrap_or(0.0);
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            manifest.media_sequence = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or("0").trim();
            current_duration = Some(
                duration
                    .parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite() && *d >= 0.0)
                    .ok_or_else(|| {
                        DownloadError::playlist(format!("invalid #EXTINF duration: {}", line))
                    })?,
            );
        } else if let Some(value) = line.strip_prefix("#EXT-X-KEY:") {
            current_key = parse_key(value, base)?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-BYTERANGE:") {
            pending_range = Some(parse_byte_range(value)?);
        } else if line.starts_with("#EXT-X-DISCONTINUITY") && !line.contains("SEQUENCE") {
            discontinuity = true;
        } else if let Some(value) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
            manifest.is_live = !value.trim().eq_ignore_ascii_case("VOD");
        } else if line.starts_with("#EXT-X-ENDLIST") {
            manifest.is_live = false;
        } else if !line.starts_with('#') {
            let index = manifest.segments.len();
            let uri = resolve_uri(base, line)?;
            let byte_range = match pending_range.take() {
                Some((length, offset)) => {
                    let range = sub_range(&uri, length, offset, last_range.as_ref())?;
                    last_range = Some((uri.clone(), range.1));
                    Some(range)
                }
                None => None,
            };

            manifest.segments.push(SegmentRef {
                index,
                sequence: manifest.media_sequence + index as u64,
                uri,
                duration: current_duration.take().unwrap_or(0.0),
                byte_range,
                key: current_key.clone(),
                discontinuity: std::mem::take(&mut discontinuity),
            });
        }
    }

    if manifest.segments.is_empty() {
        return Err(DownloadError::playlist("playlist contains no media segments"));
    }

    tracing::debug!(
        "Parsed media playlist: {} segments, {:.2}s",
        manifest.segments.len(),
        manifest.total_duration()
    );
    Ok(manifest)
}

fn parse_key(value: &str, base: Option<&Url>) -> AppResult<Option<KeyRef>> {
    let attrs = parse_attributes(value);
    let method = attribute(&attrs, "METHOD")
        .ok_or_else(|| DownloadError::playlist("#EXT-X-KEY without METHOD"))?;

    let Some(method) = KeyMethod::parse(method) else {
        return Ok(None);
    };

    let uri = attribute(&attrs, "URI")
        .map(|uri| resolve_uri(base, uri))
        .transpose()?;
    let iv = match attribute(&attrs, "IV") {
        Some(iv) => Some(
            crate::utils::validation::parse_hex_block(iv)
                .ok_or_else(|| DownloadError::playlist(format!("invalid key IV: {}", iv)))?,
        ),
        None => None,
    };

    if method == KeyMethod::Aes128 && uri.is_none() {
        return Err(DownloadError::playlist("AES-128 key declared without URI"));
    }

    Ok(Some(KeyRef { method, uri, iv }))
}

/// `<length>[@<offset>]`
fn parse_byte_range(value: &str) -> AppResult<(u64, Option<u64>)> {
    let invalid = || DownloadError::playlist(format!("invalid #EXT-X-BYTERANGE: {}", value));
    let mut parts = value.trim().splitn(2, '@');
    let length: u64 = parts
        .next()
        .and_then(|l| l.trim().parse().ok())
        .filter(|l| *l > 0)
        .ok_or_else(invalid)?;
    let offset = match parts.next() {
        Some(o) => Some(o.trim().parse().map_err(|_| invalid())?),
        None => None,
    };
    Ok((length, offset))
}

/// Inclusive `(start, end)` of a sub-range. Without an offset the range follows
/// the previous sub-range of the same resource.
fn sub_range(
    uri: &str,
    length: u64,
    offset: Option<u64>,
    previous: Option<&(String, u64)>,
) -> AppResult<(u64, u64)> {
    let start = match offset {
        Some(offset) => offset,
        None => match previous {
            Some((prev_uri, prev_end)) if prev_uri == uri => prev_end
                .checked_add(1)
                .ok_or_else(|| DownloadError::playlist("byte range overflows"))?,
            _ => {
                return Err(DownloadError::playlist(format!(
                    "#EXT-X-BYTERANGE without offset does not follow a range of {}",
                    uri
                )))
            }
        },
    };
    let end = start
        .checked_add(length - 1)
        .ok_or_else(|| DownloadError::playlist("byte range overflows"))?;
    Ok((start, end))
}

/// Split an attribute list, honouring quoted values that contain commas
fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let bytes = list.as_bytes();

    for i in 0..=bytes.len() {
        let at_end = i == bytes.len();
        if !at_end && bytes[i] == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if at_end || (bytes[i] == b',' && !in_quotes) {
            let item = &list[start..i];
            if let Some((key, value)) = item.split_once('=') {
                attrs.push((
                    key.trim().to_ascii_uppercase(),
                    value.trim().trim_matches('"').to_string(),
                ));
            }
            start = i + 1;
        }
    }
    attrs
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn resolve_uri(base: Option<&Url>, reference: &str) -> AppResult<String> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute.to_string());
    }
    let base = base.ok_or_else(|| {
        DownloadError::playlist(format!(
            "relative URI '{}' needs a base URL to resolve against",
            reference
        ))
    })?;
    base.join(reference)
        .map(|url| url.to_string())
        .map_err(|e| DownloadError::playlist(format!("failed to resolve '{}': {}", reference, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    const VOD: &str = r#"#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:7
#EXTINF:9.009,
segment000.ts
#EXTINF:9.009,
https://cdn.example.com/segment001.ts
#EXT-X-DISCONTINUITY
#EXTINF:3.003,
/abs/segment002.ts
#EXT-X-ENDLIST"#;

    #[test]
    fn test_media_playlist_parsing() {
        let source = url("https://example.com/videos/playlist.m3u8?token=1");
        let manifest = parse_media_playlist(VOD, Some(&source), None).unwrap();

        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.target_duration, 10.0);
        assert_eq!(manifest.segments.len(), 3);
        assert!((manifest.total_duration() - 21.021).abs() < 0.001);
        assert!(!manifest.is_live);

        let uris: Vec<&str> = manifest.segments.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(
            uris,
            [
                "https://example.com/videos/segment000.ts",
                "https://cdn.example.com/segment001.ts",
                "https://example.com/abs/segment002.ts",
            ]
        );
        for (i, segment) in manifest.segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert_eq!(segment.sequence, 7 + i as u64);
        }
        assert!(!manifest.segments[1].discontinuity);
        assert!(manifest.segments[2].discontinuity);
    }

    #[test]
    fn test_base_override_wins() {
        let source = url("https://example.com/videos/playlist.m3u8");
        let base = url("https://mirror.example.org/hls/");
        let manifest = parse_media_playlist(VOD, Some(&source), Some(&base)).unwrap();
        assert_eq!(
            manifest.segments[0].uri,
            "https://mirror.example.org/hls/segment000.ts"
        );
    }

    #[test]
    fn test_relative_without_base_fails() {
        let err = parse_media_playlist(VOD, None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");
    }

    #[test]
    fn test_no_segments_is_format_error() {
        let err = parse_playlist("#EXTM3U\n#EXT-X-ENDLIST\n", None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");

        let err = parse_playlist("<html>nope</html>", None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");
    }

    #[test]
    fn test_key_tags_apply_to_following_segments() {
        let content = r#"#EXTM3U
#EXTINF:4,
clear.ts
#EXT-X-KEY:METHOD=AES-128,URI="keys/k1.bin",IV=0X99b74007b6254e4bd1c6e03631cad15b
#EXTINF:4,
a.ts
#EXTINF:4,
b.ts
#EXT-X-KEY:METHOD=AES-128,URI="https://keys.example.com/k2?x=1,2"
#EXTINF:4,
c.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:4,
d.ts
"#;
        let source = url("https://example.com/live/index.m3u8");
        let manifest = parse_media_playlist(content, Some(&source), None).unwrap();
        let keys: Vec<Option<&KeyRef>> = manifest.segments.iter().map(|s| s.key.as_ref()).collect();

        assert!(keys[0].is_none());
        let k1 = keys[1].unwrap();
        assert_eq!(k1.method, KeyMethod::Aes128);
        assert_eq!(
            k1.uri.as_deref(),
            Some("https://example.com/live/keys/k1.bin")
        );
        assert_eq!(k1.iv.unwrap()[0], 0x99);
        assert_eq!(keys[2], keys[1]);

        let k2 = keys[3].unwrap();
        assert_eq!(k2.uri.as_deref(), Some("https://keys.example.com/k2?x=1,2"));
        assert!(k2.iv.is_none());
        assert!(keys[4].is_none());
        assert!(manifest.is_encrypted());
        assert!(manifest.is_live);
    }

    #[test]
    fn test_byte_ranges_continue_from_previous() {
        let content = r#"#EXTM3U
#EXTINF:4,
#EXT-X-BYTERANGE:1000@0
https://example.com/all.ts
#EXTINF:4,
#EXT-X-BYTERANGE:500
https://example.com/all.ts
"#;
        let manifest = parse_media_playlist(content, None, None).unwrap();
        assert_eq!(manifest.segments[0].byte_range, Some((0, 999)));
        assert_eq!(manifest.segments[1].byte_range, Some((1000, 1499)));
    }

    #[test]
    fn test_byte_range_overflow_is_format_error() {
        let content = "#EXTM3U\n#EXTINF:4,\n#EXT-X-BYTERANGE:2@18446744073709551615\nhttps://example.com/all.ts\n";
        let err = parse_media_playlist(content, None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");

        let content = "#EXTM3U\n#EXTINF:4,\n#EXT-X-BYTERANGE:1@18446744073709551615\nhttps://example.com/all.ts\n#EXTINF:4,\n#EXT-X-BYTERANGE:1\nhttps://example.com/all.ts\n";
        let err = parse_media_playlist(content, None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");
    }

    #[test]
    fn test_byte_range_without_offset_needs_same_resource() {
        let content = r#"#EXTM3U
#EXTINF:4,
#EXT-X-BYTERANGE:1000@0
https://example.com/a.ts
#EXTINF:4,
#EXT-X-BYTERANGE:500
https://example.com/b.ts
"#;
        let err = parse_media_playlist(content, None, None).unwrap_err();
        assert_eq!(err.kind(), "PlaylistFormatError");

        let content = "#EXTM3U\n#EXTINF:4,\n#EXT-X-BYTERANGE:500\nhttps://example.com/a.ts\n";
        assert!(parse_media_playlist(content, None, None).is_err());
    }

    #[test]
    fn test_extinf_rejects_non_finite_and_negative() {
        for duration in ["nan", "inf", "-4.0", "abc"] {
            let content = format!("#EXTM3U\n#EXTINF:{},\nhttps://example.com/a.ts\n", duration);
            let err = parse_media_playlist(&content, None, None).unwrap_err();
            assert_eq!(err.kind(), "PlaylistFormatError", "duration {duration}");
        }
    }

    #[test]
    fn test_multivariant_selects_highest_bandwidth() {
        let content = r#"#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS="avc1.4d401e,mp4a.40.2"
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720
mid/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1920x1080
tie/index.m3u8
"#;
        let source = url("https://example.com/master.m3u8");
        let Playlist::Multivariant(variants) = parse_playlist(content, Some(&source), None).unwrap()
        else {
            panic!("expected multivariant playlist");
        };
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[0].resolution.as_deref(), Some("640x360"));

        let best = select_variant(&variants).unwrap();
        assert_eq!(best.uri, "https://example.com/mid/index.m3u8");
        assert_eq!(best.bandwidth, 2_500_000);
    }

    #[test]
    fn test_attribute_list_quotes() {
        let attrs = parse_attributes(r#"METHOD=AES-128,URI="a,b=c",IV=0x01"#);
        assert_eq!(attribute(&attrs, "METHOD"), Some("AES-128"));
        assert_eq!(attribute(&attrs, "URI"), Some("a,b=c"));
        assert_eq!(attribute(&attrs, "IV"), Some("0x01"));
    }
}
