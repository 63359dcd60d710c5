//! HLS playlist parsing
//!
//! Handles both playlist kinds a live endpoint may serve:
//! - Master playlists (`#EXT-X-STREAM-INF` variants): one rendition per variant
//! - Media playlists (segments only): a single rendition pointing at the
//!   playlist itself, with no advertised dimensions

use std::collections::HashMap;

use url::Url;

use super::Rendition;
use crate::error::{Error, Result};

const STREAM_INF: &str = "#EXT-X-STREAM-INF:";

/// Parse a playlist body into renditions, in manifest order.
///
/// Returns an empty vec for a well-formed playlist that advertises nothing
/// playable; the caller decides that this means `NoRenditionsFound`.
pub fn parse_playlist(content: &str, manifest_url: &Url) -> Result<Vec<Rendition>> {
    let content = content.trim_start_matches('\u{feff}');
    let first = content.lines().map(str::trim).find(|l| !l.is_empty());
    if first.map_or(true, |l| !l.starts_with("#EXTM3U")) {
        return Err(Error::Parse("missing #EXTM3U header".to_string()));
    }

    if content.contains(STREAM_INF) {
        parse_master(content, manifest_url)
    } else if is_media_playlist(content) {
        Ok(vec![Rendition {
            width: 0,
            height: 0,
            bitrate: 0,
            uri: manifest_url.to_string(),
            codecs: None,
            stream_index: None,
        }])
    } else {
        Ok(Vec::new())
    }
}

/// Whether a body that starts with `head` is an HLS playlist.
///
/// `None` while `head` is too short to tell.
pub(crate) fn playlist_prefix(head: &[u8]) -> Option<bool> {
    const MAGIC: &[u8] = b"#EXTM3U";

    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head.iter().position(|b| !b.is_ascii_whitespace())?;
    let head = &head[start..];
    if head.len() < MAGIC.len() {
        return if MAGIC.starts_with(head) { None } else { Some(false) };
    }
    Some(head.starts_with(MAGIC))
}

fn is_media_playlist(content: &str) -> bool {
    content.lines().any(|l| {
        let l = l.trim();
        l.starts_with("#EXTINF:") || l.starts_with("#EXT-X-TARGETDURATION:")
    })
}

fn parse_master(content: &str, manifest_url: &Url) -> Result<Vec<Rendition>> {
    let mut renditions = Vec::new();
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());

    while let Some(line) = lines.next() {
        let Some(rest) = line.strip_prefix(STREAM_INF) else {
            continue;
        };
        let attrs = parse_attributes(rest);

        let uri_line = match lines.next() {
            Some(l) if !l.starts_with('#') => l,
            _ => {
                return Err(Error::Parse(format!(
                    "variant {} has no URI line",
                    renditions.len() + 1
                )))
            }
        };

        let (width, height) = match attrs.get("RESOLUTION") {
            Some(res) => parse_resolution(res)?,
            None => (0, 0),
        };
        let bitrate = match attrs.get("BANDWIDTH") {
            Some(bw) => bw
                .parse()
                .map_err(|_| Error::Parse(format!("invalid BANDWIDTH '{bw}'")))?,
            None => 0,
        };
        let uri = manifest_url
            .join(uri_line)
            .map_err(|e| Error::Parse(format!("invalid variant URI '{uri_line}': {e}")))?;

        renditions.push(Rendition {
            width,
            height,
            bitrate,
            uri: uri.to_string(),
            codecs: attrs.get("CODECS").cloned(),
            stream_index: None,
        });
    }

    Ok(renditions)
}

fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let parsed = value
        .split_once(['x', 'X'])
        .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)));
    parsed.ok_or_else(|| Error::Parse(format!("invalid RESOLUTION '{value}'")))
}

/// Parse an HLS attribute list (`KEY=value,KEY="quoted,value"`).
fn parse_attributes(list: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = list.trim();

    while let Some((key, after)) = rest.split_once('=') {
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            quoted.split_once('"').unwrap_or((quoted, ""))
        } else {
            after.split_once(',').unwrap_or((after, ""))
        };

        attrs.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        rest = remainder.trim_start_matches(',').trim_start();
    }

    attrs
}
