//! Content-type admission
//!
//! Types are sniffed from the first bytes of a part. The file name is only
//! consulted for empty parts, where there is nothing to sniff.

/// Content types accepted when nothing else is configured
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/octet-stream",
    "image/jpeg",
    "application/zip",
    "application/pdf",
    "video/avi",
    "audio/mpeg",
    "application/x-gzip",
    "text/plain",
];

/// Decides whether a part may be stored, from its name and first bytes
pub trait ContentGate: Send + Sync {
    /// Content type detected for the part
    fn detect(&self, file_name: &str, prefix: &[u8]) -> String;

    fn is_allowed(&self, content_type: &str) -> bool;
}

/// Case-insensitive allow-list over sniffed content types
#[derive(Debug, Clone)]
pub struct AllowList {
    allowed: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_CONTENT_TYPES.iter().copied())
    }
}

impl ContentGate for AllowList {
    fn detect(&self, file_name: &str, prefix: &[u8]) -> String {
        if prefix.is_empty() {
            return mime_guess::from_path(file_name).first().map_or_else(
                || "text/plain".to_string(),
                |mime| mime.essence_str().to_string(),
            );
        }
        sniff(prefix).to_string()
    }

    fn is_allowed(&self, content_type: &str) -> bool {
        self.allowed
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
    }
}

/// Tags that mark a prefix as HTML when followed by a space or `>`
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Fixed signatures checked at offset 0
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xEF\xBB\xBF", "text/plain"),
    (b"\xFE\xFF", "text/plain"),
    (b"\xFF\xFE", "text/plain"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\r\n\x1A\n", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"BM", "image/bmp"),
    (b"ID3", "audio/mpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1A\x07", "application/x-rar-compressed"),
    (b"\x00asm", "application/wasm"),
];

/// RIFF containers, told apart by the form type at offset 8
const RIFF_FORMS: &[(&[u8], &str)] = &[
    (b"AVI ", "video/avi"),
    (b"WAVE", "audio/wave"),
    (b"WEBP", "image/webp"),
];

/// Content type of a non-empty prefix, from its leading bytes
pub fn sniff(prefix: &[u8]) -> &'static str {
    let markup = trim_leading_whitespace(prefix);
    if HTML_TAGS.iter().any(|tag| starts_with_tag(markup, tag)) {
        return "text/html";
    }
    if markup.starts_with(b"<?xml") {
        return "text/xml";
    }

    let signature = SIGNATURES.iter().find(|(magic, _)| prefix.starts_with(magic));
    if let Some((_, content_type)) = signature {
        return *content_type;
    }

    if prefix.len() >= 12 && prefix.starts_with(b"RIFF") {
        let form = &prefix[8..12];
        if let Some((_, content_type)) = RIFF_FORMS.iter().find(|(tag, _)| form == *tag) {
            return *content_type;
        }
    }

    if prefix.len() >= 8 && &prefix[4..8] == b"ftyp" {
        return "video/mp4";
    }

    // MPEG audio frame sync without an ID3 header
    if prefix.len() >= 2 && prefix[0] == 0xFF && prefix[1] & 0xE0 == 0xE0 {
        return "audio/mpeg";
    }

    if prefix.iter().any(|&b| is_binary_byte(b)) {
        "application/octet-stream"
    } else {
        "text/plain"
    }
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|&b| !matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn starts_with_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() <= tag.len() || !data[..tag.len()].eq_ignore_ascii_case(tag) {
        return false;
    }
    matches!(data[tag.len()], b' ' | b'>')
}

/// Control bytes that never appear in text
fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
