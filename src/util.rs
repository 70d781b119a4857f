use std::sync::LazyLock;

use regex::Regex;

mod byte_stream;

pub use byte_stream::ByteStream;

const FILENAME_LIMIT: usize = 200;
// most filesystems cap a single path component at 255 bytes
const FILENAME_BYTE_LIMIT: usize = 255;

static WHITESPACE_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\s+").expect("hard-coded regex"));

/// Drops characters that are invalid in filenames on common platforms,
/// collapses whitespace runs and caps the length at 200 characters.
pub fn sanitize_filename(name: &str) -> String {
  let stripped: String = name
    .chars()
    .filter(|c| {
      !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
    })
    .collect();
  let collapsed = WHITESPACE_REGEX.replace_all(&stripped, " ");
  collapsed.trim().chars().take(FILENAME_LIMIT).collect()
}

/// `"{title} - {uploader}.{ext}"`, or `"{title}.{ext}"` without an uploader.
/// The stem is shortened until the whole name fits in 255 bytes.
pub fn output_filename(title: &str, uploader: &str, ext: &str) -> String {
  let title = sanitize_filename(title);
  let uploader = sanitize_filename(uploader);
  let mut stem = if uploader.is_empty() {
    title
  } else {
    format!("{title} - {uploader}")
  };

  let budget = FILENAME_BYTE_LIMIT.saturating_sub(ext.len() + 1);
  while stem.len() > budget {
    stem.pop();
  }
  format!("{}.{ext}", stem.trim_end())
}

/// An `attachment` disposition with an ASCII fallback plus the RFC 5987
/// encoded original name.
pub fn content_disposition(filename: &str) -> String {
  let fallback: String = filename
    .chars()
    .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
    .filter(|c| *c != '"' && *c != '\\')
    .collect();
  format!(
    "attachment; filename=\"{}\"; filename*=UTF-8''{}",
    fallback,
    urlencoding::encode(filename)
  )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
  Full,
  // inclusive on both ends
  Partial { start: u64, end: u64 },
  Unsatisfiable,
}

impl ByteRange {
  /// Interprets a single-range `Range` header against a body of `size`
  /// bytes. Malformed or multi-range headers fall back to the full body.
  pub fn parse(header: Option<&str>, size: u64) -> Self {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
      return ByteRange::Full;
    };
    if spec.contains(',') {
      return ByteRange::Full;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
      return ByteRange::Full;
    };

    let (start, end) = (start.trim(), end.trim());
    let range = match (start.is_empty(), end.is_empty()) {
      // bytes=-N: the last N bytes
      (true, false) => match end.parse::<u64>() {
        Ok(0) => return ByteRange::Unsatisfiable,
        Ok(n) => (size.saturating_sub(n), size.saturating_sub(1)),
        Err(_) => return ByteRange::Full,
      },
      (false, true) => match start.parse::<u64>() {
        Ok(s) => (s, size.saturating_sub(1)),
        Err(_) => return ByteRange::Full,
      },
      (false, false) => match (start.parse::<u64>(), end.parse::<u64>()) {
        (Ok(s), Ok(e)) if s <= e => (s, e.min(size.saturating_sub(1))),
        _ => return ByteRange::Full,
      },
      (true, true) => return ByteRange::Full,
    };

    if size == 0 || range.0 >= size {
      return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
      start: range.0,
      end: range.1,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_sanitize_filename() {
    assert_eq!(sanitize_filename("My/Video:Title?"), "MyVideoTitle");
    assert_eq!(sanitize_filename("  a \t\n  b  "), "a b");
    assert_eq!(sanitize_filename(r#"<>:"/\|?*"#), "");
    assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    assert_eq!(sanitize_filename("Ünïcode ok"), "Ünïcode ok");
  }

  #[test]
  fn test_output_filename() {
    assert_eq!(
      output_filename("Never: Gonna?", "Rick", "mp3"),
      "Never Gonna - Rick.mp3"
    );
    assert_eq!(output_filename("Solo", " ", "mp4"), "Solo.mp4");
  }

  #[test]
  fn test_output_filename_fits_byte_limit() {
    let title = "日".repeat(80);
    let name = output_filename(&title, "チャンネル", "mp3");
    assert!(name.len() <= 255, "{} bytes", name.len());
    assert!(name.starts_with(&title));
    assert!(name.ends_with(".mp3"));

    // at most 200 chars per part, but 600 bytes each
    let name = output_filename(&"語".repeat(300), &"語".repeat(300), "webm");
    assert!(name.len() <= 255, "{} bytes", name.len());
    assert!(name.ends_with("語.webm"));

    let short = output_filename("Never: Gonna?", "Rick", "mp3");
    assert_eq!(short, "Never Gonna - Rick.mp3");
  }

  #[test]
  fn test_content_disposition() {
    assert_eq!(
      content_disposition("a b.mp3"),
      "attachment; filename=\"a b.mp3\"; filename*=UTF-8''a%20b.mp3"
    );
    assert_eq!(
      content_disposition("été.mp3"),
      "attachment; filename=\"_t_.mp3\"; filename*=UTF-8''%C3%A9t%C3%A9.mp3"
    );
  }

  #[test]
  fn test_byte_range() {
    assert_eq!(ByteRange::parse(None, 100), ByteRange::Full);
    assert_eq!(ByteRange::parse(Some("items=0-1"), 100), ByteRange::Full);
    assert_eq!(
      ByteRange::parse(Some("bytes=0-9"), 100),
      ByteRange::Partial { start: 0, end: 9 }
    );
    assert_eq!(
      ByteRange::parse(Some("bytes=90-"), 100),
      ByteRange::Partial { start: 90, end: 99 }
    );
    assert_eq!(
      ByteRange::parse(Some("bytes=-10"), 100),
      ByteRange::Partial { start: 90, end: 99 }
    );
    assert_eq!(
      ByteRange::parse(Some("bytes=50-500"), 100),
      ByteRange::Partial { start: 50, end: 99 }
    );
    assert_eq!(
      ByteRange::parse(Some("bytes=100-"), 100),
      ByteRange::Unsatisfiable
    );
    assert_eq!(ByteRange::parse(Some("bytes=0-1,5-6"), 100), ByteRange::Full);
    assert_eq!(ByteRange::parse(Some("bytes=9-2"), 100), ByteRange::Full);
  }
}
