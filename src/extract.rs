//! Metadata extraction from raw document content.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{error::ExtractError, types::NoteMetadata};

/// Turns the raw bytes of a document into its metadata record.
///
/// Implementations may fail on unreadable or corrupt content; the ingest
/// pool treats a failure as a deletion of the node.
pub trait MetadataExtractor: Send + Sync {
   fn extract(
      &self,
      path: &str,
      raw: &[u8],
      modified: Option<DateTime<Utc>>,
   ) -> Result<NoteMetadata, ExtractError>;
}

static HEADING_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+?)\s*#*\s*$").expect("heading regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"(?:^|\s)#([A-Za-z][\w/-]*)").expect("tag regex")
});
static LINK_RE: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"\[\[([^\]|#]+)(?:[#|][^\]]*)?\]\]").expect("link regex"));

/// Markdown extractor: front-matter title and tags, first heading, inline
/// `#tags` and `[[wikilinks]]`. Non-markdown files only get size and mtime.
#[derive(Debug, Clone)]
pub struct MarkdownExtractor {
   max_bytes: u64,
}

impl Default for MarkdownExtractor {
   fn default() -> Self {
      Self { max_bytes: 8 * 1024 * 1024 }
   }
}

impl MarkdownExtractor {
   pub const fn new(max_bytes: u64) -> Self {
      Self { max_bytes }
   }

   fn is_markdown(path: &str) -> bool {
      let lower = path.to_ascii_lowercase();
      lower.ends_with(".md") || lower.ends_with(".markdown")
   }
}

impl MetadataExtractor for MarkdownExtractor {
   fn extract(
      &self,
      path: &str,
      raw: &[u8],
      modified: Option<DateTime<Utc>>,
   ) -> Result<NoteMetadata, ExtractError> {
      let size = raw.len() as u64;
      if size > self.max_bytes {
         return Err(ExtractError::TooLarge { path: path.to_string(), size });
      }

      let mut meta = NoteMetadata { size, modified, ..NoteMetadata::default() };
      if !Self::is_markdown(path) {
         return Ok(meta);
      }

      let text =
         std::str::from_utf8(raw).map_err(|_| ExtractError::NotUtf8 { path: path.to_string() })?;
      let (front, body) = split_front_matter(path, text)?;

      if let Some(front) = front {
         for line in front.lines() {
            let Some((key, value)) = line.split_once(':') else {
               continue;
            };
            let value = value.trim();
            match key.trim() {
               "title" if !value.is_empty() => {
                  meta.title = Some(value.trim_matches(['"', '\'']).to_string());
               },
               "tags" => meta.tags.extend(parse_inline_list(value)),
               _ => {},
            }
         }
      }

      if meta.title.is_none() {
         meta.title = HEADING_RE
            .captures(body)
            .map(|c| c[1].trim().to_string());
      }

      for cap in TAG_RE.captures_iter(body) {
         push_unique(&mut meta.tags, &cap[1]);
      }
      for cap in LINK_RE.captures_iter(body) {
         push_unique(&mut meta.links, cap[1].trim());
      }

      Ok(meta)
   }
}

fn split_front_matter<'a>(
   path: &str,
   text: &'a str,
) -> Result<(Option<&'a str>, &'a str), ExtractError> {
   let Some(rest) = text
      .strip_prefix("---\n")
      .or_else(|| text.strip_prefix("---\r\n"))
   else {
      return Ok((None, text));
   };

   let mut offset = 0;
   for line in rest.split_inclusive('\n') {
      if line.trim_end() == "---" {
         return Ok((Some(&rest[..offset]), &rest[offset + line.len()..]));
      }
      offset += line.len();
   }
   Err(ExtractError::UnterminatedFrontMatter { path: path.to_string() })
}

fn parse_inline_list(value: &str) -> Vec<String> {
   value
      .trim_start_matches('[')
      .trim_end_matches(']')
      .split(',')
      .map(|t| t.trim().trim_matches(['"', '\'']).trim_start_matches('#'))
      .filter(|t| !t.is_empty())
      .map(str::to_string)
      .collect()
}

fn push_unique(list: &mut Vec<String>, value: &str) {
   if !list.iter().any(|v| v == value) {
      list.push(value.to_string());
   }
}
