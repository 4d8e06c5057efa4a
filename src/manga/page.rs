//! Turning a chapter into its ordered list of image urls.
//!
//! The viewer page only carries a handful of `var MANGABZ_*` assignments.
//! The image urls come from `chapterimage.ashx`, which answers with a packed
//! script that has to be run to produce them, a few pages per request.

use super::{ChapterRef, PageDescriptor, Title, BASE_URL};
use crate::error::{ParseError, Result};
use crate::net::{fetch_text, PageCache, Request, Transport};
use crate::script;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Marker the viewer page always emits before the variables we need.
pub const VIEWER_MARKER: &str = "var MANGABZ_CID";
pub const DEFAULT_EXT: &str = "jpg";

/// The per-chapter values the image endpoint wants back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerContext {
    pub mid: String,
    pub cid: String,
    pub sign: String,
    pub sign_dt: String,
    pub image_count: usize,
    pub chapter_title: Option<String>,
}

impl ViewerContext {
    fn script_vars(&self) -> [(&'static str, &str); 4] {
        [
            ("COMIC_MID", self.mid.as_str()),
            ("MANGABZ_CID", self.cid.as_str()),
            ("MANGABZ_VIEWSIGN", self.sign.as_str()),
            ("MANGABZ_VIEWSIGN_DT", self.sign_dt.as_str()),
        ]
    }
}

pub fn viewer_url(chapter_id: &str) -> String {
    format!("{}/{}/", BASE_URL, chapter_id)
}

/// Value of `var name = ...;` in inline script, quotes stripped.
pub fn find_var(page: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"var\s+{}\s*=\s*([^;\n]*)"#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(page)
        .and_then(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .trim()
                .trim_matches(|c: char| c == '"' || c == '\'')
                .trim()
                .to_string()
        })
}

fn require_var(page: &str, name: &str) -> Result<String, ParseError> {
    find_var(page, name).ok_or_else(|| ParseError::MissingMarker(format!("var {name}")))
}

pub fn parse_viewer(page: &str) -> Result<ViewerContext, ParseError> {
    if !page.contains(VIEWER_MARKER) {
        return Err(ParseError::MissingMarker(VIEWER_MARKER.into()));
    }
    let count = require_var(page, "MANGABZ_IMAGE_COUNT")?;
    let image_count = count.parse().map_err(|_| ParseError::InvalidValue {
        field: "MANGABZ_IMAGE_COUNT".into(),
        value: count,
    })?;

    Ok(ViewerContext {
        mid: require_var(page, "COMIC_MID")?,
        cid: require_var(page, "MANGABZ_CID")?,
        sign: require_var(page, "MANGABZ_VIEWSIGN")?,
        sign_dt: require_var(page, "MANGABZ_VIEWSIGN_DT")?,
        image_count,
        chapter_title: find_var(page, "MANGABZ_CTITLE").filter(|t| !t.is_empty()),
    })
}

/// Pulls the url list out of what the script produced. Entries are either
/// plain strings or objects with a `url` field.
pub fn normalize_entries(value: Value) -> Result<Vec<String>, ParseError> {
    let invalid = |value: &Value| ParseError::InvalidValue {
        field: "script result".into(),
        value: value.to_string(),
    };
    let entries = match value {
        Value::Array(entries) => entries,
        other => return Err(invalid(&other)),
    };

    entries
        .iter()
        .map(|entry| {
            let raw = match entry {
                Value::String(url) => url.as_str(),
                Value::Object(map) => map
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(entry))?,
                _ => return Err(invalid(entry)),
            };
            let url = if raw.starts_with("//") {
                format!("https:{raw}")
            } else {
                raw.to_string()
            };
            Url::parse(&url).map_err(|_| ParseError::InvalidValue {
                field: "image url".into(),
                value: url.clone(),
            })?;
            Ok(url)
        })
        .collect()
}

fn file_name(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .next_back()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Lower-cased extension of the url's last path segment, `jpg` if there is
/// none.
pub fn ext_from_url(url: &str) -> String {
    file_name(url)
        .and_then(|name| {
            name.rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
        })
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| DEFAULT_EXT.to_string())
}

/// Page number the image host encodes in file names like `12_4567.jpg`.
pub fn declared_page(url: &str) -> Option<usize> {
    let name = file_name(url)?;
    let (page, rest) = name.split_once('_')?;
    if rest.is_empty() || page.is_empty() || !page.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    page.parse().ok()
}

/// Builds descriptors in the order the urls were produced. A url that
/// declares its own page number gets that page, anything else its position.
pub fn to_descriptors(urls: Vec<String>) -> Result<Vec<PageDescriptor>, ParseError> {
    let pages = urls
        .into_iter()
        .enumerate()
        .map(|(position, url)| {
            let index = match declared_page(&url) {
                Some(page) => page.checked_sub(1).ok_or_else(|| {
                    ParseError::InconsistentPageSequence(format!("page number 0 in {url}"))
                })?,
                None => position,
            };
            Ok(PageDescriptor {
                index,
                ext: ext_from_url(&url),
                url,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    check_sequence(&pages)?;
    Ok(pages)
}

/// Indices must run 0..N-1 in order, no gaps and no repeats.
pub fn check_sequence(pages: &[PageDescriptor]) -> Result<(), ParseError> {
    for (expected, page) in pages.iter().enumerate() {
        if page.index != expected {
            return Err(ParseError::InconsistentPageSequence(format!(
                "expected page {} but {} declares page {}",
                expected + 1,
                page.url,
                page.index + 1
            )));
        }
    }
    Ok(())
}

/// Fetches a chapter's viewer for its title, used when a chapter id is given
/// directly instead of a title.
pub async fn resolve_chapter<T: Transport + ?Sized>(
    transport: &T,
    chapter_id: &str,
    cache: Option<&PageCache>,
) -> Result<(Title, ChapterRef)> {
    let html = fetch_text(transport, Request::get(viewer_url(chapter_id)), cache).await?;
    let context = parse_viewer(&html)?;
    let name = context
        .chapter_title
        .ok_or_else(|| ParseError::MissingMarker("var MANGABZ_CTITLE".into()))?;
    Ok((
        Title {
            id: chapter_id.to_string(),
            name: name.clone(),
        },
        ChapterRef {
            id: chapter_id.to_string(),
            ordinal: 1,
            name,
        },
    ))
}

pub struct PageResolver<'a, T: ?Sized> {
    transport: &'a T,
    cache: Option<&'a PageCache>,
    script_attempts: u32,
}

impl<'a, T: Transport + ?Sized> PageResolver<'a, T> {
    pub fn new(transport: &'a T, cache: Option<&'a PageCache>, script_attempts: u32) -> Self {
        Self {
            transport,
            cache,
            script_attempts: script_attempts.max(1),
        }
    }

    /// Every page of `chapter` in reading order.
    pub async fn resolve_pages(&self, chapter: &ChapterRef) -> Result<Vec<PageDescriptor>> {
        let viewer = viewer_url(&chapter.id);
        let html = fetch_text(self.transport, Request::get(&viewer), self.cache).await?;
        let context = parse_viewer(&html)?;
        debug!(chapter = %chapter.name, ?context, "viewer parsed");
        if context.image_count == 0 {
            return Err(ParseError::Empty(format!("image list of {}", chapter.id)).into());
        }

        let mut urls: Vec<String> = Vec::with_capacity(context.image_count);
        while urls.len() < context.image_count {
            let page = urls.len() + 1;
            let batch = self.fetch_batch(&viewer, &context, page).await?;
            if batch.is_empty() {
                return Err(ParseError::InconsistentPageSequence(format!(
                    "no images returned from page {page} of {}",
                    context.image_count
                ))
                .into());
            }
            let wanted = context.image_count - urls.len();
            urls.extend(batch.into_iter().take(wanted));
        }

        let pages = to_descriptors(urls)?;
        info!("{} has {} pages", chapter.name, pages.len());
        Ok(pages)
    }

    /// One request to the image endpoint, evaluated. Evaluation failures are
    /// retried with a fresh request since each answer is packed anew.
    async fn fetch_batch(
        &self,
        viewer: &str,
        context: &ViewerContext,
        page: usize,
    ) -> Result<Vec<String>> {
        let request = Request::get(format!("{viewer}chapterimage.ashx"))
            .query("cid", &context.cid)
            .query("page", page)
            .query("key", "")
            .query("_cid", &context.cid)
            .query("_mid", &context.mid)
            .query("_dt", &context.sign_dt)
            .query("_sign", &context.sign)
            .referer(viewer);

        let mut attempt = 1;
        loop {
            let source = fetch_text(self.transport, request.clone(), None).await?;
            match script::evaluate(&source, &context.script_vars()) {
                Ok(value) => return Ok(normalize_entries(value)?),
                Err(e) if attempt < self.script_attempts => {
                    warn!("evaluating images of page {page} failed ({e}), fetching again");
                    attempt += 1;
                }
                Err(e) => {
                    warn!("giving up on the image script of page {page} after {attempt} attempts");
                    return Err(e.into());
                }
            }
        }
    }
}
