use super::{ChapterRef, Title, BASE_URL};
use crate::error::{ParseError, Result};
use crate::net::{fetch_text, PageCache, Request, Transport};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info};

const TITLE_SELECTOR: &str = "p.detail-info-title";
const LIST_SELECTOR: &str = "#chapterlistload";
const ITEM_SELECTOR: &str = "a.detail-list-form-item";
const ORDER_SELECTOR: &str = "div.detail-list-title a.order";

/// A title together with its chapters in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalogue {
    pub title: Title,
    pub chapters: Vec<ChapterRef>,
}

pub fn title_url(title_id: &str) -> String {
    format!("{}/{}/", BASE_URL, title_id)
}

/// Fetches the title page and parses its chapter list.
pub async fn fetch_catalogue<T: Transport + ?Sized>(
    transport: &T,
    title_id: &str,
    cache: Option<&PageCache>,
) -> Result<Catalogue> {
    let html = fetch_text(transport, Request::get(title_url(title_id)), cache).await?;
    let catalogue = parse_catalogue(&html, title_id)?;
    info!(
        "Found {} chapters for {}",
        catalogue.chapters.len(),
        catalogue.title.name
    );
    Ok(catalogue)
}

/// The chapters of `title_id`, oldest first.
pub async fn list_chapters<T: Transport + ?Sized>(
    transport: &T,
    title_id: &str,
    cache: Option<&PageCache>,
) -> Result<Vec<ChapterRef>> {
    Ok(fetch_catalogue(transport, title_id, cache).await?.chapters)
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|_| ParseError::InvalidValue {
        field: "selector".into(),
        value: css.into(),
    })
}

fn first_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
        .to_string()
}

pub fn parse_catalogue(html: &str, title_id: &str) -> Result<Catalogue, ParseError> {
    let document = Html::parse_document(html);

    let name = document
        .select(&selector(TITLE_SELECTOR)?)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ParseError::MissingElement(TITLE_SELECTOR.into()))?;

    let list = document
        .select(&selector(LIST_SELECTOR)?)
        .next()
        .ok_or_else(|| ParseError::MissingElement(LIST_SELECTOR.into()))?;

    // The site lists newest first unless the order toggle says otherwise.
    let ascending = document
        .select(&selector(ORDER_SELECTOR)?)
        .next()
        .is_some_and(|e| e.text().collect::<String>().trim() == "正序");

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for item in list.select(&selector(ITEM_SELECTOR)?) {
        let href = item.value().attr("href").unwrap_or_default();
        let id = href.trim_matches('/').to_string();
        if id.is_empty() || id.contains('/') {
            return Err(ParseError::InvalidValue {
                field: "chapter href".into(),
                value: href.into(),
            });
        }
        if !seen.insert(id.clone()) {
            return Err(ParseError::Duplicate(id));
        }
        let name = first_text(item);
        debug!(%id, %name, "catalogue entry");
        entries.push((id, name));
    }
    if entries.is_empty() {
        return Err(ParseError::Empty("chapter list".into()));
    }

    let count = entries.len() as u32;
    let mut chapters: Vec<ChapterRef> = entries
        .into_iter()
        .enumerate()
        .map(|(position, (id, name))| ChapterRef {
            id,
            ordinal: if ascending {
                position as u32 + 1
            } else {
                count - position as u32
            },
            name,
        })
        .collect();
    chapters.sort_by_key(|c| c.ordinal);

    Ok(Catalogue {
        title: Title {
            id: title_id.to_string(),
            name,
        },
        chapters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::FakeTransport;

    const PAGE: &str = r#"<html><body>
        <div class="detail-info"><p class="detail-info-title"> 測試漫畫 </p></div>
        <div class="detail-list-title"><a class="order" href="javascript:void(0)">倒序</a></div>
        <div class="detail-list-form-con" id="chapterlistload">
            <a href="/m303/" class="detail-list-form-item">第3話 <span>（20P）</span></a>
            <a href="/m202/" class="detail-list-form-item">第2話 <span>（18P）</span></a>
            <a href="/m101/" class="detail-list-form-item">第1話 <span>（22P）</span></a>
        </div>
    </body></html>"#;

    #[test]
    fn newest_first_listing_is_reversed() -> anyhow::Result<()> {
        let catalogue = parse_catalogue(PAGE, "77bz")?;
        assert_eq!(catalogue.title.name, "測試漫畫");
        assert_eq!(catalogue.title.id, "77bz");
        let ids: Vec<&str> = catalogue.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["m101", "m202", "m303"]);
        let ordinals: Vec<u32> = catalogue.chapters.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(catalogue.chapters[0].name, "第1話");
        Ok(())
    }

    #[test]
    fn ascending_listing_keeps_source_order() -> anyhow::Result<()> {
        let page = PAGE
            .replace("倒序", "正序")
            .replace("/m303/", "/tmp-a/")
            .replace("/m101/", "/m303/")
            .replace("/tmp-a/", "/m101/");
        let catalogue = parse_catalogue(&page, "77bz")?;
        let ids: Vec<&str> = catalogue.chapters.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["m101", "m202", "m303"]);
        Ok(())
    }

    #[test]
    fn missing_list_is_a_parse_error() {
        let page = r#"<p class="detail-info-title">x</p>"#;
        assert_eq!(
            parse_catalogue(page, "1bz"),
            Err(ParseError::MissingElement(LIST_SELECTOR.into()))
        );
    }

    #[test]
    fn missing_title_is_a_parse_error() {
        assert_eq!(
            parse_catalogue("<html></html>", "1bz"),
            Err(ParseError::MissingElement(TITLE_SELECTOR.into()))
        );
    }

    #[test]
    fn duplicate_chapters_are_rejected() {
        let page = PAGE.replace("/m202/", "/m101/");
        assert_eq!(
            parse_catalogue(&page, "77bz"),
            Err(ParseError::Duplicate("m101".into()))
        );
    }

    #[test]
    fn empty_list_is_a_parse_error() {
        let page = r#"<p class="detail-info-title">x</p><div id="chapterlistload"></div>"#;
        assert_eq!(
            parse_catalogue(page, "1bz"),
            Err(ParseError::Empty("chapter list".into()))
        );
    }

    #[test]
    fn ordinals_are_unique_and_sorted_for_any_size() -> anyhow::Result<()> {
        for n in 1..40 {
            let items: String = (0..n)
                .map(|i| format!(r#"<a class="detail-list-form-item" href="/m{i}/">c{i}</a>"#))
                .collect();
            let page = format!(
                r#"<p class="detail-info-title">t</p><div id="chapterlistload">{items}</div>"#
            );
            let chapters = parse_catalogue(&page, "1bz")?.chapters;
            assert_eq!(chapters.len(), n);
            assert!(chapters.windows(2).all(|w| w[0].ordinal < w[1].ordinal));
        }
        Ok(())
    }

    #[tokio::test]
    async fn list_chapters_fetches_title_page() -> anyhow::Result<()> {
        let transport = FakeTransport::new();
        transport.ok("https://mangabz.com/77bz/", PAGE);
        let chapters = list_chapters(&transport, "77bz", None).await?;
        assert_eq!(chapters.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn fetch_failures_are_surfaced() {
        let transport = FakeTransport::new();
        let result = list_chapters(&transport, "missingbz", None).await;
        assert!(matches!(result, Err(crate::error::Error::Fetch(_))));
    }
}
