use crate::download::{
    DownloadManager, DownloadResult, DownloadTask, FsStorage, Outcome, Progress, RetryPolicy,
};
use crate::net::{HttpTransport, PageCache, Transport};
use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use std::{
    io::{IsTerminal, Write},
    process::{Command, Stdio},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod chapter;
pub mod get;
pub mod page;

use page::PageResolver;

pub const BASE_URL: &str = "https://mangabz.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Title {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub id: String,
    /// Position in reading order, starting at 1.
    pub ordinal: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    /// 0-based position in the chapter.
    pub index: usize,
    pub url: String,
    pub ext: String,
}

/// Knobs for one run, filled from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub script_attempts: u32,
}

/// Replaces characters that are not allowed in file names.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Storage key of a page, pages numbered from 1 and padded to the width of
/// the page count.
pub fn page_key(dir: &str, page: &PageDescriptor, page_count: usize) -> String {
    let width = page_count.max(1).to_string().len();
    format!("{dir}{:0width$}.{}", page.index + 1, page.ext, width = width)
}

/// Chapters that could not be finished.
#[derive(Debug, Default)]
pub struct Report {
    /// Chapters whose page list could not be resolved, with the reason.
    pub unresolved: Vec<(ChapterRef, String)>,
    /// Pages that failed, grouped by chapter.
    pub failed: Vec<(ChapterRef, Vec<DownloadResult>)>,
    pub cancelled: bool,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty() && self.failed.is_empty() && !self.cancelled
    }

    pub fn log_summary(&self) {
        for (chapter, reason) in &self.unresolved {
            error!("{} ({}) could not be resolved: {reason}", chapter.name, chapter.id);
        }
        for (chapter, pages) in &self.failed {
            let listed = describe_failures(pages);
            error!(
                "{} is missing {} pages: {}",
                chapter.name,
                listed.len(),
                listed.join(", ")
            );
        }
        if self.cancelled {
            warn!("download was cancelled before finishing");
        }
    }
}

/// `page N: reason` for every failed result.
fn describe_failures(results: &[DownloadResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Failed(reason) => {
                Some(format!("page {}: {reason}", r.task.descriptor.index + 1))
            }
            Outcome::Success { .. } => None,
        })
        .collect()
}

impl Progress for ProgressBar {
    fn on_complete(&self, index: usize, outcome: &Outcome) {
        if let Outcome::Failed(reason) = outcome {
            self.set_message(format!("page {} failed: {reason}", index + 1));
        }
        self.inc(1);
    }
}

/// A resolved title and the chapters picked for download.
pub struct Manga<T: ?Sized = HttpTransport> {
    pub title: Title,
    pub chapters: Vec<ChapterRef>,
    pub selected: Vec<usize>,
    /// A chapter id was given directly, its pages go straight into the title
    /// directory.
    pub single_chapter: bool,
    transport: Arc<T>,
    storage: Arc<FsStorage>,
    cache: PageCache,
    settings: Settings,
}

/// Sends `text` through `$PAGER` (or `less`), falling back to plain stdout.
fn page_output(text: &str) {
    if std::io::stdout().is_terminal() {
        let pager = std::env::var("PAGER")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| "less".to_string());
        let mut parts = pager.split_whitespace();
        if let Some(program) = parts.next() {
            let spawned = Command::new(program)
                .args(parts)
                .stdin(Stdio::piped())
                .spawn();
            if let Ok(mut child) = spawned {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(text.as_bytes());
                }
                if child.wait().is_ok() {
                    return;
                }
            }
        }
    }
    print!("{text}");
}

impl<T: Transport + ?Sized> Manga<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: Title,
        chapters: Vec<ChapterRef>,
        selected: Vec<usize>,
        single_chapter: bool,
        transport: Arc<T>,
        storage: Arc<FsStorage>,
        cache: PageCache,
        settings: Settings,
    ) -> Self {
        Self {
            title,
            chapters,
            selected,
            single_chapter,
            transport,
            storage,
            cache,
            settings,
        }
    }

    /// One `index: name (id)` line per chapter.
    pub fn chapter_listing(&self) -> String {
        let width = self.chapters.len().to_string().len();
        self.chapters
            .iter()
            .enumerate()
            .map(|(n, chapter)| {
                format!("{:width$}: {} ({})\n", n + 1, chapter.name, chapter.id, width = width)
            })
            .collect()
    }

    /// Prints the chapter listing, through a pager when stdout is a terminal.
    pub fn print_chapters(&self) {
        page_output(&self.chapter_listing());
    }

    fn chapter_dir(&self, chapter: &ChapterRef) -> String {
        if self.single_chapter {
            format!("{}/", sanitize(&self.title.name))
        } else {
            format!("{}/{}/", sanitize(&self.title.name), sanitize(&chapter.name))
        }
    }

    /// Downloads the selected chapters one after another. A chapter that
    /// cannot be resolved is skipped; failed pages are collected in the
    /// returned report.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<Report> {
        let resolver = PageResolver::new(
            &*self.transport,
            Some(&self.cache),
            self.settings.script_attempts,
        );
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_str(&format!("{BASE_URL}/"))?);
        let manager = DownloadManager::new(
            self.transport.clone(),
            self.storage.clone(),
            self.settings.concurrency,
            self.settings.retry.clone(),
        )
        .with_headers(headers);

        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
        )?;
        let multi_bar = MultiProgress::new();
        let mut report = Report::default();

        for chapter in self.selected.iter().filter_map(|&i| self.chapters.get(i)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            info!("Downloading {:?}...", chapter.name);

            let pages = match resolver.resolve_pages(chapter).await {
                Ok(pages) => pages,
                Err(e) => {
                    error!("skipping {}: {e}", chapter.name);
                    report.unresolved.push((chapter.clone(), e.to_string()));
                    continue;
                }
            };

            let dir = self.chapter_dir(chapter);
            let page_count = pages.len();
            let mut tasks = Vec::with_capacity(page_count);
            for page in pages {
                let key = page_key(&dir, &page, page_count);
                if self.storage.existing_len(&key).await.is_some_and(|len| len > 0) {
                    continue;
                }
                tasks.push(DownloadTask::new(page, key));
            }
            if tasks.len() < page_count {
                info!(
                    "{} of {} pages already on disk",
                    page_count - tasks.len(),
                    page_count
                );
            }

            let bar = multi_bar.add(
                ProgressBar::new(tasks.len() as u64)
                    .with_message(chapter.name.clone())
                    .with_style(style.clone()),
            );
            let results = manager.download_all(tasks, cancel, &bar).await;
            bar.finish_and_clear();

            let failed: Vec<DownloadResult> =
                results.into_iter().filter(|r| !r.is_success()).collect();
            if failed.is_empty() {
                info!("{} done", chapter.name);
            } else {
                warn!("{}: {} pages failed", chapter.name, failed.len());
                report.failed.push((chapter.clone(), failed));
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
        }
        Ok(report)
    }
}
