use super::{chapter, page, Manga, Settings};
use crate::download::{FsStorage, RetryPolicy};
use crate::int_range::ChapterSelection;
use crate::net::{HttpOptions, HttpTransport, PageCache};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use tracing::info;

/// What to download: a whole title or one chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A title id such as `123bz`.
    Title(String),
    /// A chapter id such as `m123456`.
    Chapter(String),
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = s.trim().trim_matches('/');
        let is_digits = |d: &str| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit());
        match (id.strip_suffix("bz"), id.strip_prefix('m')) {
            (Some(digits), _) if is_digits(digits) => Ok(Target::Title(id.to_string())),
            (_, Some(digits)) if is_digits(digits) => Ok(Target::Chapter(id.to_string())),
            _ => bail!("{s:?} is neither a title id (like 123bz) nor a chapter id (like m123456)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Language {
    /// Simplified chinese
    ZhSim,
    /// Traditional chinese
    ZhTra,
}

impl Language {
    fn cookie_value(self) -> u8 {
        match self {
            Language::ZhSim => 2,
            Language::ZhTra => 1,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct GetManga {
    /// Title id (e.g. 123bz) or chapter id (e.g. m123456)
    pub target: Target,

    /// The base directory downloads are saved under
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Language of the site
    #[arg(short, long, value_enum, default_value = "zh-sim")]
    pub language: Language,

    /// Chapters to download, e.g. `1-5,7,10..`. Defaults to all of them
    #[arg(short, long)]
    pub range: Option<ChapterSelection>,

    /// List the chapters with their index and exit
    #[arg(short, long)]
    pub chapters: bool,

    /// Pages downloaded at the same time
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Attempts per page before giving up
    #[arg(long, default_value_t = 4)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub base_delay_ms: u64,

    #[arg(long, default_value_t = 8000)]
    pub max_delay_ms: u64,

    /// Pause for every worker after the site answers 429
    #[arg(long, default_value_t = 10_000)]
    pub cooldown_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Attempts at fetching and evaluating one batch of image urls
    #[arg(long, default_value_t = 3)]
    pub script_attempts: u32,

    #[arg(long, default_value_t = 300)]
    pub cache_ttl_secs: u64,

    #[arg(long)]
    pub verbose: bool,
}

impl GetManga {
    fn settings(&self) -> Settings {
        Settings {
            concurrency: self.concurrency,
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                rate_limit_cooldown: Duration::from_millis(self.cooldown_ms),
            },
            script_attempts: self.script_attempts,
        }
    }

    /// Resolves the target into a title and its chapters and applies the
    /// chapter range. A chapter target yields a single chapter and ignores
    /// the range.
    pub async fn get(&self) -> Result<Manga> {
        let transport = Arc::new(HttpTransport::new(&HttpOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            language: self.language.cookie_value(),
            user_agent: None,
        })?);
        let cache = PageCache::new(Duration::from_secs(self.cache_ttl_secs));

        let (title, chapters, single_chapter) = match &self.target {
            Target::Title(id) => {
                let catalogue = chapter::fetch_catalogue(&*transport, id, Some(&cache))
                    .await
                    .with_context(|| format!("Could not read the chapter list of {id}"))?;
                (catalogue.title, catalogue.chapters, false)
            }
            Target::Chapter(id) => {
                let (title, chapter) = page::resolve_chapter(&*transport, id, Some(&cache))
                    .await
                    .with_context(|| format!("Could not read chapter {id}"))?;
                (title, vec![chapter], true)
            }
        };

        let selected = match (&self.range, single_chapter) {
            (Some(range), false) => range.indices(chapters.len()),
            _ => (0..chapters.len()).collect(),
        };
        info!(
            "{}: {} of {} chapters selected",
            title.name,
            selected.len(),
            chapters.len()
        );

        Ok(Manga::new(
            title,
            chapters,
            selected,
            single_chapter,
            transport,
            Arc::new(FsStorage::new(&self.output)),
            cache,
            self.settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_recognised_by_shape() -> Result<()> {
        assert_eq!("123bz".parse::<Target>()?, Target::Title("123bz".into()));
        assert_eq!("/m4567/".parse::<Target>()?, Target::Chapter("m4567".into()));
        assert!("bz".parse::<Target>().is_err());
        assert!("m".parse::<Target>().is_err());
        assert!("https://example.com".parse::<Target>().is_err());
        assert!("12ab".parse::<Target>().is_err());
        Ok(())
    }

    #[test]
    fn flags_have_defaults() -> Result<()> {
        let args = GetManga::try_parse_from(["mangabz-dl", "77bz"])?;
        assert_eq!(args.target, Target::Title("77bz".into()));
        assert_eq!(args.output, PathBuf::from("."));
        assert_eq!(args.language, Language::ZhSim);
        assert!(args.range.is_none());
        assert!(!args.chapters);
        assert_eq!(args.settings().retry, RetryPolicy::default());
        assert_eq!(args.settings().concurrency, 4);
        assert_eq!(args.settings().script_attempts, 3);
        Ok(())
    }

    #[test]
    fn range_and_language_parse() -> Result<()> {
        let args = GetManga::try_parse_from([
            "mangabz-dl",
            "m99",
            "-l",
            "zh-tra",
            "-r",
            "2-3,9",
            "-o",
            "/tmp/manga",
        ])?;
        assert_eq!(args.language.cookie_value(), 1);
        assert_eq!(args.range.map(|r| r.indices(10)), Some(vec![1, 2, 8]));
        assert_eq!(args.output, PathBuf::from("/tmp/manga"));
        Ok(())
    }

    #[test]
    fn bad_range_is_rejected() {
        assert!(GetManga::try_parse_from(["mangabz-dl", "77bz", "-r", "1-x"]).is_err());
    }
}
