use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{info, warn};

pub const EXTERNAL_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Case-insensitive substring blocklist for autonomous posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NgWordFilter {
    words: BTreeSet<String>,
}

impl NgWordFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        filter.extend(words);
        filter
    }

    /// Adds words, returning how many were new.
    pub fn extend<I, S>(&mut self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.words.len();
        self.words.extend(
            words
                .into_iter()
                .map(|word| word.as_ref().trim().to_lowercase())
                .filter(|word| !word.is_empty()),
        );
        self.words.len() - before
    }

    pub fn contains_ng_word(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.words.iter().any(|word| text.contains(word.as_str()))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// One word per line; blank lines and `#` comments are skipped.
pub fn parse_word_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Builds the filter from configured words plus every reachable external
/// list. Unreachable lists are logged and skipped.
pub async fn build_ng_word_filter(configured: &[String], urls: &[String]) -> NgWordFilter {
    let mut filter = NgWordFilter::new(configured);
    if urls.is_empty() {
        return filter;
    }
    let client = match reqwest::Client::builder()
        .timeout(EXTERNAL_LIST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            warn!(error = %error, "failed to build http client for ng word lists");
            return filter;
        }
    };
    for url in urls {
        match fetch_word_list(&client, url).await {
            Ok(words) => {
                let added = filter.extend(words);
                info!(url = %url, added, total = filter.len(), "loaded external ng word list");
            }
            Err(error) => warn!(url = %url, error = %error, "failed to load external ng word list"),
        }
    }
    filter
}

async fn fetch_word_list(client: &reqwest::Client, url: &str) -> Result<Vec<String>, reqwest::Error> {
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_word_list(&body))
}
