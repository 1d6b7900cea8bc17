//! A feed client which reads from the local file system instead of the upstream APIs.

use super::{
    client::{EditAggregate, Listing, Response, SearchResults, SimplePrice, TopHeadlines},
    Coin, Feeds, Headline,
};
use anyhow::Error;
use async_trait::async_trait;
use std::path::PathBuf;

/// A feed client which reads from the local file system instead of the upstream APIs.
///
/// The directory should contain one file per feed, in the same format the upstream API returns:
///
/// ```text
/// DIR/
///     prices.json
///     wiki_edits.json
///     hacker_news.json
///     reddit.json
///     news_api.json
/// ```
///
/// A missing or malformed file is reported as a fetch failure for that feed only.
#[derive(Clone, Debug)]
pub struct LocalClient {
    root: PathBuf,
}

impl LocalClient {
    /// Open a directory of local feeds.
    pub fn open(root: PathBuf) -> Self {
        Self { root }
    }

    async fn read<T: Response>(&self, feed: &str) -> Result<T::Output, Error> {
        let path = self.root.join(format!("{feed}.json"));
        tracing::debug!("reading local feed {}", path.display());
        let parse = async {
            let bytes = async_std::fs::read(&path).await?;
            Ok::<T, Error>(serde_json::from_slice(&bytes)?)
        };
        parse
            .await
            .map(T::extract)
            .map_err(|err| Error::msg(format!("{} -> {err}", path.display())))
    }
}

#[async_trait]
impl Feeds for LocalClient {
    async fn prices(&self) -> Result<Vec<(Coin, f64)>, Error> {
        self.read::<SimplePrice>("prices").await
    }

    async fn wiki_edits(&self) -> Result<Vec<f64>, Error> {
        self.read::<EditAggregate>("wiki_edits").await
    }

    async fn hacker_news(&self) -> Result<Vec<Headline>, Error> {
        self.read::<SearchResults>("hacker_news").await
    }

    async fn reddit(&self) -> Result<Vec<Headline>, Error> {
        self.read::<Listing>("reddit").await
    }

    async fn news_api(&self, _api_key: &str) -> Result<Vec<Headline>, Error> {
        self.read::<TopHeadlines>("news_api").await
    }
}
