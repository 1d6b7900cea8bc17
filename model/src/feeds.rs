//! Facilities for pulling signals from upstream feeds.

use anyhow::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

mod client;
mod local;

pub use client::{Client, Endpoints};
pub use local::LocalClient;

/// A source of market, activity and headline data.
#[async_trait]
pub trait Feeds: Send + Sync {
    /// The current USD price of each tracked [`Coin`].
    ///
    /// A coin missing from the upstream payload is reported with a price of 0.
    async fn prices(&self) -> Result<Vec<(Coin, f64)>, Error>;

    /// Daily edit counts across all Wikimedia projects, oldest first, at most 10.
    async fn wiki_edits(&self) -> Result<Vec<f64>, Error>;

    /// Front page stories on Hacker News.
    async fn hacker_news(&self) -> Result<Vec<Headline>, Error>;

    /// Top posts of the day in r/technology.
    async fn reddit(&self) -> Result<Vec<Headline>, Error>;

    /// Top English headlines from NewsAPI.
    async fn news_api(&self, api_key: &str) -> Result<Vec<Headline>, Error>;
}

/// A cryptocurrency whose price is tracked.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Coin {
    Bitcoin,
    Ethereum,
}

/// Where a headline came from.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    EnumString,
    Deserialize,
    Serialize,
)]
pub enum Source {
    HackerNews,
    #[serde(rename = "Reddit/technology")]
    #[strum(serialize = "Reddit/technology")]
    Reddit,
    #[serde(rename = "NewsAPI")]
    #[strum(serialize = "NewsAPI")]
    NewsApi,
}

/// A headline as reported by a feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Headline {
    pub source: Source,
    /// The upstream identifier, if the feed has stable identifiers.
    ///
    /// Headlines with an ID are only reported once; headlines without one are reported every
    /// time they are fetched.
    pub id: Option<String>,
    pub title: String,
}
