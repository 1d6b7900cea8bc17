//! A feed client backed by the live upstream HTTP APIs.

use super::{Coin, Feeds, Headline, Source};
use anyhow::Error;
use async_std::future::timeout;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::time::Duration;
use strum::IntoEnumIterator;
use surf::Url;

/// How long to wait for any single upstream request.
const TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = "SubMind/1.0";
const REDDIT_USER_AGENT: &str = "SubMind-OneClick/1.0";

/// Query parameters which are never included in error messages.
const SECRET_PARAMS: [&str; 1] = ["apiKey"];

/// Base URLs of the upstream APIs.
///
/// Query parameters are added by the [`Client`], so these should not include a query string.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub coingecko: String,
    pub wikimedia: String,
    pub hacker_news: String,
    pub reddit: String,
    pub news_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            coingecko: "https://api.coingecko.com/api/v3/simple/price".into(),
            wikimedia: "https://wikimedia.org/api/rest_v1/metrics/edit/aggregate/all-projects/all-editor-types/all-page-types/daily/20240101/20240131".into(),
            hacker_news: "https://hn.algolia.com/api/v1/search".into(),
            reddit: "https://www.reddit.com/r/technology/top.json".into(),
            news_api: "https://newsapi.org/v2/top-headlines".into(),
        }
    }
}

/// A feed client which queries the live upstream APIs.
#[derive(Clone, Debug)]
pub struct Client {
    client: surf::Client,
    endpoints: Endpoints,
}

impl Client {
    /// Connect to the public upstream APIs.
    pub fn new() -> Self {
        Self::with_endpoints(Endpoints::default())
    }

    /// Connect to upstream APIs at custom locations.
    pub fn with_endpoints(endpoints: Endpoints) -> Self {
        Self {
            client: surf::Client::new(),
            endpoints,
        }
    }

    async fn get<T: Response>(
        &self,
        url: &str,
        user_agent: &str,
        params: &[(&str, &str)],
    ) -> Result<T::Output, Error> {
        tracing::debug!(url, "feed request");
        let res = timeout(TIMEOUT, self.fetch::<T>(url, user_agent, params))
            .await
            .map_err(Error::from)
            .and_then(|res| res);
        res.map(T::extract)
            .map_err(|err| Error::msg(format!("{} -> {err}", display_url(url, params))))
    }

    async fn fetch<T: Response>(
        &self,
        url: &str,
        user_agent: &str,
        params: &[(&str, &str)],
    ) -> Result<T, Error> {
        let mut res = self
            .client
            .get(url)
            .header("User-Agent", user_agent)
            .query(&params)
            .map_err(Error::msg)?
            .await
            .map_err(Error::msg)?;
        if !res.status().is_success() {
            return Err(Error::msg(format!("HTTP status {}", res.status())));
        }
        res.body_json().await.map_err(Error::msg)
    }
}

/// The URL of a request as it appears in error messages, without any credentials.
fn display_url(url: &str, params: &[(&str, &str)]) -> String {
    let public = params
        .iter()
        .filter(|(name, _)| !SECRET_PARAMS.contains(name))
        .collect::<Vec<_>>();
    match Url::parse(url) {
        Ok(mut parsed) if !public.is_empty() => {
            parsed.query_pairs_mut().extend_pairs(public);
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Feeds for Client {
    async fn prices(&self) -> Result<Vec<(Coin, f64)>, Error> {
        let ids = Coin::iter()
            .map(|coin| coin.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.get::<SimplePrice>(
            &self.endpoints.coingecko,
            USER_AGENT,
            &[("ids", ids.as_str()), ("vs_currencies", "usd")],
        )
        .await
    }

    async fn wiki_edits(&self) -> Result<Vec<f64>, Error> {
        self.get::<EditAggregate>(&self.endpoints.wikimedia, USER_AGENT, &[])
            .await
    }

    async fn hacker_news(&self) -> Result<Vec<Headline>, Error> {
        self.get::<SearchResults>(
            &self.endpoints.hacker_news,
            USER_AGENT,
            &[("tags", "front_page")],
        )
        .await
    }

    async fn reddit(&self) -> Result<Vec<Headline>, Error> {
        self.get::<Listing>(
            &self.endpoints.reddit,
            REDDIT_USER_AGENT,
            &[("t", "day"), ("limit", "10")],
        )
        .await
    }

    async fn news_api(&self, api_key: &str) -> Result<Vec<Headline>, Error> {
        self.get::<TopHeadlines>(
            &self.endpoints.news_api,
            USER_AGENT,
            &[("language", "en"), ("pageSize", "10"), ("apiKey", api_key)],
        )
        .await
    }
}

/// The body of an upstream response.
///
/// Each upstream API has its own response shape. This trait describes how to decode it and how
/// to extract the parts we care about, so that the same decoding can be shared between the live
/// [`Client`] and the [`LocalClient`](super::LocalClient).
pub(super) trait Response: DeserializeOwned + Send + 'static {
    /// The useful contents of the response.
    type Output: Send;

    /// Extract the useful contents of the response.
    fn extract(self) -> Self::Output;
}

/// Response from the CoinGecko `simple/price` endpoint.
///
/// ```json
/// { "bitcoin": { "usd": 65000 }, "ethereum": { "usd": 3200.5 } }
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(transparent)]
pub(super) struct SimplePrice(HashMap<String, Price>);

#[derive(Clone, Debug, Deserialize)]
struct Price {
    #[serde(default)]
    usd: f64,
}

impl Response for SimplePrice {
    type Output = Vec<(Coin, f64)>;

    fn extract(self) -> Self::Output {
        Coin::iter()
            .map(|coin| {
                let price = self.0.get(&coin.to_string()).map(|price| price.usd);
                if price.is_none() {
                    tracing::warn!("no price reported for {coin}");
                }
                (coin, price.unwrap_or_default())
            })
            .collect()
    }
}

/// Response from the Wikimedia edit aggregate endpoint.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct EditAggregate {
    #[serde(default)]
    items: Vec<EditItem>,
}

#[derive(Clone, Debug, Deserialize)]
struct EditItem {
    #[serde(default)]
    results: Vec<EditResult>,
}

#[derive(Clone, Debug, Deserialize)]
struct EditResult {
    #[serde(default)]
    edits: f64,
}

impl Response for EditAggregate {
    type Output = Vec<f64>;

    fn extract(self) -> Self::Output {
        const MAX_SAMPLES: usize = 10;

        let edits = self
            .items
            .into_iter()
            .flat_map(|item| item.results)
            .map(|result| result.edits)
            .collect::<Vec<_>>();
        edits[edits.len().saturating_sub(MAX_SAMPLES)..].to_vec()
    }
}

/// Response from the Algolia Hacker News search endpoint.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct SearchResults {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Clone, Debug, Deserialize)]
struct Hit {
    #[serde(rename = "objectID")]
    object_id: Option<String>,
    title: Option<String>,
    story_title: Option<String>,
}

impl Response for SearchResults {
    type Output = Vec<Headline>;

    fn extract(self) -> Self::Output {
        const MAX_HITS: usize = 15;

        self.hits
            .into_iter()
            .take(MAX_HITS)
            .filter_map(|hit| {
                let title = non_empty(hit.title).or_else(|| non_empty(hit.story_title))?;
                Some(Headline {
                    source: Source::HackerNews,
                    id: Some(non_empty(hit.object_id)?),
                    title,
                })
            })
            .collect()
    }
}

/// Response from a Reddit listing endpoint.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct Listing {
    #[serde(default)]
    data: ListingData,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}

#[derive(Clone, Debug, Deserialize)]
struct Child {
    data: Post,
}

#[derive(Clone, Debug, Deserialize)]
struct Post {
    id: Option<String>,
    title: Option<String>,
}

impl Response for Listing {
    type Output = Vec<Headline>;

    fn extract(self) -> Self::Output {
        self.data
            .children
            .into_iter()
            .filter_map(|child| {
                Some(Headline {
                    source: Source::Reddit,
                    id: Some(non_empty(child.data.id)?),
                    title: non_empty(child.data.title)?,
                })
            })
            .collect()
    }
}

/// Response from the NewsAPI `top-headlines` endpoint.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct TopHeadlines {
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Clone, Debug, Deserialize)]
struct Article {
    title: Option<String>,
}

impl Response for TopHeadlines {
    type Output = Vec<Headline>;

    fn extract(self) -> Self::Output {
        self.articles
            .into_iter()
            .filter_map(|article| {
                Some(Headline {
                    source: Source::NewsApi,
                    id: None,
                    title: non_empty(article.title)?,
                })
            })
            .collect()
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}
