//! The background worker which periodically polls the feeds.

use crate::{
    db::Connection,
    feeds::{Coin, Feeds, Headline, Source},
    state::{self, Incident, IncidentKind, Narrative, Score, State},
    stats::calc_stats,
};
use anyhow::Error;
use async_std::task::sleep;
use clap::Args;
use futures::join;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use strum::IntoEnumIterator;

/// The number of price samples kept per coin.
pub const PRICE_WINDOW: usize = 120;

/// Worker configuration.
#[derive(Clone, Debug, Args)]
#[group(skip)]
pub struct Options {
    /// Seconds to wait between polling cycles.
    #[clap(
        long = "interval",
        env = "WORKER_INTERVAL",
        default_value = "20",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// NewsAPI key. Headlines are only fetched from NewsAPI when this is set.
    #[clap(long, env = "NEWSAPI_KEY")]
    pub newsapi_key: Option<String>,
}

impl Options {
    /// The time to wait between polling cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// The NewsAPI key, if a non-empty one was given.
    pub fn newsapi_key(&self) -> Option<&str> {
        self.newsapi_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Polls the feeds, computes scores, and publishes the results.
pub struct Worker<F> {
    feeds: F,
    conn: Connection,
    state: State,
    newsapi_key: Option<String>,
    prices: BTreeMap<Coin, VecDeque<f64>>,
    seen: HashSet<(Source, String)>,
}

impl<F: Feeds> Worker<F> {
    /// Create a worker which publishes to `state` and persists to `conn`.
    pub fn new(feeds: F, conn: Connection, state: State, newsapi_key: Option<String>) -> Self {
        Self {
            feeds,
            conn,
            state,
            newsapi_key: newsapi_key.filter(|key| !key.is_empty()),
            prices: Coin::iter().map(|coin| (coin, VecDeque::new())).collect(),
            seen: Default::default(),
        }
    }

    /// Poll forever, waiting `interval` between cycles.
    pub async fn run(mut self, interval: Duration) {
        tracing::info!(
            interval = interval.as_secs(),
            newsapi = self.newsapi_key.is_some(),
            "worker started"
        );
        loop {
            let now = state::now();
            if let Err(err) = self.tick(now).await {
                tracing::error!("polling cycle failed: {err:#}");
                self.incident(IncidentKind::LoopError, err.to_string(), now)
                    .await;
            }
            sleep(interval).await;
        }
    }

    /// Run a single polling cycle, stamping everything it produces with time `now`.
    ///
    /// Failures to fetch individual feeds are recorded as incidents and do not fail the cycle. An
    /// error is returned only if the results could not be persisted.
    pub async fn tick(&mut self, now: f64) -> Result<(), Error> {
        let news = async {
            match &self.newsapi_key {
                Some(key) => Some(self.feeds.news_api(key).await),
                None => None,
            }
        };
        let (prices, wiki, hn, reddit, news) = join!(
            self.feeds.prices(),
            self.feeds.wiki_edits(),
            self.feeds.hacker_news(),
            self.feeds.reddit(),
            news,
        );

        let prices = self.check(prices, now).await;
        let wiki = self.check(wiki, now).await.unwrap_or_default();
        let hn = self.check(hn, now).await.unwrap_or_default();
        let reddit = self.check(reddit, now).await.unwrap_or_default();
        let news = match news {
            Some(news) => self.check(news, now).await.unwrap_or_default(),
            None => vec![],
        };

        for (coin, price) in prices.into_iter().flatten() {
            let series = self.prices.entry(coin).or_default();
            series.push_back(price);
            while series.len() > PRICE_WINDOW {
                series.pop_front();
            }
        }

        let narratives = hn
            .into_iter()
            .chain(reddit)
            .chain(news)
            .filter(|headline| self.is_new(headline))
            .map(|headline| Narrative {
                title: headline.title,
                source: headline.source,
                t: now,
            })
            .collect::<Vec<_>>();

        let mut scores = self
            .prices
            .iter()
            .map(|(coin, series)| {
                let series = series.iter().copied().collect::<Vec<_>>();
                score(coin.to_string(), &series, now)
            })
            .collect::<Vec<_>>();
        if !wiki.is_empty() {
            scores.push(score("wikipedia_edits".into(), &wiki, now));
        }

        self.conn.insert_cycle(&scores, &narratives).await?;
        tracing::info!(
            scores = scores.len(),
            narratives = narratives.len(),
            "polling cycle complete"
        );

        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.state.push_scores(scores).await;
        if !narratives.is_empty() {
            self.state.push_narratives(narratives).await;
        }
        Ok(())
    }

    /// Has this headline not been reported before?
    ///
    /// Headlines without an upstream ID are always considered new.
    fn is_new(&mut self, headline: &Headline) -> bool {
        match &headline.id {
            Some(id) => self.seen.insert((headline.source, id.clone())),
            None => true,
        }
    }

    /// Unwrap the result of a fetch, recording an incident on failure.
    async fn check<T>(&self, res: Result<T, Error>, now: f64) -> Option<T> {
        match res {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!("fetch failed: {err:#}");
                self.incident(IncidentKind::FetchError, err.to_string(), now)
                    .await;
                None
            }
        }
    }

    /// Record an incident in the database and the live state.
    async fn incident(&self, kind: IncidentKind, message: String, t: f64) {
        let incident = Incident { kind, message, t };
        if let Err(err) = self.conn.insert_incident(&incident).await {
            tracing::error!("unable to persist incident {incident:?}: {err:#}");
        }
        self.state.push_incident(incident).await;
    }
}

fn score(name: String, series: &[f64], ts: f64) -> Score {
    let stats = calc_stats(series);
    Score {
        name,
        score: stats.score,
        velocity: stats.velocity,
        trust: stats.trust,
        ts,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        db::test::{drop_table, scratch},
        feeds::LocalClient,
        state::{Update, MAX_INCIDENTS, MAX_NARRATIVES},
    };
    use async_std::future::timeout;
    use clap::Parser;
    use serial_test::serial;
    use std::env;
    use std::path::{Path, PathBuf};

    fn feeds_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .join("test/feeds")
    }

    fn fixtures() -> LocalClient {
        LocalClient::open(feeds_dir())
    }

    #[derive(Debug, Parser)]
    struct Cli {
        #[clap(flatten)]
        worker: Options,
    }

    #[test]
    #[serial]
    fn test_options() {
        let opt = Cli::try_parse_from(["submind"]).unwrap().worker;
        assert_eq!(opt.interval(), Duration::from_secs(20));

        let opt = Cli::try_parse_from(["submind", "--interval", "5", "--newsapi-key", "abc"])
            .unwrap()
            .worker;
        assert_eq!(opt.interval(), Duration::from_secs(5));
        assert_eq!(opt.newsapi_key(), Some("abc"));

        let opt = Cli::try_parse_from(["submind", "--newsapi-key", ""])
            .unwrap()
            .worker;
        assert_eq!(opt.newsapi_key(), None);

        Cli::try_parse_from(["submind", "--interval", "0"]).unwrap_err();
    }

    #[test]
    #[serial]
    fn test_options_from_env() {
        env::set_var("WORKER_INTERVAL", "7");
        env::set_var("NEWSAPI_KEY", "k");
        let opt = Cli::try_parse_from(["submind"]).unwrap().worker;
        assert_eq!(opt.interval(), Duration::from_secs(7));
        assert_eq!(opt.newsapi_key(), Some("k"));

        // Flags take precedence over the environment.
        let opt = Cli::try_parse_from(["submind", "--interval", "3"])
            .unwrap()
            .worker;
        assert_eq!(opt.interval(), Duration::from_secs(3));

        env::set_var("NEWSAPI_KEY", "");
        let opt = Cli::try_parse_from(["submind"]).unwrap().worker;
        assert_eq!(opt.newsapi_key(), None);

        env::set_var("WORKER_INTERVAL", "0");
        let res = Cli::try_parse_from(["submind"]);

        env::remove_var("WORKER_INTERVAL");
        env::remove_var("NEWSAPI_KEY");
        res.unwrap_err();

        let opt = Cli::try_parse_from(["submind"]).unwrap().worker;
        assert_eq!(opt.interval(), Duration::from_secs(20));
        assert_eq!(opt.newsapi_key(), None);
    }

    #[async_std::test]
    async fn test_tick() {
        crate::init_logging();

        let (_dir, conn) = scratch().await;
        let state = State::new();
        let updates = state.subscribe().await;
        let mut worker = Worker::new(fixtures(), conn.clone(), state.clone(), None);
        worker.tick(100.0).await.unwrap();

        let expected_scores = vec![
            Score {
                name: "bitcoin".into(),
                score: 65000.0,
                velocity: 0.0,
                trust: 1.0,
                ts: 100.0,
            },
            Score {
                name: "ethereum".into(),
                score: 3200.5,
                velocity: 0.0,
                trust: 1.0,
                ts: 100.0,
            },
            Score {
                name: "wikipedia_edits".into(),
                score: 115.0,
                velocity: 10.0,
                trust: 0.082,
                ts: 100.0,
            },
        ];
        assert_eq!(state.scores().await, expected_scores);
        assert_eq!(conn.latest_scores().await.unwrap(), expected_scores);

        let narratives = state.narratives(usize::MAX).await;
        assert_eq!(
            narratives
                .iter()
                .map(|n| (n.source, n.title.as_str()))
                .collect::<Vec<_>>(),
            [
                (Source::HackerNews, "Show HN: A tiny SQLite-backed job queue"),
                (Source::HackerNews, "Ask HN: Which async runtime do you use?"),
                (Source::Reddit, "Chip export rules tighten again"),
                (Source::Reddit, "Open-source model tops coding benchmark"),
            ]
        );
        assert!(narratives.iter().all(|n| n.t == 100.0));
        assert_eq!(conn.recent_narratives(50).await.unwrap(), narratives);
        assert!(state.incidents(usize::MAX).await.is_empty());

        assert_eq!(
            updates.recv().await.unwrap(),
            Update::Scores {
                scores: expected_scores
            }
        );
        assert_eq!(
            updates.recv().await.unwrap(),
            Update::Narratives { narratives }
        );
    }

    #[async_std::test]
    async fn test_headlines_are_deduplicated() {
        let (_dir, conn) = scratch().await;
        let state = State::new();
        let mut worker = Worker::new(fixtures(), conn.clone(), state.clone(), None);
        worker.tick(1.0).await.unwrap();
        worker.tick(2.0).await.unwrap();

        assert_eq!(state.narratives(usize::MAX).await.len(), 4);
        assert_eq!(conn.recent_narratives(50).await.unwrap().len(), 4);
        assert_eq!(worker.prices[&Coin::Bitcoin].len(), 2);

        // Scores are recomputed every cycle.
        assert!(state.scores().await.iter().all(|score| score.ts == 2.0));
    }

    #[async_std::test]
    async fn test_news_api() {
        let (_dir, conn) = scratch().await;
        let state = State::new();
        let mut worker = Worker::new(fixtures(), conn, state.clone(), Some("key".into()));
        worker.tick(1.0).await.unwrap();

        let narratives = state.narratives(usize::MAX).await;
        let news = narratives
            .iter()
            .filter(|n| n.source == Source::NewsApi)
            .map(|n| n.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            news,
            [
                "Markets rally after rate decision",
                "Storm warning issued for the coast"
            ]
        );
        assert_eq!(narratives.len(), 6);

        // NewsAPI headlines have no IDs, so they are reported again on every cycle.
        worker.tick(2.0).await.unwrap();
        assert_eq!(state.narratives(usize::MAX).await.len(), 8);
    }

    #[async_std::test]
    async fn test_fetch_failures() {
        let (_dir, conn) = scratch().await;
        let feeds = tempfile::tempdir().unwrap();
        std::fs::copy(
            feeds_dir().join("reddit.json"),
            feeds.path().join("reddit.json"),
        )
        .unwrap();

        let state = State::new();
        let mut worker = Worker::new(
            LocalClient::open(feeds.path().into()),
            conn.clone(),
            state.clone(),
            Some(String::new()),
        );
        worker.tick(7.0).await.unwrap();

        // Prices, wiki and HN failed; NewsAPI is disabled by the empty key.
        let incidents = state.incidents(usize::MAX).await;
        assert_eq!(incidents.len(), 3);
        assert!(incidents
            .iter()
            .all(|incident| incident.kind == IncidentKind::FetchError && incident.t == 7.0));
        assert_eq!(conn.recent_incidents(10).await.unwrap(), incidents);

        // Every coin still gets a score; wiki edits do not.
        let scores = state.scores().await;
        assert_eq!(
            scores.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["bitcoin", "ethereum"]
        );
        assert!(scores.iter().all(|s| s.score == 0.0 && s.trust == 0.0));

        assert_eq!(state.narratives(usize::MAX).await.len(), 2);
    }

    #[async_std::test]
    async fn test_hydrate_after_restart() {
        let (_dir, conn) = scratch().await;

        // NewsAPI is enabled but has no fixture, so the cycle records one incident.
        let feeds = tempfile::tempdir().unwrap();
        for feed in ["prices", "wiki_edits", "hacker_news", "reddit"] {
            let file = format!("{feed}.json");
            std::fs::copy(feeds_dir().join(&file), feeds.path().join(&file)).unwrap();
        }
        let state = State::new();
        let mut worker = Worker::new(
            LocalClient::open(feeds.path().into()),
            conn.clone(),
            state.clone(),
            Some("key".into()),
        );
        worker.tick(5.0).await.unwrap();

        let restored = State::hydrate(&conn).await.unwrap();
        let scores = restored.scores().await;
        assert_eq!(
            scores.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["bitcoin", "ethereum", "wikipedia_edits"]
        );
        assert_eq!(scores, state.scores().await);
        assert_eq!(
            restored.narratives(MAX_NARRATIVES).await,
            state.narratives(MAX_NARRATIVES).await
        );
        assert_eq!(restored.narratives(MAX_NARRATIVES).await.len(), 4);

        let incidents = restored.incidents(MAX_INCIDENTS).await;
        assert_eq!(incidents, state.incidents(MAX_INCIDENTS).await);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].kind, IncidentKind::FetchError);
        assert!(incidents[0].message.contains("news_api.json"), "{incidents:?}");
    }

    #[async_std::test]
    async fn test_persistence_failure_does_not_stop_worker() {
        crate::init_logging();

        let (_dir, conn) = scratch().await;
        drop_table(&conn, "scores").await;

        let state = State::new();
        let worker = Worker::new(fixtures(), conn.clone(), state.clone(), None);
        // The worker never returns, so it is cut off after a few cycles.
        timeout(
            Duration::from_millis(2500),
            worker.run(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

        let incidents = state.incidents(MAX_INCIDENTS).await;
        assert!(incidents.len() >= 2, "{incidents:?}");
        for incident in &incidents {
            assert_eq!(incident.kind, IncidentKind::LoopError);
            assert_eq!(
                incident.message.matches("no such table").count(),
                1,
                "{}",
                incident.message
            );
        }
        assert_eq!(conn.recent_incidents(MAX_INCIDENTS).await.unwrap(), incidents);

        // Nothing from the failed cycles is published.
        assert!(state.scores().await.is_empty());
        assert!(state.narratives(MAX_NARRATIVES).await.is_empty());
    }
}
