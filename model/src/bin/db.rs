use clap::Parser;
use model::{
    db,
    feeds::{Client, Feeds, LocalClient},
    init_logging,
    state::{self, State},
    worker::Worker,
};
use std::path::PathBuf;

/// Maintain the SubMind database.
#[derive(Parser)]
enum Command {
    /// Perform one-time setup of the database.
    Init {
        #[clap(flatten)]
        db: db::Options,
    },
    /// Run a single polling cycle against the live feeds and persist the results.
    Poll {
        /// NewsAPI key. Headlines are only fetched from NewsAPI when this is set.
        #[clap(long, env = "NEWSAPI_KEY")]
        newsapi_key: Option<String>,

        #[clap(flatten)]
        db: db::Options,
    },
    /// Run a single polling cycle against feeds saved in local storage.
    Read {
        /// The path to the directory containing the local feeds.
        ///
        /// This should be a directory with the structure
        ///
        ///     DIR/
        ///         prices.json
        ///         wiki_edits.json
        ///         hacker_news.json
        ///         reddit.json
        ///         news_api.json
        #[clap(short, long, env = "SUBMIND_FEEDS_DIR", name = "DIR")]
        dir: PathBuf,

        /// NewsAPI key. Enables reading `news_api.json`.
        #[clap(long, env = "NEWSAPI_KEY")]
        newsapi_key: Option<String>,

        #[clap(flatten)]
        db: db::Options,
    },
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();

    match Command::parse() {
        Command::Init { db } => {
            let conn = db.connect().await?;
            db::setup(&conn).await?;
        }
        Command::Poll { newsapi_key, db } => {
            poll(Client::new(), newsapi_key, db).await?;
        }
        Command::Read {
            dir,
            newsapi_key,
            db,
        } => {
            poll(LocalClient::open(dir), newsapi_key, db).await?;
        }
    }

    Ok(())
}

async fn poll<F: Feeds>(
    feeds: F,
    newsapi_key: Option<String>,
    db: db::Options,
) -> Result<(), anyhow::Error> {
    let conn = db.connect().await?;
    db::setup(&conn).await?;

    let state = State::new();
    Worker::new(feeds, conn, state.clone(), newsapi_key)
        .tick(state::now())
        .await?;

    for score in state.scores().await {
        tracing::info!(
            "{}: score {} velocity {} trust {}",
            score.name,
            score.score,
            score.velocity,
            score.trust
        );
    }
    tracing::info!(
        "{} new narratives, {} incidents",
        state.narratives(usize::MAX).await.len(),
        state.incidents(usize::MAX).await.len()
    );
    Ok(())
}
