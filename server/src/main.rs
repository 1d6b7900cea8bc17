use anyhow::Error;
use async_std::task::spawn;
use clap::Parser;
use model::{
    db,
    feeds::{Client, Feeds, LocalClient},
    init_logging,
    state::State,
    worker::{self, Worker},
};
use std::path::PathBuf;

mod api;
mod test_runner;

/// Start the SubMind server.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the app should be served.
    #[clap(short, long, env = "PORT", default_value = "10000")]
    port: u16,

    /// Directory of static assets served under `/static`.
    #[clap(long, env = "SUBMIND_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,

    /// Read feeds from DIR instead of the live upstream APIs.
    #[clap(long, env = "SUBMIND_FEEDS_DIR", name = "DIR")]
    feeds_dir: Option<PathBuf>,

    #[clap(flatten)]
    worker: worker::Options,

    #[clap(flatten)]
    db: db::Options,
}

impl Options {
    async fn serve(self) -> Result<(), Error> {
        let conn = self.db.connect().await?;
        db::setup(&conn).await?;
        let state = State::hydrate(&conn).await?;

        match &self.feeds_dir {
            Some(dir) => self.spawn_worker(LocalClient::open(dir.clone()), conn, state.clone()),
            None => self.spawn_worker(Client::new(), conn, state.clone()),
        }

        let app = api::app(state, &self.static_dir)?;
        tracing::info!("listening on port {}", self.port);
        app.listen(format!("0.0.0.0:{}", self.port)).await?;
        Ok(())
    }

    fn spawn_worker<F: Feeds + 'static>(&self, feeds: F, conn: db::Connection, state: State) {
        let worker = Worker::new(
            feeds,
            conn,
            state,
            self.worker.newsapi_key().map(String::from),
        );
        spawn(worker.run(self.worker.interval()));
    }
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    init_logging();
    Options::parse().serve().await
}
