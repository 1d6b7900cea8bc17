//! HTTP routes.

use anyhow::Error;
use model::{state::State, VERSION};
use serde_json::json;
use std::path::Path;
use tide::{http::mime, sse, Body, Request, Response, Server, StatusCode};

/// The number of narratives and incidents returned by the API.
const PAGE_SIZE: usize = 50;

const INDEX: &str = include_str!("../templates/index.html");

/// Build the HTTP application.
pub fn app(state: State, static_dir: &Path) -> Result<Server<State>, Error> {
    let mut app = tide::with_state(state);
    app.at("/").get(index);
    app.at("/health").get(health);
    app.at("/api/scores").get(scores);
    app.at("/api/narratives").get(narratives);
    app.at("/api/incidents").get(incidents);
    app.at("/stream").get(sse::endpoint(stream));
    if static_dir.is_dir() {
        app.at("/static").serve_dir(static_dir)?;
    } else {
        tracing::warn!(
            "static directory {} not found, static assets will not be served",
            static_dir.display()
        );
    }
    Ok(app)
}

async fn index(_req: Request<State>) -> tide::Result {
    Ok(Response::builder(StatusCode::Ok)
        .body(INDEX.replace("{{ version }}", VERSION))
        .content_type(mime::HTML)
        .build())
}

async fn health(req: Request<State>) -> tide::Result<Body> {
    Body::from_json(&json!({
        "status": "ok",
        "version": VERSION,
        "uptime_sec": req.state().uptime().as_secs(),
    }))
}

async fn scores(req: Request<State>) -> tide::Result<Body> {
    Body::from_json(&json!({ "data": req.state().scores().await }))
}

async fn narratives(req: Request<State>) -> tide::Result<Body> {
    Body::from_json(&json!({ "data": req.state().narratives(PAGE_SIZE).await }))
}

async fn incidents(req: Request<State>) -> tide::Result<Body> {
    Body::from_json(&json!({ "data": req.state().incidents(PAGE_SIZE).await }))
}

/// Stream every update published by the worker as a server-sent `update` event.
async fn stream(req: Request<State>, sender: sse::Sender) -> tide::Result<()> {
    let updates = req.state().subscribe().await;
    tracing::debug!("stream subscriber connected");
    while let Ok(update) = updates.recv().await {
        if let Err(err) = sender
            .send("update", serde_json::to_string(&update)?, None)
            .await
        {
            tracing::debug!("stream subscriber disconnected: {err}");
            break;
        }
    }
    Ok(())
}
