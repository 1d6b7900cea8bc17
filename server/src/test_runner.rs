#![cfg(test)]

//! This module runs test cases defined in `test/cases`.
//!
//! Each test case consists of two files, named in terms of `<name>`, the name of the test case:
//! * `<name>.path`: the API path to request
//! * `<name>.json`: the expected JSON response
//!
//! This runner will start a server reading from the fixture feeds in `test/feeds`, wait for the
//! worker to complete a polling cycle, then scan the cases directory for all such pairs of files,
//! requesting each path and making sure that the response matches the expected response. Before
//! comparing the expected and actual responses, the test runner will strip any timestamps, to
//! avoid dependency on when the test runs.

use super::Options;
use ansi_term::Color;
use anyhow::Error;
use async_std::{
    future::timeout,
    task::{sleep, spawn},
};
use clap::Parser;
use futures::{future::join_all, AsyncBufReadExt, Stream, StreamExt};
use model::{db, worker, VERSION};
use portpicker::pick_unused_port;
use serde_json::Value;
use std::env;
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use surf::{http::StatusCode, Client};
use tempfile::TempDir;

/// Keys holding timestamps or durations, which are removed before comparing responses.
const VOLATILE_KEYS: [&str; 3] = ["t", "ts", "uptime_sec"];

#[async_std::test]
async fn api_test_cases() -> Result<(), Error> {
    model::init_logging();

    // Discover test cases.
    let test_cases = workspace()
        .join("test/cases")
        .read_dir()?
        .filter_map(|dirent| {
            let path = dirent.unwrap().path();
            if path.extension()?.to_str().unwrap() == "path" {
                Some(TestCase::new(&path).unwrap())
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    assert!(!test_cases.is_empty(), "no test cases found");

    let (_dir, client) = start_server().await?;
    wait_for_worker(&client).await?;

    let results = join_all(test_cases.into_iter().map(|test| test.run(client.clone()))).await;
    for result in &results {
        println!("{}", result);
    }
    if results.iter().any(TestResult::failed) {
        Err(Error::msg(format!("{}", Color::Red.paint("tests failed"))))
    } else {
        println!("All test cases passed.");
        Ok(())
    }
}

#[async_std::test]
async fn stream_updates() -> Result<(), Error> {
    model::init_logging();

    let (_dir, client) = start_server().await?;
    let mut res = client.get("/stream").await.map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Ok);
    let mut lines = res.take_body().into_reader().lines();

    // The worker publishes scores on every cycle, so an update should arrive within a couple of
    // intervals.
    let update = timeout(Duration::from_secs(30), next_event_data(&mut lines)).await??;
    tracing::info!("received update {update}");

    match update["type"].as_str() {
        Some("scores") => assert_eq!(update["scores"].as_array().unwrap().len(), 3),
        Some("narratives") => assert!(!update["narratives"].as_array().unwrap().is_empty()),
        _ => panic!("unexpected update {update}"),
    }
    Ok(())
}

#[async_std::test]
async fn index_page() -> Result<(), Error> {
    model::init_logging();

    let (_dir, client) = start_server().await?;
    let page = client.get("/").recv_string().await.map_err(Error::msg)?;
    assert!(page.contains(&format!("v{VERSION}")), "{page}");

    let mut res = client.get("/static/app.js").await.map_err(Error::msg)?;
    assert_eq!(res.status(), StatusCode::Ok);
    assert!(res
        .body_string()
        .await
        .map_err(Error::msg)?
        .contains("EventSource"));
    Ok(())
}

#[test]
fn options_from_env() {
    env::set_var("PORT", "8123");
    let opt = Options::try_parse_from(["submind-server"]).unwrap();
    env::remove_var("PORT");
    assert_eq!(opt.port, 8123);

    let opt = Options::try_parse_from(["submind-server"]).unwrap();
    assert_eq!(opt.port, 10000);
    assert_eq!(opt.worker.interval(), Duration::from_secs(20));
}

/// Read lines of an event stream until the next `data` field, and parse it as JSON.
async fn next_event_data(
    lines: &mut (impl Stream<Item = io::Result<String>> + Unpin),
) -> Result<Value, Error> {
    while let Some(line) = lines.next().await {
        if let Some(data) = line?.strip_prefix("data:") {
            return Ok(serde_json::from_str(data.trim())?);
        }
    }
    Err(Error::msg("stream closed"))
}

fn workspace() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

/// Start a server backed by the fixture feeds and a scratch database.
///
/// The database lives in the returned directory, which must be kept alive for the duration of
/// the test.
async fn start_server() -> Result<(TempDir, Client), Error> {
    let dir = tempfile::tempdir()?;
    let port = pick_unused_port().unwrap();
    let opt = Options {
        port,
        static_dir: Path::new(env!("CARGO_MANIFEST_DIR")).join("static"),
        feeds_dir: Some(workspace().join("test/feeds")),
        worker: worker::Options {
            interval: 1,
            newsapi_key: None,
        },
        db: db::Options {
            db_path: dir.path().join("submind.db"),
        },
    };
    spawn(async move {
        opt.serve().await.unwrap();
        tracing::warn!("server exited");
    });

    // Connect a client.
    let client: Client = surf::Config::default()
        .set_base_url(format!("http://localhost:{port}").parse().unwrap())
        .try_into()
        .unwrap();
    // Wait for the server to come up.
    wait_for_server(&client).await?;
    Ok((dir, client))
}

#[derive(Clone, Debug)]
struct TestCase {
    name: OsString,
    path: String,
    response: Value,
}

impl TestCase {
    fn new(request_path: impl AsRef<Path>) -> Result<Self, Error> {
        let request_path = request_path.as_ref();
        let name = request_path.file_stem().unwrap();
        let path = fs::read_to_string(request_path)?.trim().to_string();
        let response_path = request_path.with_extension("json");
        let mut response = serde_json::from_reader(File::open(response_path)?)?;
        normalize_response(&mut response);
        Ok(Self {
            name: name.into(),
            path,
            response,
        })
    }

    async fn run(self, client: Client) -> TestResult {
        TestResult {
            name: self.name,
            failure: Self::do_test(client, self.path, self.response).await.err(),
        }
    }

    async fn do_test(client: Client, path: String, expected_response: Value) -> Result<(), Error> {
        let mut res = client.get(&path).await.map_err(Error::msg)?;
        if res.status() != StatusCode::Ok {
            return Err(Error::msg(format!(
                "request {path} failed with status {}",
                res.status()
            )));
        }

        // Parse and normalize the response.
        let mut response: Value = res
            .body_json()
            .await
            .map_err(|err| Error::msg(format!("cannot parse reponse body as JSON: {err}")))?;
        normalize_response(&mut response);

        if response != expected_response {
            Err(Error::msg(format!(
                "expected response:\n{expected_response}\nactual response:\n{response}"
            )))
        } else {
            Ok(())
        }
    }
}

struct TestResult {
    name: OsString,
    failure: Option<anyhow::Error>,
}

impl TestResult {
    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}...", self.name.to_string_lossy())?;
        if let Some(err) = &self.failure {
            writeln!(f, "{}", Color::Red.paint("FAILED"))?;
            write!(f, "{err}")?;
        } else {
            write!(f, "{}", Color::Green.paint("OK"))?;
        }
        Ok(())
    }
}

async fn wait_for_server(client: &Client) -> Result<(), Error> {
    const MAX_CONNECT_RETRIES: usize = 60;

    for _ in 0..MAX_CONNECT_RETRIES {
        match client.get("/health").await {
            Ok(res) if res.status() == StatusCode::Ok => return Ok(()),
            Ok(res) => tracing::warn!("waiting for server to start: status {}", res.status()),
            Err(err) => tracing::warn!("waiting for server to start: {err}"),
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(Error::msg("timed out waiting for server"))
}

/// Wait until the worker has published the results of its first polling cycle.
///
/// Narratives are published last in each cycle, so once they are visible, so is everything else.
async fn wait_for_worker(client: &Client) -> Result<(), Error> {
    const MAX_POLLS: usize = 60;

    for _ in 0..MAX_POLLS {
        let res: Value = client
            .get("/api/narratives")
            .recv_json()
            .await
            .map_err(Error::msg)?;
        if res["data"].as_array().map_or(false, |data| !data.is_empty()) {
            return Ok(());
        }
        tracing::warn!("waiting for worker to publish");
        sleep(Duration::from_millis(500)).await;
    }

    Err(Error::msg("timed out waiting for worker"))
}

fn normalize_response(res: &mut Value) {
    if let Some(obj) = res.as_object_mut() {
        for key in VOLATILE_KEYS {
            obj.remove(key);
        }
        for val in obj.values_mut() {
            normalize_response(val);
        }
    } else if let Some(arr) = res.as_array_mut() {
        for val in arr {
            normalize_response(val);
        }
    }
}
