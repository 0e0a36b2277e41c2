//! Mock Bugzilla and Kitsune servers for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// A server running on an ephemeral port until dropped.
pub struct MockServer {
    pub base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve(app: Router) -> MockServer {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    MockServer {
        base_url: format!("http://{}", addr),
        shutdown: Some(tx),
    }
}

#[derive(Default)]
pub struct Hits {
    pub metadata: AtomicUsize,
    pub buglist: AtomicUsize,
    pub details: AtomicUsize,
    pub activity: AtomicUsize,
    pub questions: AtomicUsize,
    pub answers: AtomicUsize,
    /// Bug id whose activity page answers 500; 0 for none.
    pub fail_activity_for: AtomicUsize,
}

impl Hits {
    pub fn network_calls(&self) -> usize {
        [
            &self.metadata,
            &self.buglist,
            &self.details,
            &self.activity,
            &self.questions,
            &self.answers,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// One bug served by the mock Bugzilla.
#[derive(Clone)]
pub struct MockBug {
    pub id: u32,
    /// `%Y-%m-%d %H:%M:%S`, UTC.
    pub changed: String,
}

pub fn bug(id: u32, changed: &str) -> MockBug {
    MockBug {
        id,
        changed: changed.to_string(),
    }
}

struct BugzillaState {
    bugs: Vec<MockBug>,
    version: Option<String>,
    hits: Arc<Hits>,
}

async fn show_bug(
    State(state): State<Arc<BugzillaState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> impl IntoResponse {
    let ids: Vec<&str> = params
        .iter()
        .filter(|(k, _)| k == "id")
        .map(|(_, v)| v.as_str())
        .collect();
    let open = match &state.version {
        Some(v) => format!(
            "<bugzilla version=\"{}\" urlbase=\"http://example.com/\" maintainer=\"admin@example.com\">",
            v
        ),
        None => "<bugzilla>".to_string(),
    };

    if ids.is_empty() {
        state.hits.metadata.fetch_add(1, Ordering::SeqCst);
        return format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\" ?>\n{}\n</bugzilla>\n",
            open
        );
    }

    state.hits.details.fetch_add(1, Ordering::SeqCst);
    let mut xml = format!("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\" ?>\n{}\n", open);
    for id in ids {
        let Some(bug) = state.bugs.iter().find(|b| b.id.to_string() == id) else {
            continue;
        };
        xml.push_str(&format!(
            "  <bug>\n    <bug_id>{}</bug_id>\n    <delta_ts>{} +0000</delta_ts>\n    <short_desc>Bug &lt;{}&gt; summary</short_desc>\n    <bug_status>NEW</bug_status>\n  </bug>\n",
            bug.id, bug.changed, bug.id
        ));
    }
    xml.push_str("</bugzilla>\n");
    xml
}

async fn buglist(
    State(state): State<Arc<BugzillaState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> String {
    state.hits.buglist.fetch_add(1, Ordering::SeqCst);
    let from = params
        .iter()
        .find(|(k, _)| k == "chfieldfrom")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let mut bugs: Vec<&MockBug> = state.bugs.iter().filter(|b| b.changed >= from).collect();
    bugs.sort_by(|a, b| a.changed.cmp(&b.changed).then(a.id.cmp(&b.id)));

    let mut csv = String::from("bug_id,\"bug_severity\",\"short_desc\",\"changeddate\"\n");
    for b in bugs {
        csv.push_str(&format!(
            "{},\"normal\",\"Bug, \"\"{}\"\"\",\"{}\"\n",
            b.id, b.id, b.changed
        ));
    }
    csv
}

async fn show_activity(
    State(state): State<Arc<BugzillaState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    state.hits.activity.fetch_add(1, Ordering::SeqCst);
    let id = params
        .iter()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let failing = state.hits.fail_activity_for.load(Ordering::SeqCst);
    if failing != 0 && id == failing.to_string() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "activity unavailable").into_response();
    }
    if id.ends_with('0') {
        return "<html><body><p>No changes have been made to this bug yet.</p></body></html>".into_response();
    }
    format!(
        r#"<html><body>
<p>Bug {id} activity</p>
<table border cellpadding="4">
  <tr><th>Who</th><th>When</th><th>What</th><th>Removed</th><th>Added</th></tr>
  <tr>
    <td rowspan="2" valign="top">dev{id}@example.com</td>
    <td rowspan="2" valign="top">2014-01-01 10:00:00 UTC</td>
    <td>Status</td><td>NEW</td><td>ASSIGNED</td>
  </tr>
  <tr><td>Assignee</td><td>nobody</td><td>dev{id}</td></tr>
</table>
</body></html>"#
    )
    .into_response()
}

/// Mock Bugzilla serving `bugs`; `version: None` hides the server version.
pub async fn bugzilla(bugs: Vec<MockBug>, version: Option<&str>) -> (MockServer, Arc<Hits>) {
    let hits = Arc::new(Hits::default());
    let state = Arc::new(BugzillaState {
        bugs,
        version: version.map(str::to_string),
        hits: hits.clone(),
    });
    let app = Router::new()
        .route("/show_bug.cgi", get(show_bug))
        .route("/buglist.cgi", get(buglist))
        .route("/show_activity.cgi", get(show_activity))
        .with_state(state);
    (serve(app).await, hits)
}

struct KitsuneState {
    base_url: String,
    questions: usize,
    hits: Arc<Hits>,
}

fn param(params: &[(String, String)], key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

const KITSUNE_PAGE: usize = 20;

async fn questions(
    State(state): State<Arc<KitsuneState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> axum::Json<Value> {
    state.hits.questions.fetch_add(1, Ordering::SeqCst);
    let page: usize = param(&params, "page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let start = (page - 1) * KITSUNE_PAGE;
    let end = (start + KITSUNE_PAGE).min(state.questions);

    let results: Vec<Value> = (start..end)
        .map(|n| {
            json!({
                "id": 1000 + n,
                "title": format!("Question {}", n),
                "updated": format!("2016-01-01T00:{:02}:{:02}Z", n / 60, n % 60),
                "num_answers": 1
            })
        })
        .collect();
    let next = if end < state.questions {
        json!(format!("{}/api/2/question/?page={}", state.base_url, page + 1))
    } else {
        Value::Null
    };
    axum::Json(json!({ "count": state.questions, "next": next, "previous": null, "results": results }))
}

async fn answers(
    State(state): State<Arc<KitsuneState>>,
    Query(params): Query<Vec<(String, String)>>,
) -> axum::Json<Value> {
    state.hits.answers.fetch_add(1, Ordering::SeqCst);
    let question = param(&params, "question").unwrap_or_default();
    let page: usize = param(&params, "page").and_then(|p| p.parse().ok()).unwrap_or(1);

    // Question 1000 has two answer pages.
    let (next, results) = match (question.as_str(), page) {
        ("1000", 1) => (json!("next"), vec![json!({ "id": 1, "question": 1000 })]),
        ("1000", _) => (Value::Null, vec![json!({ "id": 2, "question": 1000 })]),
        (q, _) => (Value::Null, vec![json!({ "id": 10, "question": q })]),
    };
    axum::Json(json!({ "count": results.len(), "next": next, "results": results }))
}

/// Mock Kitsune with `count` questions.
pub async fn kitsune(count: usize) -> (MockServer, Arc<Hits>) {
    let hits = Arc::new(Hits::default());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(KitsuneState {
        base_url: base_url.clone(),
        questions: count,
        hits: hits.clone(),
    });
    let app = Router::new()
        .route("/api/2/question/", get(questions))
        .route("/api/2/answer/", get(answers))
        .with_state(state);

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (
        MockServer {
            base_url,
            shutdown: Some(tx),
        },
        hits,
    )
}

/// Write a config for the given sources under `root` and return its path.
pub fn write_config(root: &Path, bugzilla_url: Option<&str>, kitsune_url: Option<&str>, extra: &str) -> PathBuf {
    let mut body = format!(
        "[db]\npath = \"{0}/data/harvest.sqlite\"\n\n[cache]\ndir = \"{0}/data/cache\"\n\n[http]\nmax_retries = 0\ntimeout_secs = 10\n\n",
        root.display()
    );
    body.push_str(extra);
    if let Some(url) = bugzilla_url {
        body.push_str(&format!(
            "\n[connectors.bugzilla.local]\nurl = \"{}\"\norigin = \"http://example.com\"\n",
            url
        ));
    }
    if let Some(url) = kitsune_url {
        body.push_str(&format!("\n[connectors.kitsune.local]\nurl = \"{}\"\n", url));
    }

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("harvest.toml");
    fs::write(&path, body).unwrap();
    path
}
