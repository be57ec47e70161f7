//! Local HTTP stand-in for carrier FHIR endpoints and Nominatim.
//!
//! Routes are keyed by `path` or `path?query`. Replies queued for the same key are served in
//! order and the last one repeats. `{base}` inside a JSON reply is replaced with the server's
//! own base URL so bundles can carry absolute `next` links.

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{net::TcpListener, task::JoinHandle};

#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Status(u16),
    /// Sets the flag when served, then answers with the inner reply.
    Raise(Arc<AtomicBool>, Box<Reply>),
}

struct Shared {
    base_url: String,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
}

pub struct FakeServer {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let mut replies: HashMap<String, VecDeque<Reply>> = HashMap::new();
        for (key, reply) in routes {
            replies.entry(key.to_string()).or_default().push_back(reply);
        }
        let shared = Arc::new(Shared {
            base_url,
            replies: Mutex::new(replies),
            hits: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&shared));
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { shared, task }
    }

    pub fn base_url(&self) -> String {
        self.shared.base_url.clone()
    }

    pub fn hits(&self, key: &str) -> usize {
        self.shared
            .hits
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(State(shared): State<Arc<Shared>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let full = match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.clone(),
    };

    let reply = {
        let mut replies = shared.replies.lock().unwrap();
        let key = if replies.contains_key(&full) { full } else { path };
        *shared.hits.lock().unwrap().entry(key.clone()).or_default() += 1;
        match replies.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    };

    match reply {
        Some(reply) => render(reply, &shared.base_url),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn render(reply: Reply, base_url: &str) -> Response {
    match reply {
        Reply::Json(value) => {
            let body = value.to_string().replace("{base}", base_url);
            ([(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        Reply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Reply::Raise(flag, inner) => {
            flag.store(true, Ordering::SeqCst);
            render(*inner, base_url)
        }
    }
}
