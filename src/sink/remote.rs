//! Realtime-database sink.
//!
//! Data layout (all paths relative to the database root):
//! - `detections/<push key>`: one `DetectionEvent` per push.
//! - `frames/<push key>`: a compact per-frame summary.
//! - `sessions/<session_id>`: the session record, written once on begin and
//!   patched afterwards.
//!
//! Push keys generated by the store sort chronologically, which is how the
//! latest session is recovered after a restart.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use url::Url;

use super::{EventSink, LatestDetections, SessionEnd, SinkError, SinkMode};
use crate::event::DetectionEvent;
use crate::session::{Session, SessionDelta};

pub const ENV_DATABASE_URL: &str = "FIREBASE_DATABASE_URL";
pub const ENV_AUTH_TOKEN: &str = "FIREBASE_AUTH_TOKEN";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DETECTIONS_PATH: &str = "detections";
const FRAMES_PATH: &str = "frames";
const SESSIONS_PATH: &str = "sessions";

#[derive(Clone)]
pub struct RemoteConfig {
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("database_url", &self.database_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env(ENV_DATABASE_URL),
            auth_token: non_empty_env(ENV_AUTH_TOKEN),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// True when both the endpoint and the credential are present.
    pub fn is_configured(&self) -> bool {
        self.database_url.is_some() && self.auth_token.is_some()
    }

    /// Parsed endpoint, normalized to end in `/`.
    pub fn endpoint(&self) -> Result<Url, SinkError> {
        let raw = self.database_url.as_deref().ok_or_else(|| {
            SinkError::Config(format!("{} is not set", ENV_DATABASE_URL))
        })?;
        let mut url = Url::parse(raw)
            .map_err(|e| SinkError::Config(format!("invalid database url {}: {}", raw, e)))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(SinkError::Config(format!(
                "database url must be http(s), got {}",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        Ok(url)
    }

    fn token(&self) -> Result<&str, SinkError> {
        self.auth_token
            .as_deref()
            .ok_or_else(|| SinkError::Config(format!("{} is not set", ENV_AUTH_TOKEN)))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Minimal document-store operations the remote sink needs.
pub trait RealtimeStore: Send + Sync {
    /// `None` when nothing is stored at `path`.
    fn get(&self, path: &str) -> Result<Option<Value>, SinkError>;
    fn put(&self, path: &str, value: &Value) -> Result<(), SinkError>;
    fn patch(&self, path: &str, value: &Value) -> Result<(), SinkError>;
    /// Append under a generated key and return the key.
    fn post(&self, path: &str, value: &Value) -> Result<String, SinkError>;
    fn delete(&self, path: &str) -> Result<(), SinkError>;
}

/// `RealtimeStore` over the database's REST interface.
pub struct RestStore {
    agent: ureq::Agent,
    base: Url,
    auth_token: String,
}

impl RestStore {
    /// Build a client without contacting the server.
    pub fn new(config: &RemoteConfig) -> Result<Self, SinkError> {
        let base = config.endpoint()?;
        let auth_token = config.token()?.to_string();
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            agent,
            base,
            auth_token,
        })
    }

    /// Build a client and verify the database answers.
    pub fn connect(config: &RemoteConfig) -> Result<Self, SinkError> {
        let store = Self::new(config)?;
        store.check_reachable()?;
        log::info!("RestStore: connected to {}", store.base);
        Ok(store)
    }

    fn check_reachable(&self) -> Result<(), SinkError> {
        let mut url = self.url("")?;
        url.query_pairs_mut().append_pair("shallow", "true");
        self.agent
            .get(url.as_str())
            .call()
            .map_err(|e| request_error(e, "GET", "/"))?;
        Ok(())
    }

    fn url(&self, path: &str) -> Result<Url, SinkError> {
        let path = path.trim_matches('/');
        let mut url = self
            .base
            .join(&format!("{}.json", path))
            .map_err(|e| SinkError::Config(format!("invalid store path {}: {}", path, e)))?;
        url.query_pairs_mut().append_pair("auth", &self.auth_token);
        Ok(url)
    }

    fn send(&self, method: &str, path: &str, body: Option<&Value>) -> Result<String, SinkError> {
        let url = self.url(path)?;
        let request = self.agent.request(method, url.as_str());
        let response = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(&serde_json::to_string(body)?),
            None => request.call(),
        }
        .map_err(|e| request_error(e, method, path))?;
        Ok(response.into_string()?)
    }
}

fn request_error(err: ureq::Error, method: &str, path: &str) -> SinkError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            SinkError::Http(format!("{} {} returned {}: {}", method, path, code, body.trim()))
        }
        ureq::Error::Transport(transport) => {
            SinkError::Unreachable(format!("{} {}: {}", method, path, transport))
        }
    }
}

impl RealtimeStore for RestStore {
    fn get(&self, path: &str) -> Result<Option<Value>, SinkError> {
        let body = self.send("GET", path, None)?;
        let value: Value = serde_json::from_str(&body)?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    fn put(&self, path: &str, value: &Value) -> Result<(), SinkError> {
        self.send("PUT", path, Some(value)).map(|_| ())
    }

    fn patch(&self, path: &str, value: &Value) -> Result<(), SinkError> {
        self.send("PATCH", path, Some(value)).map(|_| ())
    }

    fn post(&self, path: &str, value: &Value) -> Result<String, SinkError> {
        let body = self.send("POST", path, Some(value))?;
        let value: Value = serde_json::from_str(&body)?;
        value
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SinkError::Http(format!("POST {} returned no key", path)))
    }

    fn delete(&self, path: &str) -> Result<(), SinkError> {
        self.send("DELETE", path, None).map(|_| ())
    }
}

pub struct RemoteSink<S = RestStore> {
    store: S,
    current: Mutex<Option<Session>>,
}

impl RemoteSink<RestStore> {
    /// Fails fast when the endpoint or credential is missing or the database
    /// cannot be reached.
    pub fn connect(config: &RemoteConfig) -> Result<Self, SinkError> {
        Ok(Self::with_store(RestStore::connect(config)?))
    }
}

impl<S: RealtimeStore> RemoteSink<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            current: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Session>>, SinkError> {
        self.current.lock().map_err(|_| SinkError::Poisoned)
    }

    fn session_path(session_id: &str) -> String {
        format!("{}/{}", SESSIONS_PATH, session_id)
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<Session>, SinkError> {
        match self.store.get(&Self::session_path(session_id))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The cached record for `session_id`, or the stored one.
    fn resolve_session(
        &self,
        current: &Option<Session>,
        session_id: &str,
    ) -> Result<Option<Session>, SinkError> {
        if let Some(session) = current.as_ref() {
            if session.session_id == session_id {
                return Ok(Some(session.clone()));
            }
        }
        self.fetch_session(session_id)
    }
}

impl<S: RealtimeStore> EventSink for RemoteSink<S> {
    fn mode(&self) -> SinkMode {
        SinkMode::Remote
    }

    fn clear(&self) -> Result<(), SinkError> {
        let mut current = self.lock()?;
        self.store.delete(DETECTIONS_PATH)?;
        self.store.delete(FRAMES_PATH)?;
        *current = None;
        log::info!("RemoteSink: cleared detection data");
        Ok(())
    }

    fn begin_session(&self, session: &Session) -> Result<(), SinkError> {
        let mut current = self.lock()?;
        self.store.put(
            &Self::session_path(&session.session_id),
            &serde_json::to_value(session)?,
        )?;
        *current = Some(session.clone());
        Ok(())
    }

    fn push_event(&self, event: &DetectionEvent) -> Result<(), SinkError> {
        self.store
            .post(DETECTIONS_PATH, &serde_json::to_value(event)?)?;
        let summary = json!({
            "frame_id": event.frame_id,
            "timestamp": event.timestamp,
            "detection_count": event.detection_count,
            "session_id": event.session_id,
        });
        self.store.post(FRAMES_PATH, &summary)?;
        Ok(())
    }

    fn update_session(&self, delta: &SessionDelta) -> Result<(), SinkError> {
        let mut current = self.lock()?;
        let Some(mut session) = self.resolve_session(&current, &delta.session_id)? else {
            return Err(SinkError::Config(format!(
                "no session record for {}",
                delta.session_id
            )));
        };
        session.apply(delta);
        let patch = json!({
            "frame_count": session.frame_count,
            "total_detections": session.total_detections,
            "last_update": session.last_update,
        });
        self.store
            .patch(&Self::session_path(&delta.session_id), &patch)?;
        if current
            .as_ref()
            .map_or(false, |s| s.session_id == delta.session_id)
        {
            *current = Some(session);
        }
        Ok(())
    }

    fn finalize_session(&self, session_id: &str, end: &SessionEnd) -> Result<(), SinkError> {
        let mut current = self.lock()?;
        let Some(mut session) = self.resolve_session(&current, session_id)? else {
            return Err(SinkError::Config(format!(
                "no session record for {}",
                session_id
            )));
        };
        if !session.finalize(end.status, &end.end_time, end.cancelled) {
            log::warn!("RemoteSink: session {} already finalized", session_id);
            return Ok(());
        }
        let patch = json!({
            "status": session.status,
            "end_time": session.end_time,
            "cancelled": session.cancelled,
            "frame_count": session.frame_count,
            "total_detections": session.total_detections,
        });
        self.store.patch(&Self::session_path(session_id), &patch)?;
        log::info!(
            "RemoteSink: session {} {} ({} frames, {} detections)",
            session_id,
            session.status.as_str(),
            session.frame_count,
            session.total_detections
        );
        *current = Some(session);
        Ok(())
    }

    fn latest_detections(&self) -> Result<LatestDetections, SinkError> {
        let current_id = self.lock()?.as_ref().map(|s| s.session_id.clone());
        let mut entries: Vec<(String, DetectionEvent)> = Vec::new();
        if let Some(Value::Object(map)) = self.store.get(DETECTIONS_PATH)? {
            for (key, value) in map {
                match serde_json::from_value::<DetectionEvent>(value) {
                    Ok(event) => entries.push((key, event)),
                    Err(err) => log::warn!("RemoteSink: skipping malformed event {}: {}", key, err),
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let session_id = current_id.or_else(|| entries.last().map(|(_, e)| e.session_id.clone()));
        let mut detections: Vec<DetectionEvent> = entries
            .into_iter()
            .map(|(_, event)| event)
            .filter(|event| Some(&event.session_id) == session_id.as_ref())
            .collect();
        detections.sort_by_key(|event| event.frame_id);
        Ok(LatestDetections {
            session_id,
            detections,
        })
    }

    fn latest_session(&self) -> Result<Option<Session>, SinkError> {
        let current = self.lock()?.clone();
        if let Some(cached) = current {
            return Ok(Some(self.fetch_session(&cached.session_id)?.unwrap_or(cached)));
        }
        let Some(Value::Object(map)) = self.store.get(SESSIONS_PATH)? else {
            return Ok(None);
        };
        let latest = map
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value::<Session>(value).ok())
            .max_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(latest)
    }
}
