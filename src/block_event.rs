//! Block event shape shipped by the event shipper.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub host: String,
    pub path: String,
    pub scheme: String,
}

impl RequestInfo {
    fn empty() -> Self {
        Self {
            method: String::new(),
            host: String::new(),
            path: String::new(),
            scheme: String::new(),
        }
    }

    fn fill(&mut self, fields: RequestFields) {
        self.method.clear();
        self.method.push_str(fields.method);
        self.host.clear();
        self.host.push_str(fields.host);
        self.path.clear();
        self.path.push_str(fields.path);
        self.scheme.clear();
        self.scheme.push_str(fields.scheme);
    }
}

/// Borrowed request fields for a [`BlockEvent`], so filling in a pooled
/// event never needs an intermediate owned `RequestInfo`.
#[derive(Debug, Clone, Copy)]
pub struct RequestFields<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub scheme: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub ip: String,
    pub direct_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ClientInfo {
    fn empty() -> Self {
        Self {
            ip: String::new(),
            direct_ip: String::new(),
            user_agent: None,
        }
    }

    fn fill(&mut self, fields: ClientFields) {
        self.ip.clear();
        self.ip.push_str(fields.ip);
        self.direct_ip.clear();
        self.direct_ip.push_str(fields.direct_ip);
        match fields.user_agent {
            Some(ua) => {
                let buf = self.user_agent.get_or_insert_with(String::new);
                buf.clear();
                buf.push_str(ua);
            }
            None => self.user_agent = None,
        }
    }
}

/// Borrowed client fields for a [`BlockEvent`]; see [`RequestFields`].
#[derive(Debug, Clone, Copy)]
pub struct ClientFields<'a> {
    pub ip: &'a str,
    pub direct_ip: &'a str,
    pub user_agent: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyInfo {
    pub mode: String,
}

/// A single block event. Instances are cheap to build and are reused via
/// [`BlockEvent::reset`] rather than reallocated on every block: events are
/// pooled and reset before reuse, not freed and reallocated per request.
#[derive(Debug, Clone, Serialize)]
pub struct BlockEvent {
    pub event_id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub event_type: &'static str,
    pub request: RequestInfo,
    pub client: ClientInfo,
    pub policy: PolicyInfo,
    pub status_code: u16,
}

impl BlockEvent {
    pub fn new(request: RequestFields, client: ClientFields, mode: &str) -> Self {
        let mut event = Self {
            event_id: Uuid::new_v4(),
            timestamp_utc: Utc::now(),
            event_type: "access_blocked",
            request: RequestInfo::empty(),
            client: ClientInfo::empty(),
            policy: PolicyInfo { mode: String::new() },
            status_code: 403,
        };
        event.request.fill(request);
        event.client.fill(client);
        event.policy.mode.push_str(mode);
        event
    }

    /// Reset in place for reuse from a pool: every `String` field is
    /// cleared and refilled rather than replaced, so a pooled buffer whose
    /// capacity already fits the new values never reallocates. `event_id`
    /// is re-rolled so a reused buffer never ships with a stale identity
    /// from its previous occupant.
    pub fn reset(&mut self, request: RequestFields, client: ClientFields, mode: &str) {
        self.event_id = Uuid::new_v4();
        self.timestamp_utc = Utc::now();
        self.request.fill(request);
        self.client.fill(client);
        self.policy.mode.clear();
        self.policy.mode.push_str(mode);
        self.status_code = 403;
    }
}

/// A small pool of reusable [`BlockEvent`] allocations. The request path
/// takes one out, fills it in, hands it to the shipper, and once the
/// shipper has serialized the batch, the buffer it was carried in can be
/// returned via [`EventPool::release`].
#[derive(Default)]
pub struct EventPool {
    free: std::sync::Mutex<Vec<BlockEvent>>,
}

impl EventPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, request: RequestFields, client: ClientFields, mode: &str) -> BlockEvent {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut ev) => {
                ev.reset(request, client, mode);
                ev
            }
            None => BlockEvent::new(request, client, mode),
        }
    }

    pub fn release(&self, event: BlockEvent) {
        let mut free = self.free.lock().unwrap();
        if free.len() < 256 {
            free.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> RequestFields<'static> {
        RequestFields {
            method: "GET",
            host: "example.com",
            path: "/",
            scheme: "https",
        }
    }
    fn client() -> ClientFields<'static> {
        ClientFields {
            ip: "203.0.113.9",
            direct_ip: "203.0.113.9",
            user_agent: None,
        }
    }

    #[test]
    fn new_event_has_expected_defaults() {
        let ev = BlockEvent::new(req(), client(), "blocklist");
        assert_eq!(ev.event_type, "access_blocked");
        assert_eq!(ev.status_code, 403);
        assert_eq!(ev.policy.mode, "blocklist");
    }

    #[test]
    fn pool_reuses_released_events() {
        let pool = EventPool::new();
        let ev = pool.acquire(req(), client(), "blocklist");
        let first_id = ev.event_id;
        pool.release(ev);
        let ev2 = pool.acquire(req(), client(), "allowlist");
        assert_eq!(ev2.policy.mode, "allowlist");
        assert_ne!(ev2.event_id, first_id);
    }

    #[test]
    fn reset_overwrites_every_field_from_its_previous_occupant() {
        let mut ev = BlockEvent::new(req(), client(), "blocklist");
        ev.reset(
            RequestFields {
                method: "POST",
                host: "other.example",
                path: "/submit",
                scheme: "http",
            },
            ClientFields {
                ip: "198.51.100.7",
                direct_ip: "198.51.100.1",
                user_agent: Some("curl/8.0"),
            },
            "allowlist",
        );
        assert_eq!(ev.request.method, "POST");
        assert_eq!(ev.request.host, "other.example");
        assert_eq!(ev.request.path, "/submit");
        assert_eq!(ev.request.scheme, "http");
        assert_eq!(ev.client.ip, "198.51.100.7");
        assert_eq!(ev.client.direct_ip, "198.51.100.1");
        assert_eq!(ev.client.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(ev.policy.mode, "allowlist");

        // Clearing a previously-set user agent must not leave stale data.
        ev.reset(req(), client(), "blocklist");
        assert_eq!(ev.client.user_agent, None);
    }
}
