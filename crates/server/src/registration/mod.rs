//! Registration reporter (spec §4.8): a single worker that posts the
//! proxy's status to EchoLink's directory service, periodically and
//! whenever slot occupancy changes.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use shared::{digest, log};
use tokio::sync::RwLock;

use crate::consts::{
    REGISTRATION_HOST, REGISTRATION_PATH, REGISTRATION_PERIOD_MS, REGISTRATION_PROTOCOL_VERSION,
    REGISTRATION_SALT, USER_AGENT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Busy,
    Off,
}

impl Status {
    fn phrase(self) -> &'static str {
        match self {
            Status::Ready => "Ready",
            Status::Busy => "Busy",
            Status::Off => "Off",
        }
    }
}

struct RegistrationState {
    status: Status,
    slots_used: usize,
    slots_total: usize,
}

/// A single POST body's worth of settings, fixed for the lifetime of the
/// reporter.
struct StaticParams {
    reg_name: String,
    reg_comment: String,
    public_addr: String,
    is_public: bool,
    suffix: String,
}

pub struct RegistrationReporter {
    worker: shared::worker::Worker,
    state: Arc<RwLock<RegistrationState>>,
    static_params: Arc<StaticParams>,
    client: reqwest::Client,
    base_url: String,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    slots_used_counter: Arc<AtomicUsize>,
}

fn percent_encode_form_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn build_suffix(reg_name: &str, public_addr: &str, port: u16) -> String {
    let mut buf = reg_name.as_bytes().to_vec();
    buf.extend_from_slice(public_addr.as_bytes());
    buf.extend_from_slice(REGISTRATION_SALT.as_bytes());
    let digest = digest::md5(&buf);
    format!(
        "&a={}&d={}&p={}&v={}",
        percent_encode_form_value(public_addr),
        digest::to_hex(&digest),
        port,
        REGISTRATION_PROTOCOL_VERSION
    )
}

impl RegistrationReporter {
    pub fn new(
        reg_name: &str,
        reg_comment: &str,
        public_addr: &str,
        port: u16,
        is_public: bool,
        slots_total: usize,
    ) -> Self {
        let base_url = format!("http://{}{}", REGISTRATION_HOST, REGISTRATION_PATH);
        Self::new_with_base_url(
            reg_name,
            reg_comment,
            public_addr,
            port,
            is_public,
            slots_total,
            base_url,
        )
    }

    #[cfg_attr(not(test), allow(dead_code))]
    fn new_with_base_url(
        reg_name: &str,
        reg_comment: &str,
        public_addr: &str,
        port: u16,
        is_public: bool,
        slots_total: usize,
        base_url: String,
    ) -> Self {
        let static_params = Arc::new(StaticParams {
            reg_name: reg_name.to_string(),
            reg_comment: reg_comment.to_string(),
            public_addr: public_addr.to_string(),
            is_public,
            suffix: build_suffix(reg_name, public_addr, port),
        });

        RegistrationReporter {
            worker: shared::worker::Worker::new(Some(Duration::from_millis(
                REGISTRATION_PERIOD_MS,
            ))),
            state: Arc::new(RwLock::new(RegistrationState {
                status: Status::Ready,
                slots_used: 0,
                slots_total,
            })),
            static_params,
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .expect("failed to build registration HTTP client"),
            base_url,
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            slots_used_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Starts the periodic worker. The first tick posts `Ready` (no slots
    /// occupied yet) unless occupancy has already changed by then.
    pub async fn start(&self) {
        let state = self.state.clone();
        let static_params = self.static_params.clone();
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let stopped = self.stopped.clone();

        self.worker
            .start(move || {
                let state = state.clone();
                let static_params = static_params.clone();
                let client = client.clone();
                let base_url = base_url.clone();
                let stopped = stopped.clone();
                async move {
                    if stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    post_update(&client, &base_url, &state, &static_params).await;
                }
            })
            .await;
    }

    /// Notifies the reporter that slot occupancy changed. Multiple calls
    /// while a post is in flight collapse into a single follow-up post
    /// (`Worker`'s single-slot coalescing).
    pub async fn notify_occupancy(&self, slots_used: usize) {
        self.slots_used_counter.store(slots_used, Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            state.slots_used = slots_used;
            state.status = if slots_used < state.slots_total {
                Status::Ready
            } else {
                Status::Busy
            };
        }
        let _ = self.worker.wake().await;
    }

    /// Posts a final `Off` status and stops the worker. No further updates
    /// are posted after this resolves.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            state.status = Status::Off;
        }
        let _ = self.worker.wake().await;
        self.worker.wait_idle().await.ok();
        self.stopped.store(true, Ordering::SeqCst);
        self.worker.join().await;
    }
}

async fn post_update(
    client: &reqwest::Client,
    base_url: &str,
    state: &RwLock<RegistrationState>,
    params: &StaticParams,
) {
    let (status, slots_used, slots_total) = {
        let state = state.read().await;
        (state.status, state.slots_used, state.slots_total)
    };

    let body = format!(
        "name={}&comment={} [{}/{}]&public={}&status={}{}",
        percent_encode_form_value(&params.reg_name),
        percent_encode_form_value(&params.reg_comment),
        slots_used,
        slots_total,
        if params.is_public { "Y" } else { "N" },
        status.phrase(),
        params.suffix,
    );

    match client
        .post(base_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("Connection", "keep-alive")
        .body(body)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            log::debug!("Registration update posted: {:?}", status);
        }
        Ok(response) => {
            log::warn!("Registration update rejected: HTTP {}", response.status());
        }
        Err(e) => {
            log::warn!("Registration update failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn percent_encode_handles_space_and_reserved_chars() {
        assert_eq!(percent_encode_form_value("N0CALL-L"), "N0CALL-L");
        assert_eq!(percent_encode_form_value("a b"), "a+b");
        assert_eq!(percent_encode_form_value("a&b=c"), "a%26b%3Dc");
    }

    #[test]
    fn suffix_contains_expected_fields() {
        let suffix = build_suffix("N0CALL-L", "203.0.113.1", 8100);
        assert!(suffix.contains("&a=203.0.113.1"));
        assert!(suffix.contains("&p=8100"));
        assert!(suffix.contains("&v=1.2.3o"));
        assert!(suffix.contains("&d="));
    }

    // Property 10: registration trigger collapsing.
    #[tokio::test]
    async fn overlapping_occupancy_notifications_collapse_to_one_post() {
        let post_count = Arc::new(AtomicUsize::new(0));
        let reporter = RegistrationReporter::new("N0CALL-L", "test", "203.0.113.1", 8100, true, 1);

        // Replace the periodic worker body with an instrumented one that
        // counts invocations instead of making real HTTP calls, exercising
        // the same coalescing path `start()` would use.
        let counter = post_count.clone();
        reporter
            .worker
            .start(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(StdDuration::from_millis(30)).await;
                }
            })
            .await;

        for used in 0..5 {
            reporter.notify_occupancy(used).await;
        }
        reporter.worker.wait_idle().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        reporter.worker.wait_idle().await.unwrap();

        let n = post_count.load(Ordering::SeqCst);
        assert!((1..=6).contains(&n), "unexpected post count {n}");
        reporter.worker.join().await;
    }

    #[tokio::test]
    async fn first_post_before_any_occupancy_change_is_ready_not_unknown() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/proxypost.jsp")
            .match_body(mockito::Matcher::Regex("status=Ready".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let reporter = RegistrationReporter::new_with_base_url(
            "N0CALL-L",
            "test proxy",
            "203.0.113.1",
            8100,
            true,
            1,
            format!("{}/proxypost.jsp", server.url()),
        );
        reporter.start().await;
        reporter.worker.wake().await.unwrap();
        reporter.worker.wait_idle().await.unwrap();
        reporter.worker.join().await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn posts_well_formed_body_and_requires_200() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/proxypost.jsp")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(mockito::Matcher::Regex(
                "name=N0CALL-L&comment=test\\+proxy \\[0/1\\]&public=Y&status=Ready.*".to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let reporter = RegistrationReporter::new_with_base_url(
            "N0CALL-L",
            "test proxy",
            "203.0.113.1",
            8100,
            true,
            1,
            format!("{}/proxypost.jsp", server.url()),
        );
        reporter.start().await;
        reporter.notify_occupancy(0).await;
        reporter.worker.wait_idle().await.unwrap();
        reporter.worker.join().await;

        mock.assert_async().await;
    }
}
