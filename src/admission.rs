#![forbid(unsafe_code)]

//! Request admission: per-client sliding-window budgets and a downstream
//! capacity check in front of new submissions.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use log::warn;
use parking_lot::Mutex;

use crate::{catalog::Catalog, error::IngestError, queue::TaskQueue};

/// Histories kept before idle clients are swept out of the table.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionPolicy {
    pub submit_limit: usize,
    pub validate_limit: usize,
    pub dashboard_limit: usize,
    pub window_secs: u64,
    /// Submissions are refused once this many tasks wait in the queue.
    pub max_queue_size: u64,
    pub capacity_retry_after_secs: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            submit_limit: 10,
            validate_limit: 30,
            dashboard_limit: 60,
            window_secs: 60,
            max_queue_size: 1000,
            capacity_retry_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Submit,
    Validate,
    Dashboard,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Submit => "submit_url",
            EndpointClass::Validate => "validate_url",
            EndpointClass::Dashboard => "dashboard",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Reject { reason: String, retry_after: u64 },
}

impl Admission {
    pub fn into_result(self) -> Result<(), IngestError> {
        match self {
            Admission::Allow => Ok(()),
            Admission::Reject {
                reason,
                retry_after,
            } => Err(IngestError::CapacityExceeded {
                reason,
                retry_after,
            }),
        }
    }
}

/// Sliding-window counters keyed by client and endpoint class. Only admitted
/// requests count against the budget.
pub struct RateLimiter {
    policy: AdmissionPolicy,
    history: Mutex<HashMap<(String, EndpointClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn admit(&self, client: &str, class: EndpointClass) -> Admission {
        self.admit_at(client, class, Instant::now())
    }

    pub fn admit_at(&self, client: &str, class: EndpointClass, now: Instant) -> Admission {
        let window = self.window();
        let limit = self.limit(class);
        let mut history = self.history.lock();
        if history.len() > SWEEP_THRESHOLD {
            history.retain(|_, stamps| {
                stamps
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
        }

        let stamps = history.entry((client.to_string(), class)).or_default();
        while stamps
            .front()
            .is_some_and(|first| now.saturating_duration_since(*first) >= window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= limit {
            let retry_after = stamps
                .front()
                .map(|first| window.saturating_sub(now.saturating_duration_since(*first)))
                .unwrap_or(window);
            warn!("rate limit exceeded for {client} on {}", class.as_str());
            return Admission::Reject {
                reason: "Too many requests. Please wait before trying again.".to_string(),
                retry_after: ceil_secs(retry_after),
            };
        }
        stamps.push_back(now);
        Admission::Allow
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.policy.window_secs.max(1))
    }

    fn limit(&self, class: EndpointClass) -> usize {
        match class {
            EndpointClass::Submit => self.policy.submit_limit,
            EndpointClass::Validate => self.policy.validate_limit,
            EndpointClass::Dashboard => self.policy.dashboard_limit,
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Refuses new work when the queue is at its ceiling or the catalog does not
/// answer. An unreadable queue depth is logged and tolerated.
pub async fn check_capacity(
    policy: &AdmissionPolicy,
    queue: &TaskQueue,
    catalog: &Catalog,
) -> Result<(), IngestError> {
    let overloaded = |reason: String| IngestError::CapacityExceeded {
        reason,
        retry_after: policy.capacity_retry_after_secs,
    };

    match queue.depth().await {
        Ok(depth) if depth >= policy.max_queue_size => {
            warn!("admission refused: {depth} tasks queued");
            return Err(overloaded(format!("Queue full ({depth} jobs pending)")));
        }
        Ok(_) => {}
        Err(err) => warn!("could not read queue depth: {err:#}"),
    }

    if let Err(err) = catalog.ping().await {
        warn!("admission refused: catalog unavailable: {err:#}");
        return Err(overloaded(format!("Database unavailable: {err:#}")));
    }
    Ok(())
}
