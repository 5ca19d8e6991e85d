//! Page-lifetime state of a running agent, modelled outside the browser.
//!
//! `agent.js` keeps one state object per page load: a throttle for DOM
//! re-application, a FIFO tracking queue drained by a single worker, and the
//! original style values of every element it touched. The types here hold the
//! same state with time and I/O injected, so the agent's rules can be
//! exercised without a browser.

use super::EnvironmentConfig;
use crate::clock::Timer;
use crate::model::{EventType, Experiment, Status, StyleMap, TrackingEvent};
use crate::{Error, Result};
use log::debug;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Drops calls that arrive inside the cooldown window.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Duration>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true and opens a new window when the call may run.
    pub fn try_acquire(&mut self, now: Duration) -> bool {
        match self.last {
            Some(last) if now.saturating_sub(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_env(env: &EnvironmentConfig) -> Self {
        Self {
            retries: env.retry_attempts,
            delay: Duration::from_millis(env.retry_delay_ms),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Delivers one event to the collector.
pub trait Transport<E> {
    fn send(&mut self, event: &E) -> Result<()>;
}

/// Outcome of one [`TrackingQueue::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub dropped: usize,
    /// One [`Error::Delivery`] per dropped event
    pub errors: Vec<Error>,
}

/// FIFO of pending events with a single sequential sender.
#[derive(Debug)]
pub struct TrackingQueue<E> {
    pending: VecDeque<E>,
}

impl<E> Default for TrackingQueue<E> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<E> TrackingQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: E) {
        self.pending.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.pending.iter()
    }

    /// Send every pending event oldest first, one at a time. An event moves on
    /// only after success or after its last attempt fails; failed events are
    /// dropped and never re-queued.
    pub fn drain<T: Transport<E>>(
        &mut self,
        transport: &mut T,
        policy: &RetryPolicy,
        timer: &dyn Timer,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(event) = self.pending.pop_front() {
            let mut attempt = 1;
            loop {
                match transport.send(&event) {
                    Ok(()) => {
                        report.delivered += 1;
                        break;
                    }
                    Err(e) if attempt < policy.attempts() => {
                        debug!(
                            "tracking delivery attempt {} failed, retrying in {:?}: {}",
                            attempt, policy.delay, e
                        );
                        timer.sleep(policy.delay);
                        attempt += 1;
                    }
                    Err(e) => {
                        debug!("dropping tracking event after {} attempts: {}", attempt, e);
                        report.dropped += 1;
                        report.errors.push(Error::Delivery(format!(
                            "gave up after {} attempts: {}",
                            attempt, e
                        )));
                        break;
                    }
                }
            }
        }
        report
    }
}

/// The slice of a DOM element the agent reads and writes.
pub trait StyledElement {
    /// Value of the `data-exp-id` attribute
    fn marker(&self) -> Option<&str>;
    fn set_marker(&mut self, id: String);
    /// Inline style value; `None` when the property is unset
    fn style(&self, property: &str) -> Option<String>;
    fn set_style(&mut self, property: &str, value: &str);
    fn remove_style(&mut self, property: &str);
}

/// Original inline values of every element the agent modified, keyed by
/// element identifier.
#[derive(Debug, Clone)]
pub struct ModificationBook {
    experiment_id: String,
    next_index: usize,
    originals: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

impl ModificationBook {
    pub fn new(experiment_id: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            next_index: 0,
            originals: BTreeMap::new(),
        }
    }

    /// Reuse the element's identifier or synthesize `exp-<experiment>-<n>`.
    pub fn identify<E: StyledElement>(&mut self, element: &mut E) -> String {
        if let Some(existing) = element.marker() {
            return existing.to_string();
        }
        let id = format!("exp-{}-{}", self.experiment_id, self.next_index);
        self.next_index += 1;
        element.set_marker(id.clone());
        id
    }

    /// Apply `overrides` to each element not modified before. Returns the
    /// identifiers of the elements modified by this call.
    pub fn apply<'a, E, I>(&mut self, elements: I, overrides: &StyleMap) -> Vec<String>
    where
        E: StyledElement + 'a,
        I: IntoIterator<Item = &'a mut E>,
    {
        let mut modified = Vec::new();
        if overrides.is_empty() {
            return modified;
        }
        for element in elements {
            let id = self.identify(element);
            if self.originals.contains_key(&id) {
                continue;
            }
            let original = overrides
                .keys()
                .map(|prop| (prop.clone(), element.style(prop)))
                .collect();
            for (prop, value) in overrides {
                element.set_style(prop, value);
            }
            self.originals.insert(id.clone(), original);
            modified.push(id);
        }
        modified
    }

    pub fn is_modified(&self, id: &str) -> bool {
        self.originals.contains_key(id)
    }

    pub fn modified(&self) -> impl Iterator<Item = &str> {
        self.originals.keys().map(String::as_str)
    }

    /// Restore recorded values on the given elements (unset originals are
    /// removed) and forget everything. Returns how many elements were restored.
    pub fn cleanup<'a, E, I>(&mut self, elements: I) -> usize
    where
        E: StyledElement + 'a,
        I: IntoIterator<Item = &'a mut E>,
    {
        let mut restored = 0;
        for element in elements {
            let Some(original) = element.marker().and_then(|m| self.originals.get(m)) else {
                continue;
            };
            for (prop, value) in original {
                match value {
                    Some(v) if !v.is_empty() => element.set_style(prop, v),
                    _ => element.remove_style(prop),
                }
            }
            restored += 1;
        }
        self.originals.clear();
        restored
    }
}

/// A document as seen by the agent.
pub trait Page {
    type Element: StyledElement;

    fn url(&self) -> &str;
    fn query_all(&mut self, selector: &str) -> Vec<&mut Self::Element>;
    fn all_elements(&mut self) -> Vec<&mut Self::Element>;
}

/// Everything one agent holds for one page load.
#[derive(Debug)]
pub struct AgentSession {
    experiment_id: String,
    variant_id: String,
    selections: Vec<(String, StyleMap)>,
    throttle: Throttle,
    retry: RetryPolicy,
    book: ModificationBook,
    queue: TrackingQueue<TrackingEvent>,
    view_sent: bool,
    stopped: bool,
}

impl AgentSession {
    /// Decide whether the agent acts on `page_url` at all: the experiment must
    /// be active, the URL must contain its target, and a non-control variant
    /// must be active.
    pub fn start(experiment: &Experiment, page_url: &str, env: &EnvironmentConfig) -> Option<Self> {
        if experiment.status != Status::Active {
            debug!("experiment {} is not active", experiment.id);
            return None;
        }
        if !page_url.contains(&experiment.target_url) {
            debug!("page {} does not match {}", page_url, experiment.target_url);
            return None;
        }
        let variant = experiment.active_variant()?;
        Some(Self {
            experiment_id: experiment.id.clone(),
            variant_id: variant.id.clone(),
            selections: variant
                .elements
                .iter()
                .map(|e| (e.query(), e.variant_styles.clone()))
                .collect(),
            throttle: Throttle::new(Duration::from_millis(env.throttle_interval_ms)),
            retry: RetryPolicy::from_env(env),
            book: ModificationBook::new(experiment.id.clone()),
            queue: TrackingQueue::new(),
            view_sent: false,
            stopped: false,
        })
    }

    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Initial application and every observed DOM change go through here.
    /// Returns the number of newly modified elements, 0 when throttled.
    pub fn on_dom_change<P: Page>(&mut self, now: Duration, page: &mut P) -> usize {
        if self.stopped || !self.throttle.try_acquire(now) {
            return 0;
        }
        self.apply(page)
    }

    fn apply<P: Page>(&mut self, page: &mut P) -> usize {
        let url = page.url().to_string();
        let mut applied = 0;
        for (selector, overrides) in &self.selections {
            applied += self.book.apply(page.query_all(selector), overrides).len();
        }
        if applied > 0 && !self.view_sent {
            self.view_sent = true;
            let mut metadata = BTreeMap::new();
            metadata.insert("elements".to_string(), serde_json::json!(applied));
            self.track(EventType::VariantView, &url, metadata);
        }
        applied
    }

    /// A click on a modified element; ignored for anything else.
    pub fn on_click(&mut self, element_id: &str, page_url: &str) -> bool {
        if self.stopped || !self.book.is_modified(element_id) {
            return false;
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("elementId".to_string(), serde_json::json!(element_id));
        self.track(EventType::VariantClick, page_url, metadata);
        true
    }

    fn track(&mut self, event_type: EventType, url: &str, metadata: BTreeMap<String, serde_json::Value>) {
        self.queue.push(TrackingEvent {
            experiment_id: self.experiment_id.clone(),
            variant_id: Some(self.variant_id.clone()),
            event_type,
            timestamp: None,
            url: url.to_string(),
            metadata,
        });
    }

    pub fn pending(&self) -> impl Iterator<Item = &TrackingEvent> {
        self.queue.iter()
    }

    pub fn flush<T: Transport<TrackingEvent>>(&mut self, transport: &mut T, timer: &dyn Timer) -> DrainReport {
        self.queue.drain(transport, &self.retry, timer)
    }

    /// Unload path: restore every modified element and stop reacting.
    pub fn cleanup<P: Page>(&mut self, page: &mut P) -> usize {
        self.stopped = true;
        self.book.cleanup(page.all_elements())
    }
}
