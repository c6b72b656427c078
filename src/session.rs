//! Session lifecycle controller
//!
//! [`PulseEngine`] is the single authority over the session: it owns the
//! Journey record, decides when the session ends, and chooses the delivery
//! channel for the terminal write. Construction runs identity resolution
//! and entry capture synchronously, before a single-page-app router can
//! rewrite the URL. Initialization creates or resumes the remote record,
//! drains the pre-creation event queue in arrival order, and starts the
//! periodic score sync.
//!
//! States: `CREATING → ACTIVE → ENDED`, terminal. The end transition flips
//! the active flag and freezes the end time synchronously before any
//! asynchronous work, so every downstream duration and guard decision sees
//! a stable end time. In-flight periodic writes abort via the flag guard,
//! not via task cancellation.
//!
//! No error raised inside the engine ever propagates to the host page:
//! every public entry point swallows and logs.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{fields, JourneyApi, JourneyFields};
use crate::config::EngineConfig;
use crate::conversion::{ConversionConfig, SelectorValidation};
use crate::delivery::{DeliveryChannel, GuaranteedBeaconChannel, RetryingAsyncChannel};
use crate::guard::ActiveFlag;
use crate::identity::{resolve_session_id, resolve_visitor_id, rotate_session_id};
use crate::queue::EventQueue;
use crate::score::{classify_bounce, compute_engagement_score};
use crate::storage::StorageTiers;
use crate::trackers::{
    InteractionKind, InteractionTracker, NavigationEvent, NavigationObserver, PageTimeTracker,
    ScrollTracker,
};
use crate::traffic::{capture_entry, classify_traffic};
use crate::types::{
    BounceEvent, ConversionEvent, CriticalData, EndTrigger, Engagement, EntrySnapshot, Journey,
    JourneyPath, PageVisit, QueuedEvent, SessionInfo,
};

/// Lifecycle phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Local record exists; remote record does not yet.
    Creating,
    /// Remote record known; tracking flows through directly.
    Active,
    /// Terminal.
    Ended,
}

/// Entry-page facts the host hands to the constructor.
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub referrer: Option<String>,
    pub device: Option<crate::types::DeviceInfo>,
    pub location: Option<crate::types::Location>,
}

/// Everything mutable behind the engine's single lock. Never held across
/// an await.
struct SessionState {
    phase: SessionPhase,
    journey: Journey,
    journey_id: Option<String>,
    queue: EventQueue,
    scroll: ScrollTracker,
    page_time: PageTimeTracker,
    interactions: InteractionTracker,
    navigation: NavigationObserver,
    /// Interaction total at the start of the current page, so per-page
    /// interaction counts can be frozen on navigation.
    page_interaction_base: u32,
    conversion_config: Option<ConversionConfig>,
    selector_validation: SelectorValidation,
}

struct EngineInner {
    config: EngineConfig,
    api: Arc<dyn JourneyApi>,
    tiers: StorageTiers,
    active: ActiveFlag,
    state: Mutex<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The visitor-session telemetry engine. One instance per widget embed;
/// no process-wide state.
#[derive(Clone)]
pub struct PulseEngine {
    inner: Arc<EngineInner>,
    /// The entry snapshot, frozen at construction.
    entry: Arc<EntrySnapshot>,
}

impl PulseEngine {
    /// Construct the engine. Identity resolution and traffic/entry capture
    /// run here, synchronously, before anything else can erase them.
    pub fn new(
        config: EngineConfig,
        api: Arc<dyn JourneyApi>,
        tiers: StorageTiers,
        page: PageContext,
        now: DateTime<Utc>,
    ) -> Self {
        let (session, resolution) = resolve_session_id(&tiers, config.session_timeout, now);
        let visitor = resolve_visitor_id(&tiers, resolution.is_new(), now);
        let entry = capture_entry(&page.url, &page.title, page.referrer.as_deref(), now);
        let traffic_source = classify_traffic(&entry);

        let journey = Journey {
            id: None,
            session_id: session.session_id.clone(),
            identity: visitor.clone(),
            traffic_source,
            location: page.location,
            device: page.device,
            journey: JourneyPath {
                entry_page: page.url.clone(),
                current_page: page.url.clone(),
                pages: vec![PageVisit::new(&page.url, &page.title)],
                page_views: 1,
                bounce_rate: 0.0,
            },
            intent: None,
            engagement: Engagement {
                is_returning: visitor.is_returning,
                visit_count: visitor.visit_count,
                engagement_score: 0,
                conversion_events: Vec::new(),
                bounce_events: Vec::new(),
                chat_interactions: 0,
                interaction_counts: Default::default(),
            },
            session: SessionInfo {
                start_time: session.start_time,
                end_time: None,
                duration: None,
                is_active: true,
                last_activity: now,
            },
        };

        let state = SessionState {
            phase: SessionPhase::Creating,
            journey,
            journey_id: None,
            queue: EventQueue::new(),
            scroll: ScrollTracker::new(config.scroll_debounce),
            page_time: PageTimeTracker::new(now),
            interactions: InteractionTracker::new(config.interaction_sync_debounce),
            navigation: NavigationObserver::new(&page.url),
            page_interaction_base: 0,
            conversion_config: None,
            selector_validation: SelectorValidation::new(),
        };

        Self {
            inner: Arc::new(EngineInner {
                config,
                api,
                tiers,
                active: ActiveFlag::new(),
                state: Mutex::new(state),
                tasks: Mutex::new(Vec::new()),
            }),
            entry: Arc::new(entry),
        }
    }

    /// Create or resume the remote journey record, replay queued events in
    /// arrival order, fetch conversion config, and start periodic syncs.
    pub async fn initialize(&self, now: DateTime<Utc>) {
        let session_id = self.inner.state.lock().journey.session_id.clone();

        let existing = match self.inner.api.get_journey_by_session(&session_id).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "Journey lookup failed, creating fresh record");
                None
            }
        };

        let mut resumed = false;
        let journey_id = match existing {
            Some(remote) if remote.session.is_active => {
                debug!(session_id = %session_id, "Resuming active remote journey");
                self.adopt_remote(&remote);
                resumed = true;
                remote.id
            }
            Some(remote) => {
                let ended_recently = remote
                    .session
                    .end_time
                    .map(|end| {
                        let age = now.signed_duration_since(end);
                        age >= chrono::Duration::zero()
                            && age.to_std().map(|a| a < self.inner.config.resume_suppression)
                                .unwrap_or(false)
                    })
                    .unwrap_or(false);

                if ended_recently {
                    // A just-closed record is never reactivated; that would
                    // resurrect zombie sessions from rapid tab toggling.
                    info!(session_id = %session_id, "Prior session ended moments ago, minting new session");
                    let rotated = rotate_session_id(&self.inner.tiers, now);
                    {
                        let mut state = self.inner.state.lock();
                        state.journey.session_id = rotated.session_id;
                        state.journey.session.start_time = rotated.start_time;
                    }
                    self.create_remote().await
                } else {
                    debug!(session_id = %session_id, "Reactivating prior journey within session window");
                    self.adopt_remote(&remote);
                    resumed = true;
                    if let Some(id) = remote.id.as_deref() {
                        let reactivate = fields(&[
                            ("session.is_active", json!(true)),
                            ("session.end_time", json!(null)),
                        ]);
                        if let Err(err) = self.retry_update(id, reactivate).await {
                            warn!(error = %err, "Failed to reactivate journey");
                        }
                    }
                    remote.id
                }
            }
            None => self.create_remote().await,
        };

        let Some(journey_id) = journey_id else {
            // Creation failed after retries; the queue keeps buffering and a
            // later entry point may not succeed either, but the host page is
            // unaffected.
            warn!("No remote journey record; tracking stays queued");
            return;
        };

        let (queued, resume_update) = {
            let mut state = self.inner.state.lock();
            state.journey_id = Some(journey_id.clone());
            state.journey.id = Some(journey_id.clone());
            state.phase = SessionPhase::Active;
            let resume_update = resumed.then(|| {
                (
                    fields(&[
                        ("journey.current_page", json!(state.journey.journey.current_page)),
                        ("journey.page_views", json!(state.journey.journey.page_views)),
                    ]),
                    state.journey.journey.pages.last().cloned(),
                )
            });
            (state.queue.drain(), resume_update)
        };

        // A resumed record has not yet seen this page load.
        if let Some((update, page)) = resume_update {
            if let Err(err) = self.retry_update(&journey_id, update).await {
                warn!(error = %err, "Resume page-view update dropped");
            }
            if let Some(page) = page {
                let api = self.inner.api.clone();
                let result = self
                    .inner
                    .config
                    .retry
                    .execute("resume_add_page", |_| {
                        let api = api.clone();
                        let id = journey_id.clone();
                        let page = page.clone();
                        async move { api.add_page_to_journey(&id, &page).await }
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "Resume page append dropped");
                }
            }
        }

        for event in queued {
            self.replay_event(&journey_id, event).await;
        }

        self.load_conversion_config().await;
        self.spawn_score_sync();
    }

    /// Track a page view. Buffered before the remote record exists,
    /// otherwise applied locally and written through.
    pub fn track_page_view(&self, url: &str, title: &str, now: DateTime<Utc>) {
        if !self.inner.active.is_active() {
            debug!("Ignoring page view after session end");
            return;
        }

        let pending = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionPhase::Creating => {
                    state.queue.push(QueuedEvent::PageView {
                        url: url.to_string(),
                        title: title.to_string(),
                        timestamp: now,
                    });
                    None
                }
                SessionPhase::Active => {
                    let journey_id = state.journey_id.clone();
                    let update = apply_page_view(&mut state, url, title, now);
                    journey_id.map(|id| (id, update))
                }
                SessionPhase::Ended => None,
            }
        };

        if let Some((journey_id, update)) = pending {
            self.spawn_page_write(journey_id, update);
        }
    }

    /// Track a chat interaction.
    pub fn track_chat_interaction(&self, interaction_type: &str, now: DateTime<Utc>) {
        if !self.inner.active.is_active() {
            debug!("Ignoring chat interaction after session end");
            return;
        }

        let pending = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionPhase::Creating => {
                    state.queue.push(QueuedEvent::ChatInteraction {
                        interaction_type: interaction_type.to_string(),
                        timestamp: now,
                    });
                    None
                }
                SessionPhase::Active => {
                    state.journey.engagement.chat_interactions += 1;
                    state.journey.session.last_activity = now;
                    let count = state.journey.engagement.chat_interactions;
                    state.journey_id.clone().map(|id| (id, count))
                }
                SessionPhase::Ended => None,
            }
        };

        if let Some((journey_id, count)) = pending {
            let update = fields(&[("engagement.chat_interactions", json!(count))]);
            self.spawn_guarded_update(journey_id, update, "chat_interaction");
        }
    }

    /// Track a conversion event.
    pub fn track_conversion_event(&self, event: ConversionEvent, now: DateTime<Utc>) {
        if !self.inner.active.is_active() {
            debug!("Ignoring conversion after session end");
            return;
        }

        let pending = {
            let mut state = self.inner.state.lock();
            match state.phase {
                SessionPhase::Creating => {
                    state.queue.push(QueuedEvent::Conversion(event));
                    None
                }
                SessionPhase::Active => {
                    state.journey.engagement.conversion_events.push(event.clone());
                    state.journey.session.last_activity = now;
                    state.journey_id.clone().map(|id| (id, event))
                }
                SessionPhase::Ended => None,
            }
        };

        if let Some((journey_id, event)) = pending {
            let inner = self.inner.clone();
            self.spawn(async move {
                let api = inner.api.clone();
                let result = inner
                    .active
                    .guard(inner.config.retry.execute("conversion", |_| {
                        let api = api.clone();
                        let id = journey_id.clone();
                        let event = event.clone();
                        async move { api.add_conversion_event(&id, &event).await }
                    }))
                    .await;
                if let Some(Err(err)) = result {
                    warn!(error = %err, "Conversion event dropped");
                }
            });
        }
    }

    /// Feed a raw scroll sample from the host.
    pub fn on_scroll(
        &self,
        scroll_top: f64,
        viewport_height: f64,
        document_height: f64,
        now: DateTime<Utc>,
    ) {
        if !self.inner.active.is_active() {
            return;
        }

        let pending = {
            let mut state = self.inner.state.lock();
            let update = state
                .scroll
                .observe(scroll_top, viewport_height, document_height, now);
            match update {
                Some(update) => {
                    state.journey.session.last_activity = now;
                    let depth = update.depth_pct;
                    if let Some(page) = state.journey.journey.pages.last_mut() {
                        page.scroll_depth = depth;
                    }
                    if update.milestones.is_empty() {
                        None
                    } else {
                        let index = state.journey.journey.pages.len().saturating_sub(1);
                        state
                            .journey_id
                            .clone()
                            .map(|id| (id, index, depth))
                    }
                }
                None => None,
            }
        };

        if let Some((journey_id, index, depth)) = pending {
            let update = fields(&[(
                &format!("journey.pages.{index}.scroll_depth"),
                json!(depth),
            )]);
            self.spawn_guarded_update(journey_id, update, "scroll_depth");
        }
    }

    /// Feed a visibility transition. Going hidden ends the session through
    /// the beacon channel; the record can be resumed by a later initialize
    /// within the session window.
    pub async fn on_visibility(&self, visible: bool, now: DateTime<Utc>) {
        if visible {
            if self.inner.active.is_active() {
                self.inner.state.lock().page_time.on_visibility(true, now);
            }
            return;
        }
        self.inner.state.lock().page_time.on_visibility(false, now);
        self.end_session(EndTrigger::VisibilityHidden, now).await;
    }

    /// Record an interaction and schedule the trailing-debounce sync.
    pub fn on_interaction(&self, kind: InteractionKind, now: DateTime<Utc>) {
        if !self.inner.active.is_active() {
            return;
        }

        let generation = {
            let mut state = self.inner.state.lock();
            let generation = state.interactions.record(kind, now);
            state.journey.engagement.interaction_counts = state.interactions.counts();
            state.journey.session.last_activity = now;
            generation
        };

        let inner = self.inner.clone();
        let debounce = self.inner.config.interaction_sync_debounce;
        self.spawn(async move {
            tokio::time::sleep(debounce).await;
            sync_interactions(&inner, generation, Utc::now()).await;
        });
    }

    /// Feed a host-observed navigation event. Deduplicated same-URL events
    /// are dropped; real route changes become page views.
    pub fn on_navigation(&self, event: NavigationEvent, now: DateTime<Utc>) {
        let change = {
            let mut state = self.inner.state.lock();
            state.navigation.observe(event)
        };
        if let Some(change) = change {
            self.track_page_view(&change.url, &change.title, now);
        }
    }

    /// A conversion goal selector the host could not resolve. Reported to
    /// the backend once per goal so the operator can fix the config, then
    /// skipped.
    pub fn report_missing_selector(&self, goal_id: &str) {
        let pending = {
            let mut state = self.inner.state.lock();
            if !state.selector_validation.should_report(goal_id) {
                return;
            }
            state.journey_id.clone()
        };

        let Some(journey_id) = pending else {
            return;
        };
        let update = fields(&[(
            &format!("validation.conversion_selectors.{goal_id}"),
            json!("selector_not_found"),
        )]);
        self.spawn_guarded_update(journey_id, update, "selector_validation");
    }

    /// End the session. Idempotent: only the first trigger performs the
    /// transition, later ones are no-ops.
    pub async fn end_session(&self, trigger: EndTrigger, now: DateTime<Utc>) {
        // The flag flip and the end-time freeze happen synchronously, before
        // any await, so every in-flight writer sees a stable decision.
        if !self.inner.active.deactivate() {
            debug!(?trigger, "Session already ended");
            return;
        }

        let (journey_id, critical, bounce_event) = {
            let mut state = self.inner.state.lock();
            state.phase = SessionPhase::Ended;
            state.journey.session.is_active = false;
            state.journey.session.end_time = Some(now);

            let time_spent = state.page_time.flush(now);
            let scroll_depth = state.scroll.depth_pct();
            let interactions_total = state.interactions.total();
            let base = state.page_interaction_base;
            if let Some(page) = state.journey.journey.pages.last_mut() {
                page.time_spent = time_spent;
                page.scroll_depth = scroll_depth;
                page.interactions = interactions_total.saturating_sub(base);
            }

            let duration_secs = (now - state.journey.session.start_time)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            state.journey.session.duration = Some(duration_secs);

            let page_views = state.journey.journey.page_views;
            let score = compute_engagement_score(
                page_views,
                duration_secs,
                interactions_total,
                state.journey.engagement.chat_interactions,
            );
            state.journey.engagement.engagement_score = score;

            let bounce = classify_bounce(page_views, duration_secs, scroll_depth);
            let bounce_event = bounce.map(|kind| BounceEvent {
                kind,
                duration_secs,
                scroll_depth,
                timestamp: now,
            });
            if let Some(event) = &bounce_event {
                state.journey.engagement.bounce_events.push(event.clone());
            }
            state.journey.journey.bounce_rate = if bounce.is_some() { 1.0 } else { 0.0 };

            let critical = CriticalData {
                session_id: state.journey.session_id.clone(),
                engagement_score: score,
                page_views,
                duration_secs,
                bounce,
                bounce_rate: state.journey.journey.bounce_rate,
                is_active: false,
                end_time: now,
            };
            (state.journey_id.clone(), critical, bounce_event)
        };

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let Some(journey_id) = journey_id else {
            debug!("Session ended before remote record existed; nothing to deliver");
            return;
        };

        info!(
            journey_id = %journey_id,
            ?trigger,
            score = critical.engagement_score,
            bounce = ?critical.bounce,
            "Session ended"
        );

        if trigger.is_teardown() {
            let channel = GuaranteedBeaconChannel::new(self.inner.api.clone());
            if let Err(err) = channel.deliver(&journey_id, &critical).await {
                warn!(error = %err, "Beacon delivery failed");
            }
        } else {
            if let Some(event) = &bounce_event {
                let api = self.inner.api.clone();
                let result = self
                    .inner
                    .config
                    .retry
                    .execute("bounce_event", |_| {
                        let api = api.clone();
                        let id = journey_id.clone();
                        let event = event.clone();
                        async move { api.add_bounce_event(&id, &event).await }
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "Bounce event dropped");
                }
            }
            let channel =
                RetryingAsyncChannel::new(self.inner.api.clone(), self.inner.config.retry);
            if let Err(err) = channel.deliver(&journey_id, &critical).await {
                warn!(error = %err, "Final delivery failed");
            }
        }
    }

    /// Explicitly tear the engine down.
    pub async fn destroy(&self, now: DateTime<Utc>) {
        self.end_session(EndTrigger::Destroy, now).await;
    }

    /// The entry snapshot frozen at construction.
    pub fn entry(&self) -> &EntrySnapshot {
        &self.entry
    }

    pub fn session_id(&self) -> String {
        self.inner.state.lock().journey.session_id.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.is_active()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Snapshot of the authoritative journey record.
    pub fn journey(&self) -> Journey {
        self.inner.state.lock().journey.clone()
    }

    /// Conversion goals loaded at initialize; empty when the feature is
    /// disabled.
    pub fn conversion_goals(&self) -> Vec<crate::conversion::ConversionGoal> {
        self.inner
            .state
            .lock()
            .conversion_config
            .as_ref()
            .map(|c| c.goals.clone())
            .unwrap_or_default()
    }

    // ---- internals ----

    /// Adopt counters from a resumed remote record so scoring continues
    /// from where the prior page load left off.
    fn adopt_remote(&self, remote: &Journey) {
        let mut state = self.inner.state.lock();
        state.journey.journey.page_views = remote.journey.page_views.saturating_add(1);
        state.journey.journey.entry_page = remote.journey.entry_page.clone();
        state.journey.journey.pages = remote.journey.pages.clone();
        state
            .journey
            .journey
            .pages
            .push(PageVisit::new(&self.entry.url, &self.entry.title));
        state.journey.engagement.chat_interactions = remote.engagement.chat_interactions;
        state.journey.engagement.conversion_events = remote.engagement.conversion_events.clone();
        state.journey.session.start_time = remote.session.start_time;
    }

    async fn create_remote(&self) -> Option<String> {
        let journey = self.inner.state.lock().journey.clone();
        let api = self.inner.api.clone();
        let result = self
            .inner
            .config
            .retry
            .execute("create_journey", |_| {
                let api = api.clone();
                let journey = journey.clone();
                async move { api.create_journey(&journey).await }
            })
            .await;
        match result {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %err, "Journey creation failed");
                None
            }
        }
    }

    async fn replay_event(&self, journey_id: &str, event: QueuedEvent) {
        match event {
            QueuedEvent::PageView {
                url,
                title,
                timestamp,
            } => {
                let update = {
                    let mut state = self.inner.state.lock();
                    apply_page_view(&mut state, &url, &title, timestamp)
                };
                self.page_write(journey_id.to_string(), update).await;
            }
            QueuedEvent::ChatInteraction { timestamp, .. } => {
                let count = {
                    let mut state = self.inner.state.lock();
                    state.journey.engagement.chat_interactions += 1;
                    state.journey.session.last_activity = timestamp;
                    state.journey.engagement.chat_interactions
                };
                let update = fields(&[("engagement.chat_interactions", json!(count))]);
                if let Err(err) = self.retry_update(journey_id, update).await {
                    warn!(error = %err, "Queued chat interaction dropped");
                }
            }
            QueuedEvent::Conversion(event) => {
                {
                    let mut state = self.inner.state.lock();
                    state.journey.engagement.conversion_events.push(event.clone());
                }
                let api = self.inner.api.clone();
                let result = self
                    .inner
                    .config
                    .retry
                    .execute("queued_conversion", |_| {
                        let api = api.clone();
                        let id = journey_id.to_string();
                        let event = event.clone();
                        async move { api.add_conversion_event(&id, &event).await }
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "Queued conversion dropped");
                }
            }
        }
    }

    async fn load_conversion_config(&self) {
        let Some(org_id) = self.inner.config.organization_id.clone() else {
            // Feature disabled, not an error.
            debug!("No organization id; conversion tracking disabled");
            return;
        };
        match self.inner.api.get_conversion_config(&org_id).await {
            Ok(Some(config)) => {
                self.inner.state.lock().conversion_config = Some(config);
            }
            Ok(None) => {
                debug!(org_id = %org_id, "No conversion config for organization");
            }
            Err(err) => {
                warn!(error = %err, "Conversion config fetch failed; feature disabled");
            }
        }
    }

    fn spawn_score_sync(&self) {
        let inner = self.inner.clone();
        let interval = self.inner.config.score_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !inner.active.is_active() {
                    break;
                }
                sync_score(&inner, Utc::now()).await;
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn spawn_page_write(&self, journey_id: String, update: PageViewUpdate) {
        let engine = self.clone();
        self.spawn(async move {
            engine.page_write(journey_id, update).await;
        });
    }

    async fn page_write(&self, journey_id: String, update: PageViewUpdate) {
        let mut field_pairs = vec![
            ("journey.current_page".to_string(), json!(update.new_page.url)),
            ("journey.page_views".to_string(), json!(update.page_views)),
        ];
        if let Some((index, prev)) = &update.finalized {
            field_pairs.push((
                format!("journey.pages.{index}.time_spent"),
                json!(prev.time_spent),
            ));
            field_pairs.push((
                format!("journey.pages.{index}.scroll_depth"),
                json!(prev.scroll_depth),
            ));
            field_pairs.push((
                format!("journey.pages.{index}.interactions"),
                json!(prev.interactions),
            ));
        }
        let update_fields: JourneyFields = field_pairs.into_iter().collect();

        if let Err(err) = self.retry_update(&journey_id, update_fields).await {
            warn!(error = %err, "Page field update dropped");
        }

        let api = self.inner.api.clone();
        let page = update.new_page.clone();
        let result = self
            .inner
            .active
            .guard(self.inner.config.retry.execute("add_page", |_| {
                let api = api.clone();
                let id = journey_id.clone();
                let page = page.clone();
                async move { api.add_page_to_journey(&id, &page).await }
            }))
            .await;
        if let Some(Err(err)) = result {
            warn!(error = %err, "Page append dropped");
        }
    }

    async fn retry_update(
        &self,
        journey_id: &str,
        update: JourneyFields,
    ) -> Result<(), crate::error::TelemetryError> {
        let api = self.inner.api.clone();
        self.inner
            .config
            .retry
            .execute("update_journey", |_| {
                let api = api.clone();
                let id = journey_id.to_string();
                let update = update.clone();
                async move { api.update_journey(&id, &update).await }
            })
            .await
    }

    fn spawn_guarded_update(&self, journey_id: String, update: JourneyFields, label: &'static str) {
        let inner = self.inner.clone();
        self.spawn(async move {
            let api = inner.api.clone();
            let result = inner
                .active
                .guard(inner.config.retry.execute(label, |_| {
                    let api = api.clone();
                    let id = journey_id.clone();
                    let update = update.clone();
                    async move { api.update_journey(&id, &update).await }
                }))
                .await;
            if let Some(Err(err)) = result {
                warn!(error = %err, label, "Field update dropped");
            }
        });
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mut tasks = self.inner.tasks.lock();
            // Sweep completed writes so a long session does not accumulate
            // handles for every interaction.
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle.spawn(fut));
        } else {
            debug!("No async runtime; background write skipped");
        }
    }
}

/// Result of applying a page view to local state.
struct PageViewUpdate {
    new_page: PageVisit,
    page_views: u32,
    /// Index and frozen totals of the finalized previous page.
    finalized: Option<(usize, PageVisit)>,
}

/// Finalize the previous page and append the new one. The previous entry's
/// time/scroll/interaction totals are frozen before the new entry exists.
fn apply_page_view(
    state: &mut SessionState,
    url: &str,
    title: &str,
    now: DateTime<Utc>,
) -> PageViewUpdate {
    let time_spent = state.page_time.flush(now);
    let scroll_depth = state.scroll.depth_pct();
    let total = state.interactions.total();
    let page_interactions = total.saturating_sub(state.page_interaction_base);

    let finalized = state.journey.journey.pages.last_mut().map(|page| {
        page.time_spent = time_spent;
        page.scroll_depth = scroll_depth;
        page.interactions = page_interactions;
        page.clone()
    });
    let finalized_index = state.journey.journey.pages.len().saturating_sub(1);

    state.scroll.reset();
    state.page_interaction_base = total;

    let new_page = PageVisit::new(url, title);
    state.journey.journey.pages.push(new_page.clone());
    state.journey.journey.page_views += 1;
    state.journey.journey.current_page = url.to_string();
    state.journey.session.last_activity = now;

    PageViewUpdate {
        new_page,
        page_views: state.journey.journey.page_views,
        finalized: finalized.map(|page| (finalized_index, page)),
    }
}

/// Periodic score recomputation and sync. The guard discipline: check
/// before initiating, send, and re-check before committing the local
/// score so a session that ended mid-flight is left untouched.
async fn sync_score(inner: &Arc<EngineInner>, now: DateTime<Utc>) {
    if !inner.active.is_active() {
        return;
    }

    let (journey_id, score) = {
        let state = inner.state.lock();
        let Some(journey_id) = state.journey_id.clone() else {
            return;
        };
        let duration_secs = (now - state.journey.session.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let score = compute_engagement_score(
            state.journey.journey.page_views,
            duration_secs,
            state.interactions.total(),
            state.journey.engagement.chat_interactions,
        );
        (journey_id, score)
    };

    let update = fields(&[("engagement.engagement_score", json!(score))]);
    let api = inner.api.clone();
    let result = inner
        .config
        .retry
        .execute("score_sync", |_| {
            let api = api.clone();
            let id = journey_id.clone();
            let update = update.clone();
            async move { api.update_journey(&id, &update).await }
        })
        .await;

    if !inner.active.is_active() {
        // Ended while the write was in flight; the terminal score from
        // end_session is authoritative.
        return;
    }
    match result {
        Ok(()) => {
            inner.state.lock().journey.engagement.engagement_score = score;
        }
        Err(err) => warn!(error = %err, "Score sync dropped"),
    }
}

/// Trailing-debounce interaction sync. Runs only when no later interaction
/// superseded this generation.
async fn sync_interactions(inner: &Arc<EngineInner>, generation: u64, now: DateTime<Utc>) {
    let pending = {
        let mut state = inner.state.lock();
        if !state.interactions.sync_due(generation, now) {
            return;
        }
        let counts = state.interactions.take_snapshot();
        state.journey.engagement.interaction_counts = counts;
        state.journey_id.clone().map(|id| (id, counts))
    };

    let Some((journey_id, counts)) = pending else {
        return;
    };
    let update = fields(&[
        ("engagement.interaction_counts.clicks", json!(counts.clicks)),
        (
            "engagement.interaction_counts.form_interactions",
            json!(counts.form_interactions),
        ),
        (
            "engagement.interaction_counts.key_presses",
            json!(counts.key_presses),
        ),
        ("engagement.interaction_counts.total", json!(counts.total)),
    ]);

    let api = inner.api.clone();
    let result = inner
        .active
        .guard(inner.config.retry.execute("interaction_sync", |_| {
            let api = api.clone();
            let id = journey_id.clone();
            let update = update.clone();
            async move { api.update_journey(&id, &update).await }
        }))
        .await;
    if let Some(Err(err)) = result {
        warn!(error = %err, "Interaction sync dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{ConversionConfig, ConversionGoal};
    use crate::error::TelemetryError;
    use crate::types::SessionStatus;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Recording fake for the remote store.
    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<ApiCall>>,
        lookup: Mutex<Option<Journey>>,
        fail_writes: AtomicBool,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum ApiCall {
        Create,
        Update(Vec<String>),
        AddPage(String),
        AddConversion(String),
        AddBounce,
        SessionStatus(bool),
        Beacon,
        GetConfig,
    }

    impl RecordingApi {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().clone()
        }

        fn check_fail(&self) -> Result<(), TelemetryError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(TelemetryError::MissingJourney)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl JourneyApi for RecordingApi {
        async fn create_journey(&self, _journey: &Journey) -> Result<String, TelemetryError> {
            self.check_fail()?;
            self.calls.lock().push(ApiCall::Create);
            Ok("j-1".to_string())
        }

        async fn update_journey(
            &self,
            _id: &str,
            update: &JourneyFields,
        ) -> Result<(), TelemetryError> {
            self.check_fail()?;
            let keys = update.keys().cloned().collect();
            self.calls.lock().push(ApiCall::Update(keys));
            Ok(())
        }

        async fn add_page_to_journey(
            &self,
            _id: &str,
            page: &PageVisit,
        ) -> Result<(), TelemetryError> {
            self.check_fail()?;
            self.calls.lock().push(ApiCall::AddPage(page.url.clone()));
            Ok(())
        }

        async fn add_conversion_event(
            &self,
            _id: &str,
            event: &ConversionEvent,
        ) -> Result<(), TelemetryError> {
            self.check_fail()?;
            self.calls
                .lock()
                .push(ApiCall::AddConversion(event.goal_id.clone()));
            Ok(())
        }

        async fn add_bounce_event(
            &self,
            _id: &str,
            _event: &BounceEvent,
        ) -> Result<(), TelemetryError> {
            self.check_fail()?;
            self.calls.lock().push(ApiCall::AddBounce);
            Ok(())
        }

        async fn update_session_status(
            &self,
            _id: &str,
            status: &SessionStatus,
        ) -> Result<(), TelemetryError> {
            self.check_fail()?;
            self.calls
                .lock()
                .push(ApiCall::SessionStatus(status.is_active));
            Ok(())
        }

        async fn get_journey_by_session(
            &self,
            _session_id: &str,
        ) -> Result<Option<Journey>, TelemetryError> {
            Ok(self.lookup.lock().clone())
        }

        fn sync_critical_data_beacon(&self, _id: &str, _critical: &CriticalData) -> bool {
            self.calls.lock().push(ApiCall::Beacon);
            true
        }

        async fn get_conversion_config(
            &self,
            _org_id: &str,
        ) -> Result<Option<ConversionConfig>, TelemetryError> {
            self.calls.lock().push(ApiCall::GetConfig);
            Ok(Some(ConversionConfig {
                goals: vec![ConversionGoal {
                    id: "g1".to_string(),
                    name: "Signup".to_string(),
                    selector: Some("#signup".to_string()),
                    event_type: "click".to_string(),
                    value: None,
                }],
            }))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn page() -> PageContext {
        PageContext {
            url: "https://app.example.com/".to_string(),
            title: "Home".to_string(),
            referrer: None,
            device: None,
            location: None,
        }
    }

    fn engine(api: Arc<RecordingApi>) -> PulseEngine {
        PulseEngine::new(
            EngineConfig::new("https://api.example.com"),
            api,
            StorageTiers::in_memory(),
            page(),
            t0(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn queued_events_replay_in_arrival_order() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());

        // All of these arrive before the remote record exists.
        engine.track_page_view("https://app.example.com/a", "A", t0());
        engine.track_chat_interaction("opened", t0());
        engine.track_conversion_event(
            ConversionEvent {
                goal_id: "g1".to_string(),
                event_type: "click".to_string(),
                timestamp: t0(),
                value: None,
            },
            t0(),
        );
        engine.track_page_view("https://app.example.com/b", "B", t0());
        assert_eq!(engine.phase(), SessionPhase::Creating);

        engine.initialize(t0()).await;
        assert_eq!(engine.phase(), SessionPhase::Active);

        let calls = api.calls();
        assert_eq!(calls[0], ApiCall::Create);
        // Page view A: field update then page append.
        assert!(matches!(&calls[1], ApiCall::Update(_)));
        assert_eq!(calls[2], ApiCall::AddPage("https://app.example.com/a".to_string()));
        // Chat, then conversion, then page view B: strict arrival order.
        assert!(matches!(&calls[3], ApiCall::Update(keys) if keys.contains(&"engagement.chat_interactions".to_string())));
        assert_eq!(calls[4], ApiCall::AddConversion("g1".to_string()));
        assert!(matches!(&calls[5], ApiCall::Update(_)));
        assert_eq!(calls[6], ApiCall::AddPage("https://app.example.com/b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn ending_twice_is_idempotent() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine
            .end_session(EndTrigger::Destroy, t0() + chrono::Duration::seconds(120))
            .await;
        let calls_after_first = api.calls().len();
        let journey_after_first = engine.journey();

        engine
            .end_session(EndTrigger::Destroy, t0() + chrono::Duration::seconds(125))
            .await;
        assert_eq!(api.calls().len(), calls_after_first);
        // End time and score were frozen by the first call.
        assert_eq!(
            engine.journey().session.end_time,
            journey_after_first.session.end_time
        );
        assert_eq!(engine.journey().engagement.bounce_events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_trigger_uses_beacon_channel() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine
            .end_session(EndTrigger::PageHide, t0() + chrono::Duration::seconds(60))
            .await;

        let calls = api.calls();
        assert!(calls.contains(&ApiCall::Beacon));
        assert!(!calls.iter().any(|c| matches!(c, ApiCall::SessionStatus(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_destroy_uses_retrying_async_channel() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine
            .destroy(t0() + chrono::Duration::seconds(400))
            .await;

        let calls = api.calls();
        assert!(calls.contains(&ApiCall::SessionStatus(false)));
        assert!(!calls.contains(&ApiCall::Beacon));
    }

    #[tokio::test(start_paused = true)]
    async fn bounce_recorded_for_short_single_page_session() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine
            .destroy(t0() + chrono::Duration::seconds(2))
            .await;

        let journey = engine.journey();
        assert_eq!(journey.engagement.bounce_events.len(), 1);
        assert_eq!(
            journey.engagement.bounce_events[0].kind,
            crate::types::BounceKind::Immediate
        );
        assert_eq!(journey.journey.bounce_rate, 1.0);
        assert!(api.calls().contains(&ApiCall::AddBounce));
    }

    #[tokio::test(start_paused = true)]
    async fn multi_page_session_does_not_bounce() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine.track_page_view("https://app.example.com/b", "B", t0() + chrono::Duration::seconds(1));
        engine
            .destroy(t0() + chrono::Duration::seconds(2))
            .await;

        let journey = engine.journey();
        assert!(journey.engagement.bounce_events.is_empty());
        assert_eq!(journey.journey.bounce_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_after_end_is_dropped() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;
        engine.destroy(t0() + chrono::Duration::seconds(10)).await;

        let before = engine.journey();
        engine.track_page_view("https://app.example.com/late", "Late", t0() + chrono::Duration::seconds(11));
        engine.track_chat_interaction("late", t0() + chrono::Duration::seconds(11));
        let after = engine.journey();

        assert_eq!(before.journey.page_views, after.journey.page_views);
        assert_eq!(
            before.engagement.chat_interactions,
            after.engagement.chat_interactions
        );
    }

    #[tokio::test(start_paused = true)]
    async fn score_sync_after_end_does_not_mutate_journey() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        let end = t0() + chrono::Duration::seconds(30);
        engine.destroy(end).await;
        let frozen_score = engine.journey().engagement.engagement_score;

        // Simulate a periodic write that fires after the session ended.
        sync_score(&engine.inner, end + chrono::Duration::seconds(30)).await;
        assert_eq!(engine.journey().engagement.engagement_score, frozen_score);
    }

    #[tokio::test(start_paused = true)]
    async fn recently_ended_remote_record_mints_new_session() {
        let api = RecordingApi::new();
        let tiers = StorageTiers::in_memory();
        let config = EngineConfig::new("https://api.example.com");

        let first = PulseEngine::new(config.clone(), api.clone(), tiers, page(), t0());
        let original_session = first.session_id();

        // Remote record for this session ended 2 seconds ago.
        let mut remote = first.journey();
        remote.id = Some("j-old".to_string());
        remote.session.is_active = false;
        remote.session.end_time = Some(t0() - chrono::Duration::seconds(2));
        *api.lookup.lock() = Some(remote);

        first.initialize(t0()).await;
        assert_ne!(first.session_id(), original_session);
        assert!(api.calls().contains(&ApiCall::Create));
    }

    #[tokio::test(start_paused = true)]
    async fn active_remote_record_is_resumed() {
        let api = RecordingApi::new();
        let tiers = StorageTiers::in_memory();
        let config = EngineConfig::new("https://api.example.com");

        let engine = PulseEngine::new(config, api.clone(), tiers, page(), t0());
        let session_id = engine.session_id();

        let mut remote = engine.journey();
        remote.id = Some("j-prior".to_string());
        remote.journey.page_views = 3;
        remote.engagement.chat_interactions = 2;
        remote.session.is_active = true;
        *api.lookup.lock() = Some(remote);

        engine.initialize(t0()).await;

        // Same session, no new create call, counters continue, and the
        // remote record learns about this page load.
        assert_eq!(engine.session_id(), session_id);
        assert!(!api.calls().contains(&ApiCall::Create));
        assert!(api
            .calls()
            .contains(&ApiCall::AddPage("https://app.example.com/".to_string())));
        let journey = engine.journey();
        assert_eq!(journey.id.as_deref(), Some("j-prior"));
        assert_eq!(journey.journey.page_views, 4);
        assert_eq!(journey.engagement.chat_interactions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_ended_remote_record_is_reactivated() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        let session_id = engine.session_id();

        let mut remote = engine.journey();
        remote.id = Some("j-prior".to_string());
        remote.session.is_active = false;
        remote.session.end_time = Some(t0() - chrono::Duration::minutes(10));
        *api.lookup.lock() = Some(remote);

        engine.initialize(t0()).await;

        assert_eq!(engine.session_id(), session_id);
        assert!(!api.calls().contains(&ApiCall::Create));
        assert!(api
            .calls()
            .iter()
            .any(|c| matches!(c, ApiCall::Update(keys) if keys.contains(&"session.is_active".to_string()))));
    }

    #[tokio::test(start_paused = true)]
    async fn page_views_accumulate_and_previous_page_is_finalized() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine.on_interaction(InteractionKind::Click, t0() + chrono::Duration::seconds(5));
        engine.track_page_view(
            "https://app.example.com/pricing",
            "Pricing",
            t0() + chrono::Duration::seconds(30),
        );

        let journey = engine.journey();
        assert_eq!(journey.journey.page_views, 2);
        assert_eq!(journey.journey.pages.len(), 2);
        // First page frozen with its dwell time and interaction count.
        let first = &journey.journey.pages[0];
        assert!((first.time_spent - 30.0).abs() < 0.001);
        assert_eq!(first.interactions, 1);
        assert_eq!(journey.journey.current_page, "https://app.example.com/pricing");
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_events_dedupe_same_url() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        let event = NavigationEvent {
            url: "https://app.example.com/".to_string(),
            title: "Home".to_string(),
            kind: crate::trackers::NavigationKind::Replace,
        };
        engine.on_navigation(event, t0() + chrono::Duration::seconds(1));
        assert_eq!(engine.journey().journey.page_views, 1);

        let event = NavigationEvent {
            url: "https://app.example.com/docs".to_string(),
            title: "Docs".to_string(),
            kind: crate::trackers::NavigationKind::Push,
        };
        engine.on_navigation(event, t0() + chrono::Duration::seconds(2));
        assert_eq!(engine.journey().journey.page_views, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_keeps_tracking_queued_and_page_unharmed() {
        let api = RecordingApi::new();
        api.fail_writes.store(true, Ordering::SeqCst);
        let engine = engine(api.clone());

        engine.track_page_view("https://app.example.com/a", "A", t0());
        engine.initialize(t0()).await;

        // Creation failed after retries; still in Creating, nothing panicked.
        assert_eq!(engine.phase(), SessionPhase::Creating);
    }

    #[tokio::test(start_paused = true)]
    async fn conversion_config_loaded_when_org_configured() {
        let api = RecordingApi::new();
        let engine = PulseEngine::new(
            EngineConfig::new("https://api.example.com").with_organization_id("org-1"),
            api.clone(),
            StorageTiers::in_memory(),
            page(),
            t0(),
        );
        engine.initialize(t0()).await;

        assert!(api.calls().contains(&ApiCall::GetConfig));
        assert_eq!(engine.conversion_goals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_org_id_disables_conversion_config() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        assert!(!api.calls().contains(&ApiCall::GetConfig));
        assert!(engine.conversion_goals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_selector_reported_once() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine.report_missing_selector("g1");
        engine.report_missing_selector("g1");
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let reports = api
            .calls()
            .iter()
            .filter(|c| {
                matches!(c, ApiCall::Update(keys)
                    if keys.iter().any(|k| k.starts_with("validation.conversion_selectors")))
            })
            .count();
        assert_eq!(reports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_background_tasks_are_swept() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        for i in 0..20i64 {
            engine.on_interaction(
                InteractionKind::Click,
                t0() + chrono::Duration::milliseconds(i),
            );
        }
        // Let every debounced sync task run to completion.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        engine.on_interaction(InteractionKind::Click, t0() + chrono::Duration::seconds(10));
        // Only the periodic score task and the newest sync may remain.
        assert!(engine.inner.tasks.lock().len() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_hidden_ends_session_via_beacon() {
        let api = RecordingApi::new();
        let engine = engine(api.clone());
        engine.initialize(t0()).await;

        engine
            .on_visibility(false, t0() + chrono::Duration::seconds(45))
            .await;

        assert!(!engine.is_active());
        assert!(api.calls().contains(&ApiCall::Beacon));
    }

    #[test]
    fn construction_captures_entry_and_traffic_synchronously() {
        let api = RecordingApi::new();
        let engine = PulseEngine::new(
            EngineConfig::new("https://api.example.com"),
            api,
            StorageTiers::in_memory(),
            PageContext {
                url: "https://app.example.com/?utm_source=newsletter&utm_medium=email".to_string(),
                title: "Home".to_string(),
                referrer: Some("https://www.google.com/search?q=widgets".to_string()),
                device: None,
                location: None,
            },
            t0(),
        );

        // UTM classification wins over the search referrer; the snapshot is
        // frozen before any navigation.
        let journey = engine.journey();
        assert_eq!(
            journey.traffic_source.source_type,
            crate::types::TrafficType::Email
        );
        assert_eq!(journey.traffic_source.source.as_deref(), Some("newsletter"));
        assert_eq!(engine.entry().title, "Home");
    }
}
