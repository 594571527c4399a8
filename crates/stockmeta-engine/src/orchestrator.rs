use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stockmeta_contracts::credentials::fingerprint;
use stockmeta_contracts::events::EventPayload;
use stockmeta_contracts::metadata::{extract, MetadataRecord};
use stockmeta_contracts::settings::{ReadySettings, SettingsStore};
use stockmeta_contracts::target::{AssetReference, Locator, Target, TargetId, WorkflowPatterns};

use crate::bridge::BridgeError;
use crate::config::EngineConfig;
use crate::error::AutomationError;
use crate::session::{Phase, Session};

pub const STATUS_CALLING_API: &str = "Processing image & calling API...";
pub const STATUS_FILLING: &str = "Metadata received, filling form...";
pub const STATUS_AWAITING_NAVIGATION: &str = "Submit succeeded, waiting for navigation...";
pub const STATUS_NEW_PAGE: &str = "New page loaded, waiting for elements...";
pub const STATUS_DISABLED: &str = "Automation stopped.";
pub const STATUS_NOT_ENABLED: &str = "Automation is not enabled. Enable it before starting.";

/// Everything the orchestrator reacts to: user commands, page signals and
/// results of requests it issued earlier.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Enable,
    Disable,
    GetState,
    StartAnalysis {
        candidate: Option<Target>,
    },
    SubmitAttempted {
        target: TargetId,
        success: bool,
        location: Option<Locator>,
    },
    AssetExtracted {
        target: TargetId,
        cycle: u64,
        result: Result<AssetReference, AutomationError>,
    },
    Generated {
        target: TargetId,
        cycle: u64,
        result: Result<String, AutomationError>,
    },
    FillDelivered {
        target: TargetId,
        cycle: u64,
        result: Result<(), BridgeError>,
    },
    TargetUpdated {
        target: TargetId,
        location: Locator,
        complete: bool,
    },
    TargetRemoved {
        target: TargetId,
    },
    SettleElapsed {
        target: TargetId,
        cycle: u64,
    },
    Shutdown,
}

/// Work requested by the orchestrator. Asynchronous effects carry the
/// `(target, cycle)` pair their result event must echo back.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ExtractAsset {
        target: TargetId,
        cycle: u64,
    },
    Generate {
        target: TargetId,
        cycle: u64,
        asset: AssetReference,
        credential: String,
        model: String,
    },
    Fill {
        target: TargetId,
        cycle: u64,
        record: MetadataRecord,
    },
    Settle {
        target: TargetId,
        cycle: u64,
        delay: Duration,
    },
    Status(String),
    Respond(Response),
    Log(LogEntry),
}

/// Synchronous answers to commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Enabled,
    Disabled,
    State { is_enabled: bool },
}

impl Response {
    pub fn payload(&self) -> Value {
        match self {
            Self::Enabled => json!({ "status": "enabled" }),
            Self::Disabled => json!({ "status": "disabled" }),
            Self::State { is_enabled } => json!({ "isEnabled": is_enabled }),
        }
    }
}

/// One line for the run's event log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub event: &'static str,
    pub payload: EventPayload,
}

impl LogEntry {
    fn new(event: &'static str, fields: Value) -> Self {
        let payload = match fields {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        Self { event, payload }
    }
}

pub struct Orchestrator {
    session: Session,
    settings: Arc<dyn SettingsStore>,
    patterns: WorkflowPatterns,
    settle_delay: Duration,
}

impl Orchestrator {
    pub fn new(settings: Arc<dyn SettingsStore>, config: &EngineConfig) -> Self {
        Self {
            session: Session::default(),
            settings,
            patterns: config.patterns.clone(),
            settle_delay: config.settle_delay,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Processes one event to completion and returns the effects to run.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Enable => self.enable(),
            Event::Disable => self.disable(),
            Event::GetState => vec![Effect::Respond(Response::State {
                is_enabled: self.session.enabled(),
            })],
            Event::StartAnalysis { candidate } => self.start_analysis(candidate),
            Event::SubmitAttempted {
                target,
                success,
                location,
            } => self.submit_attempted(target, success, location),
            Event::AssetExtracted {
                target,
                cycle,
                result,
            } => {
                if !self.expects(target, cycle, &Phase::Extracting) {
                    return self.discard("asset", target, cycle);
                }
                match result {
                    Ok(asset) => self.rotate_and_generate(target, asset),
                    Err(reason) => self.stop(reason),
                }
            }
            Event::Generated {
                target,
                cycle,
                result,
            } => {
                if !self.expects(target, cycle, &Phase::Generating) {
                    return self.discard("generation", target, cycle);
                }
                match result.and_then(|raw| extract(&raw).map_err(AutomationError::from)) {
                    Ok(record) => self.fill(target, record),
                    Err(reason) => self.stop(reason),
                }
            }
            Event::FillDelivered {
                target,
                cycle,
                result,
            } => {
                if !self.expects(target, cycle, &Phase::Filling) {
                    return self.discard("fill acknowledgement", target, cycle);
                }
                self.fill_delivered(target, result)
            }
            Event::TargetUpdated {
                target,
                location,
                complete,
            } => self.target_updated(target, location, complete),
            Event::TargetRemoved { target } => {
                if !self.session.owns(target) {
                    return Vec::new();
                }
                self.stop(AutomationError::TargetRemoved)
            }
            Event::SettleElapsed { target, cycle } => {
                if !self.expects(target, cycle, &Phase::Extracting) {
                    return self.discard("settle timer", target, cycle);
                }
                tracing::debug!(target_id = %target, cycle, "settle delay elapsed");
                vec![Effect::ExtractAsset { target, cycle }]
            }
            Event::Shutdown => {
                self.session.disarm();
                vec![Effect::Log(LogEntry::new("shutdown", json!({})))]
            }
        }
    }

    fn enable(&mut self) -> Vec<Effect> {
        self.session.arm();
        tracing::info!("automation enabled");
        vec![Effect::Respond(Response::Enabled), self.phase_changed()]
    }

    fn disable(&mut self) -> Vec<Effect> {
        let was_active = self.session.phase().is_active();
        self.session.disarm();
        tracing::info!(was_active, "automation disabled");
        vec![
            Effect::Respond(Response::Disabled),
            Effect::Status(STATUS_DISABLED.to_string()),
            self.phase_changed(),
        ]
    }

    fn start_analysis(&mut self, candidate: Option<Target>) -> Vec<Effect> {
        if !self.session.enabled() {
            tracing::warn!("start requested while automation is disabled");
            return vec![Effect::Status(STATUS_NOT_ENABLED.to_string())];
        }
        if self.session.phase().is_active() {
            tracing::warn!(
                phase = self.session.phase().name(),
                "start requested while a cycle is already running"
            );
            return Vec::new();
        }
        if let Err(reason) = self.load_ready() {
            return self.stop(reason);
        }
        let Some(target) = candidate.filter(|target| self.patterns.is_start(&target.location))
        else {
            return self.stop(AutomationError::NoQualifyingTarget);
        };

        tracing::info!(target_id = %target.id, location = %target.location, "starting analysis");
        let id = target.id;
        let cycle = self.session.begin(target);
        vec![self.phase_changed(), Effect::ExtractAsset { target: id, cycle }]
    }

    /// Rotation happens here, on every asset-ready, and the cursor is stored
    /// before the credential is handed out. A crash between the two skips a
    /// credential rather than reusing one.
    fn rotate_and_generate(&mut self, target: TargetId, asset: AssetReference) -> Vec<Effect> {
        let ready = match self.load_ready() {
            Ok(ready) => ready,
            Err(reason) => return self.stop(reason),
        };
        let rotation = match ready.pool.next(ready.last_used_index) {
            Ok(rotation) => rotation,
            Err(err) => return self.stop(err.into()),
        };
        if let Err(err) = self.settings.record_cursor(rotation.index) {
            return self.stop(AutomationError::Settings(format!("{err:#}")));
        }

        let key = fingerprint(&rotation.credential);
        tracing::info!(target_id = %target, index = rotation.index, key = %key, "credential rotated");
        let cycle = self.session.enter_generating();
        vec![
            Effect::Log(LogEntry::new(
                "credential_rotated",
                json!({ "index": rotation.index, "key": key, "pool_size": ready.pool.len() }),
            )),
            self.phase_changed(),
            Effect::Status(STATUS_CALLING_API.to_string()),
            Effect::Generate {
                target,
                cycle,
                asset,
                credential: rotation.credential,
                model: ready.model,
            },
        ]
    }

    fn fill(&mut self, target: TargetId, record: MetadataRecord) -> Vec<Effect> {
        let keywords = record.keyword_list().len();
        tracing::info!(target_id = %target, title = %record.title, keywords, "metadata received");
        let cycle = self.session.enter_filling();
        vec![
            Effect::Log(LogEntry::new(
                "generation_finished",
                json!({ "title": record.title, "keyword_count": keywords }),
            )),
            self.phase_changed(),
            Effect::Status(STATUS_FILLING.to_string()),
            Effect::Fill {
                target,
                cycle,
                record,
            },
        ]
    }

    fn fill_delivered(&mut self, target: TargetId, result: Result<(), BridgeError>) -> Vec<Effect> {
        match result {
            Ok(()) => {
                tracing::debug!(target_id = %target, "fill instruction delivered");
                Vec::new()
            }
            // Usually the page navigated under us; the submit or navigation
            // signal decides what happens next.
            Err(BridgeError::Undeliverable(detail)) => {
                tracing::warn!(target_id = %target, %detail, "fill instruction not delivered");
                vec![Effect::Log(LogEntry::new(
                    "fill_inconclusive",
                    json!({ "detail": detail }),
                ))]
            }
            Err(BridgeError::FieldsMissing(detail) | BridgeError::Unreachable(detail)) => {
                self.stop(AutomationError::FillFailed(detail))
            }
        }
    }

    fn submit_attempted(
        &mut self,
        target: TargetId,
        success: bool,
        location: Option<Locator>,
    ) -> Vec<Effect> {
        if !self.session.owns(target) {
            tracing::debug!(target_id = %target, success, "ignoring submit outcome");
            return Vec::new();
        }
        if !success {
            return self.stop(AutomationError::SubmitFailed);
        }
        if self.session.phase() != &Phase::Filling {
            tracing::debug!(
                target_id = %target,
                phase = self.session.phase().name(),
                "submit outcome outside filling"
            );
            return Vec::new();
        }
        let Some(location) = location.or_else(|| self.session.active_location().cloned()) else {
            return self.stop(AutomationError::NoQualifyingTarget);
        };
        tracing::info!(target_id = %target, location = %location, "submit dispatched");
        self.session.await_transition(location);
        vec![
            self.phase_changed(),
            Effect::Status(STATUS_AWAITING_NAVIGATION.to_string()),
        ]
    }

    fn target_updated(&mut self, target: TargetId, location: Locator, complete: bool) -> Vec<Effect> {
        if !complete || !self.session.owns(target) || !self.session.awaiting_transition() {
            return Vec::new();
        }
        if self.session.active_location() == Some(&location) {
            tracing::debug!(target_id = %target, location = %location, "same location, ignoring");
            return Vec::new();
        }
        if !self.patterns.is_next(&location) {
            return self.stop(AutomationError::UnexpectedNavigation(location.0));
        }

        tracing::info!(target_id = %target, location = %location, "navigated to next item");
        let cycle = self.session.confirm_transition(location);
        vec![
            self.phase_changed(),
            Effect::Status(STATUS_NEW_PAGE.to_string()),
            Effect::Settle {
                target,
                cycle,
                delay: self.settle_delay,
            },
        ]
    }

    fn load_ready(&self) -> Result<ReadySettings, AutomationError> {
        let settings = self
            .settings
            .load()
            .map_err(|err| AutomationError::Settings(format!("{err:#}")))?;
        Ok(settings.require()?)
    }

    fn expects(&self, target: TargetId, cycle: u64, phase: &Phase) -> bool {
        self.session.is_current(target, cycle) && self.session.phase() == phase
    }

    fn discard(&self, what: &str, target: TargetId, cycle: u64) -> Vec<Effect> {
        tracing::debug!(
            target_id = %target,
            cycle,
            current_cycle = self.session.cycle(),
            phase = self.session.phase().name(),
            "discarding stale {what}"
        );
        Vec::new()
    }

    fn stop(&mut self, reason: AutomationError) -> Vec<Effect> {
        tracing::warn!(kind = reason.kind(), error = %reason, "automation stopped");
        let status = reason.status_message();
        let entry = LogEntry::new(
            "session_stopped",
            json!({
                "reason": reason.kind(),
                "detail": reason.to_string(),
                "target": self.session.active_target().map(|target| target.0),
            }),
        );
        self.session.stop(reason);
        vec![Effect::Log(entry), self.phase_changed(), Effect::Status(status)]
    }

    fn phase_changed(&self) -> Effect {
        Effect::Log(LogEntry::new(
            "phase_changed",
            json!({
                "phase": self.session.phase().name(),
                "enabled": self.session.enabled(),
                "target": self.session.active_target().map(|target| target.0),
                "location": self.session.active_location().map(Locator::as_str),
                "cycle": self.session.cycle(),
            }),
        ))
    }
}
