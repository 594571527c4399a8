use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use stockmeta_contracts::events::{EventPayload, EventWriter};
use stockmeta_contracts::settings::SettingsStore;

use crate::bridge::{wait_for_asset, BridgeError, PageBridge, PollPolicy, SystemClock};
use crate::config::EngineConfig;
use crate::error::AutomationError;
use crate::generation::Generator;
use crate::orchestrator::{Effect, Event, Orchestrator, Response};

/// Receiver of user-visible output. Missing listeners are not an error, so
/// implementations swallow delivery failures.
pub trait StatusSink: Send + Sync {
    fn status(&self, text: &str);
    fn respond(&self, response: Response);
}

/// Single-consumer event loop around the [`Orchestrator`].
///
/// Each event is handled to completion before the next one is received.
/// Blocking effects run on short-lived worker threads and report back
/// through the same channel.
pub struct Runtime {
    orchestrator: Orchestrator,
    sender: mpsc::Sender<Event>,
    receiver: mpsc::Receiver<Event>,
    bridge: Arc<dyn PageBridge>,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn StatusSink>,
    events: Option<EventWriter>,
    poll: PollPolicy,
}

impl Runtime {
    pub fn new(
        config: &EngineConfig,
        settings: Arc<dyn SettingsStore>,
        bridge: Arc<dyn PageBridge>,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            orchestrator: Orchestrator::new(settings, config),
            sender,
            receiver,
            bridge,
            generator,
            sink,
            events: None,
            poll: config.poll,
        }
    }

    pub fn with_event_log(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    /// Runs until a [`Event::Shutdown`] has been handled.
    pub fn run(mut self) {
        tracing::info!("runtime started");
        while let Ok(event) = self.receiver.recv() {
            let shutdown = matches!(event, Event::Shutdown);
            let effects = self.orchestrator.handle(event);
            for effect in effects {
                self.execute(effect);
            }
            if shutdown {
                break;
            }
        }
        tracing::info!("runtime stopped");
    }

    fn execute(&self, effect: Effect) {
        match effect {
            Effect::Status(text) => {
                self.sink.status(&text);
                self.record("status", json!({ "status": text }));
            }
            Effect::Respond(response) => {
                self.sink.respond(response);
                self.record("response", response.payload());
            }
            Effect::Log(entry) => {
                self.record_payload(entry.event, entry.payload);
            }
            Effect::ExtractAsset { target, cycle } => {
                let bridge = Arc::clone(&self.bridge);
                let poll = self.poll;
                self.spawn(
                    "stockmeta-extract",
                    Event::AssetExtracted {
                        target,
                        cycle,
                        result: Err(AutomationError::AssetNotFound),
                    },
                    move || Event::AssetExtracted {
                        target,
                        cycle,
                        result: wait_for_asset(bridge.as_ref(), target, &poll, &SystemClock::start()),
                    },
                );
            }
            Effect::Generate {
                target,
                cycle,
                asset,
                credential,
                model,
            } => {
                let generator = Arc::clone(&self.generator);
                self.spawn(
                    "stockmeta-generate",
                    Event::Generated {
                        target,
                        cycle,
                        result: Err(AutomationError::ApiError {
                            status: 0,
                            body: "generation worker could not start".to_string(),
                        }),
                    },
                    move || Event::Generated {
                        target,
                        cycle,
                        result: generator.generate(&asset, &credential, &model),
                    },
                );
            }
            Effect::Fill {
                target,
                cycle,
                record,
            } => {
                let bridge = Arc::clone(&self.bridge);
                self.spawn(
                    "stockmeta-fill",
                    Event::FillDelivered {
                        target,
                        cycle,
                        result: Err(BridgeError::Unreachable(
                            "fill worker could not start".to_string(),
                        )),
                    },
                    move || Event::FillDelivered {
                        target,
                        cycle,
                        result: bridge.fill_and_submit(target, &record),
                    },
                );
            }
            Effect::Settle {
                target,
                cycle,
                delay,
            } => {
                self.spawn(
                    "stockmeta-settle",
                    Event::SettleElapsed { target, cycle },
                    move || {
                        thread::sleep(delay);
                        Event::SettleElapsed { target, cycle }
                    },
                );
            }
        }
    }

    /// Runs `job` on a worker thread and posts its event back. If the thread
    /// can not be started `fallback` is posted instead.
    fn spawn(&self, name: &str, fallback: Event, job: impl FnOnce() -> Event + Send + 'static) {
        let sender = self.sender.clone();
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _ = sender.send(job());
        });
        if let Err(err) = spawned {
            tracing::error!(worker = name, error = %err, "worker thread spawn failed");
            let _ = self.sender.send(fallback);
        }
    }

    fn record(&self, event_type: &str, fields: Value) {
        let payload = match fields {
            Value::Object(map) => map,
            _ => EventPayload::new(),
        };
        self.record_payload(event_type, payload);
    }

    fn record_payload(&self, event_type: &str, payload: EventPayload) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "event log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use serde_json::Value;
    use stockmeta_contracts::events::EventWriter;
    use stockmeta_contracts::metadata::MetadataRecord;
    use stockmeta_contracts::settings::{MemorySettingsStore, Settings, SettingsStore};
    use stockmeta_contracts::target::{AssetReference, Locator, Target, TargetId};

    use super::{Runtime, StatusSink};
    use crate::bridge::{BridgeError, PageBridge};
    use crate::config::EngineConfig;
    use crate::error::AutomationError;
    use crate::generation::Generator;
    use crate::orchestrator::{Event, Response};

    const TAB: TargetId = TargetId(3);

    struct ChannelSink {
        statuses: Mutex<mpsc::Sender<String>>,
        responses: Mutex<Vec<Response>>,
    }

    impl StatusSink for ChannelSink {
        fn status(&self, text: &str) {
            if let Ok(sender) = self.statuses.lock() {
                let _ = sender.send(text.to_string());
            }
        }

        fn respond(&self, response: Response) {
            if let Ok(mut responses) = self.responses.lock() {
                responses.push(response);
            }
        }
    }

    /// Page that renders instantly and reports every submit as rejected.
    struct RejectingPage {
        events: Mutex<Option<mpsc::Sender<Event>>>,
        filled: Mutex<Vec<MetadataRecord>>,
    }

    impl PageBridge for RejectingPage {
        fn probe_asset(&self, _target: TargetId) -> Result<Option<AssetReference>, BridgeError> {
            Ok(Some(AssetReference(
                "https://thumbs.dreamstime.com/t.jpg".to_string(),
            )))
        }

        fn fill_and_submit(
            &self,
            target: TargetId,
            record: &MetadataRecord,
        ) -> Result<(), BridgeError> {
            if let Ok(mut filled) = self.filled.lock() {
                filled.push(record.clone());
            }
            if let Ok(events) = self.events.lock() {
                if let Some(events) = events.as_ref() {
                    let _ = events.send(Event::SubmitAttempted {
                        target,
                        success: false,
                        location: None,
                    });
                }
            }
            Ok(())
        }
    }

    struct CannedGenerator;

    impl Generator for CannedGenerator {
        fn generate(
            &self,
            _asset: &AssetReference,
            credential: &str,
            _model: &str,
        ) -> Result<String, AutomationError> {
            assert_eq!(credential, "k1");
            Ok("Here you go: {\"title\":\"Harbor\",\"description\":\"Boats at dawn\",\"keywords\":\"boat, harbor\"}".to_string())
        }
    }

    #[test]
    fn runtime_drives_a_cycle_until_submit_failure() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log_path = temp.path().join("events.jsonl");

        let mut settings = Settings::default();
        settings.import_credentials("keys.txt", vec!["k1".to_string()], "gemini-1.5-flash");
        let store = Arc::new(MemorySettingsStore::new(settings));
        let page = Arc::new(RejectingPage {
            events: Mutex::new(None),
            filled: Mutex::new(Vec::new()),
        });
        let (status_tx, status_rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink {
            statuses: Mutex::new(status_tx),
            responses: Mutex::new(Vec::new()),
        });

        let store_dyn: Arc<dyn SettingsStore> = store.clone();
        let runtime = Runtime::new(
            &EngineConfig::default(),
            store_dyn,
            page.clone(),
            Arc::new(CannedGenerator),
            sink.clone(),
        )
        .with_event_log(EventWriter::new(&log_path, "session-test"));
        let sender = runtime.sender();
        if let Ok(mut events) = page.events.lock() {
            *events = Some(sender.clone());
        }
        let worker = thread::spawn(move || runtime.run());

        sender.send(Event::Enable)?;
        sender.send(Event::StartAnalysis {
            candidate: Some(Target {
                id: TAB,
                location: Locator::new("https://www.dreamstime.com/upload"),
            }),
        })?;

        let mut seen = Vec::new();
        while let Ok(status) = status_rx.recv_timeout(Duration::from_secs(5)) {
            let done = status.starts_with("Error:");
            seen.push(status);
            if done {
                break;
            }
        }
        sender.send(Event::Shutdown)?;
        let _ = worker.join();

        assert_eq!(
            seen,
            vec![
                "Processing image & calling API...".to_string(),
                "Metadata received, filling form...".to_string(),
                "Error: Submit failed. Automation stopped.".to_string(),
            ]
        );
        assert_eq!(store.load()?.last_used_index, 0);
        let filled = page.filled.lock().map(|items| items.clone()).unwrap_or_default();
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].title, "Harbor");
        let responses = sink
            .responses
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default();
        assert_eq!(responses, vec![Response::Enabled]);

        let log = fs::read_to_string(&log_path)?;
        let kinds: Vec<String> = log
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert!(kinds.contains(&"credential_rotated".to_string()));
        assert!(kinds.contains(&"session_stopped".to_string()));
        assert!(!log.contains("\"k1\""));
        Ok(())
    }
}
