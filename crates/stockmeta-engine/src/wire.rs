//! Line-delimited JSON bridge to the browser-side content layer.
//!
//! stdin carries commands, page signals and replies; stdout carries page
//! requests, status updates and command responses. One JSON object per line.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stockmeta_contracts::events::EventWriter;
use stockmeta_contracts::metadata::MetadataRecord;
use stockmeta_contracts::settings::SettingsStore;
use stockmeta_contracts::target::{AssetReference, Locator, Target, TargetId};

use crate::bridge::{BridgeError, PageBridge};
use crate::config::EngineConfig;
use crate::generation::Generator;
use crate::orchestrator::{Event, Response};
use crate::runtime::{Runtime, StatusSink};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TabInfo {
    pub id: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl Reply {
    fn into_error(self) -> BridgeError {
        let detail = self
            .error
            .unwrap_or_else(|| "page reported a failure".to_string());
        match self.code.as_deref() {
            Some("fields_missing") => BridgeError::FieldsMissing(detail),
            Some("unreachable") => BridgeError::Unreachable(detail),
            _ => BridgeError::Undeliverable(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Inbound {
    #[serde(alias = "enableAutoProcess")]
    Enable,
    #[serde(alias = "disableAutoProcess")]
    Disable,
    #[serde(alias = "getAutoProcessState")]
    GetState,
    StartAnalysis {
        #[serde(default)]
        tab: Option<TabInfo>,
    },
    #[serde(rename_all = "camelCase")]
    SubmitAttempted {
        tab_id: u64,
        success: bool,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabUpdated {
        tab_id: u64,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabRemoved { tab_id: u64 },
    Reply(Reply),
    Shutdown,
}

impl Inbound {
    /// Orchestrator event for this message, if it maps to one. Replies are
    /// routed to the bridge instead.
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Enable => Some(Event::Enable),
            Self::Disable => Some(Event::Disable),
            Self::GetState => Some(Event::GetState),
            Self::StartAnalysis { tab } => Some(Event::StartAnalysis {
                candidate: tab.map(|tab| Target {
                    id: TargetId(tab.id),
                    location: Locator::new(tab.url),
                }),
            }),
            Self::SubmitAttempted {
                tab_id,
                success,
                url,
            } => Some(Event::SubmitAttempted {
                target: TargetId(tab_id),
                success,
                location: url.map(Locator::new),
            }),
            Self::TabUpdated {
                tab_id,
                status,
                url,
            } => url.map(|url| Event::TargetUpdated {
                target: TargetId(tab_id),
                location: Locator::new(url),
                complete: status.as_deref() == Some("complete"),
            }),
            Self::TabRemoved { tab_id } => Some(Event::TargetRemoved {
                target: TargetId(tab_id),
            }),
            Self::Reply(_) => None,
            Self::Shutdown => Some(Event::Shutdown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    ProbeAsset { id: u64, tab_id: u64 },
    #[serde(rename_all = "camelCase")]
    FillMetadata {
        id: u64,
        tab_id: u64,
        data: MetadataRecord,
    },
    UpdatePopupStatus { status: String },
    Response { payload: Value },
}

/// Serialised access to the outbound stream.
pub struct WireWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl WireWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn send(&self, message: &Outbound) -> Result<()> {
        let line = serde_json::to_string(message)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("wire writer lock poisoned"))?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

impl StatusSink for WireWriter {
    fn status(&self, text: &str) {
        let message = Outbound::UpdatePopupStatus {
            status: text.to_string(),
        };
        if let Err(err) = self.send(&message) {
            tracing::debug!(error = %err, "status update not delivered");
        }
    }

    fn respond(&self, response: Response) {
        let message = Outbound::Response {
            payload: response.payload(),
        };
        if let Err(err) = self.send(&message) {
            tracing::warn!(error = %err, "command response not delivered");
        }
    }
}

/// [`PageBridge`] over the wire: each call writes a request line and blocks
/// until the matching `reply` arrives or the reply timeout passes.
pub struct WireBridge {
    writer: Arc<WireWriter>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Reply>>>,
    next_id: AtomicU64,
    reply_timeout: Duration,
}

impl WireBridge {
    pub fn new(writer: Arc<WireWriter>, reply_timeout: Duration) -> Self {
        Self {
            writer,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            reply_timeout,
        }
    }

    /// Hands `reply` to the caller waiting for it. Returns false when nobody
    /// is waiting any more.
    pub fn deliver_reply(&self, reply: Reply) -> bool {
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&reply.id),
            Err(_) => None,
        };
        match waiter {
            Some(waiter) => waiter.send(reply).is_ok(),
            None => false,
        }
    }

    fn request(&self, build: impl FnOnce(u64) -> Outbound) -> Result<Reply, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .map_err(|_| BridgeError::Undeliverable("pending table lock poisoned".to_string()))?
            .insert(id, tx);

        if let Err(err) = self.writer.send(&build(id)) {
            self.forget(id);
            return Err(BridgeError::Undeliverable(format!("{err:#}")));
        }
        match rx.recv_timeout(self.reply_timeout) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.forget(id);
                Err(BridgeError::Undeliverable(format!(
                    "no reply to request {id} within {} ms",
                    self.reply_timeout.as_millis()
                )))
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

impl PageBridge for WireBridge {
    fn probe_asset(&self, target: TargetId) -> Result<Option<AssetReference>, BridgeError> {
        let reply = self.request(|id| Outbound::ProbeAsset {
            id,
            tab_id: target.0,
        })?;
        if !reply.ok {
            return Err(reply.into_error());
        }
        Ok(reply
            .image_data
            .map(|data| data.trim().to_string())
            .filter(|data| data.starts_with("http"))
            .map(AssetReference))
    }

    fn fill_and_submit(
        &self,
        target: TargetId,
        record: &MetadataRecord,
    ) -> Result<(), BridgeError> {
        let reply = self.request(|id| Outbound::FillMetadata {
            id,
            tab_id: target.0,
            data: record.clone(),
        })?;
        if reply.ok {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }
}

/// Reads inbound lines until EOF or `shutdown`, forwarding events to the
/// runtime and replies to the bridge. Malformed lines are logged and skipped.
pub fn pump(input: impl BufRead, bridge: &WireBridge, events: &mpsc::Sender<Event>) -> Result<()> {
    for line in input.lines() {
        let line = line.context("failed reading wire input")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message: Inbound = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed wire message");
                continue;
            }
        };
        if let Inbound::Reply(reply) = message {
            let id = reply.id;
            if !bridge.deliver_reply(reply) {
                tracing::debug!(id, "reply without a waiting request");
            }
            continue;
        }
        let Some(event) = message.into_event() else {
            continue;
        };
        let shutdown = matches!(event, Event::Shutdown);
        if events.send(event).is_err() || shutdown {
            return Ok(());
        }
    }
    let _ = events.send(Event::Shutdown);
    Ok(())
}

/// Runs the engine against a wire connection until shutdown or end of input.
pub fn run_host<R>(
    config: &EngineConfig,
    settings: Arc<dyn SettingsStore>,
    generator: Arc<dyn Generator>,
    events: Option<EventWriter>,
    input: R,
    output: Box<dyn Write + Send>,
) -> Result<()>
where
    R: BufRead + Send + 'static,
{
    let writer = Arc::new(WireWriter::new(output));
    let bridge = Arc::new(WireBridge::new(Arc::clone(&writer), config.reply_timeout));
    let mut runtime = Runtime::new(config, settings, bridge.clone(), generator, writer);
    if let Some(events) = events {
        runtime = runtime.with_event_log(events);
    }

    let sender = runtime.sender();
    thread::Builder::new()
        .name("stockmeta-wire-reader".to_string())
        .spawn(move || {
            if let Err(err) = pump(input, &bridge, &sender) {
                tracing::error!(error = %err, "wire reader stopped");
                let _ = sender.send(Event::Shutdown);
            }
        })
        .context("failed to start wire reader")?;

    runtime.run();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::{json, Value};
    use stockmeta_contracts::metadata::MetadataRecord;
    use stockmeta_contracts::settings::{MemorySettingsStore, SettingsStore};
    use stockmeta_contracts::target::{AssetReference, Locator, TargetId};

    use super::{pump, run_host, Inbound, Reply, WireBridge, WireWriter};
    use crate::bridge::{BridgeError, PageBridge};
    use crate::config::EngineConfig;
    use crate::error::AutomationError;
    use crate::generation::Generator;
    use crate::orchestrator::Event;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut inner) = self.0.lock() {
                inner.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn lines(&self) -> Vec<Value> {
            let text = self
                .0
                .lock()
                .map(|inner| String::from_utf8_lossy(&inner).to_string())
                .unwrap_or_default();
            text.lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()
        }

        fn wait_for_line(&self, count: usize) -> Option<Value> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(line) = self.lines().get(count - 1) {
                    return Some(line.clone());
                }
                thread::sleep(Duration::from_millis(5));
            }
            None
        }
    }

    fn bridge(timeout: Duration) -> (Arc<WireBridge>, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let writer = Arc::new(WireWriter::new(Box::new(buffer.clone())));
        (Arc::new(WireBridge::new(writer, timeout)), buffer)
    }

    struct NoGenerator;

    impl Generator for NoGenerator {
        fn generate(
            &self,
            _asset: &AssetReference,
            _credential: &str,
            _model: &str,
        ) -> Result<String, AutomationError> {
            Err(AutomationError::MalformedResponse("unused".to_string()))
        }
    }

    #[test]
    fn legacy_action_names_are_accepted() -> anyhow::Result<()> {
        let message: Inbound = serde_json::from_str(r#"{"action":"enableAutoProcess"}"#)?;
        assert_eq!(message.into_event(), Some(Event::Enable));
        let message: Inbound = serde_json::from_str(r#"{"action":"getAutoProcessState"}"#)?;
        assert_eq!(message.into_event(), Some(Event::GetState));
        Ok(())
    }

    #[test]
    fn tab_updates_map_completion_and_skip_missing_url() -> anyhow::Result<()> {
        let complete: Inbound = serde_json::from_str(
            r#"{"action":"tabUpdated","tabId":9,"status":"complete","url":"https://www.dreamstime.com/upload/edit5"}"#,
        )?;
        assert_eq!(
            complete.into_event(),
            Some(Event::TargetUpdated {
                target: TargetId(9),
                location: Locator::new("https://www.dreamstime.com/upload/edit5"),
                complete: true,
            })
        );
        let loading: Inbound =
            serde_json::from_str(r#"{"action":"tabUpdated","tabId":9,"status":"loading"}"#)?;
        assert_eq!(loading.into_event(), None);
        Ok(())
    }

    #[test]
    fn pump_skips_garbage_and_ends_with_shutdown() -> anyhow::Result<()> {
        let (bridge, _) = bridge(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        let input = Cursor::new(
            "not json\n\n{\"action\":\"disable\"}\n{\"action\":\"submitAttempted\",\"tabId\":4,\"success\":false}\n",
        );
        pump(input, &bridge, &tx)?;
        let received: Vec<Event> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                Event::Disable,
                Event::SubmitAttempted {
                    target: TargetId(4),
                    success: false,
                    location: None,
                },
                Event::Shutdown,
            ]
        );
        Ok(())
    }

    #[test]
    fn probe_waits_for_matching_reply() -> anyhow::Result<()> {
        let (bridge, buffer) = bridge(Duration::from_secs(5));
        let caller = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.probe_asset(TargetId(11)))
        };

        let request = buffer.wait_for_line(1).unwrap_or(Value::Null);
        assert_eq!(request["action"], json!("probeAsset"));
        assert_eq!(request["tabId"], json!(11));
        let id = request["id"].as_u64().unwrap_or_default();

        assert!(!bridge.deliver_reply(Reply {
            id: id + 100,
            ok: true,
            image_data: None,
            error: None,
            code: None,
        }));
        assert!(bridge.deliver_reply(Reply {
            id,
            ok: true,
            image_data: Some("https://thumbs.dreamstime.com/z.jpg".to_string()),
            error: None,
            code: None,
        }));

        let result = caller.join().unwrap_or(Ok(None));
        assert_eq!(
            result,
            Ok(Some(AssetReference(
                "https://thumbs.dreamstime.com/z.jpg".to_string()
            )))
        );
        Ok(())
    }

    #[test]
    fn missing_reply_is_undeliverable() {
        let (bridge, _) = bridge(Duration::from_millis(20));
        let record = MetadataRecord {
            title: "t".to_string(),
            description: "d".to_string(),
            keywords: "k".to_string(),
        };
        let result = bridge.fill_and_submit(TargetId(1), &record);
        assert!(matches!(result, Err(BridgeError::Undeliverable(_))));
    }

    #[test]
    fn fill_error_code_maps_to_fields_missing() -> anyhow::Result<()> {
        let (bridge, buffer) = bridge(Duration::from_secs(5));
        let caller = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                bridge.fill_and_submit(
                    TargetId(2),
                    &MetadataRecord {
                        title: "t".to_string(),
                        description: "d".to_string(),
                        keywords: "k".to_string(),
                    },
                )
            })
        };
        let request = buffer.wait_for_line(1).unwrap_or(Value::Null);
        assert_eq!(request["action"], json!("fillMetadata"));
        assert_eq!(request["data"]["title"], json!("t"));
        let id = request["id"].clone();
        bridge.deliver_reply(serde_json::from_value(json!({
            "id": id,
            "ok": false,
            "error": "keyword textarea not found",
            "code": "fields_missing",
        }))?);
        let result = caller.join().unwrap_or(Ok(()));
        assert_eq!(
            result,
            Err(BridgeError::FieldsMissing(
                "keyword textarea not found".to_string()
            ))
        );
        Ok(())
    }

    #[test]
    fn host_answers_commands_in_order() -> anyhow::Result<()> {
        let output = SharedBuffer::default();
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettingsStore::default());
        let input = Cursor::new(
            "{\"action\":\"enable\"}\n{\"action\":\"getState\"}\n{\"action\":\"startAnalysis\"}\n{\"action\":\"shutdown\"}\n",
        );
        run_host(
            &EngineConfig::default(),
            store,
            Arc::new(NoGenerator),
            None,
            input,
            Box::new(output.clone()),
        )?;

        let lines = output.lines();
        assert_eq!(
            lines[0],
            json!({ "action": "response", "payload": { "status": "enabled" } })
        );
        assert_eq!(
            lines[1],
            json!({ "action": "response", "payload": { "isEnabled": true } })
        );
        assert_eq!(
            lines[2],
            json!({
                "action": "updatePopupStatus",
                "status": "Error: API keys or model are not configured. Automation stopped."
            })
        );
        assert_eq!(lines.len(), 3);
        Ok(())
    }
}
