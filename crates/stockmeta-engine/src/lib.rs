pub mod bridge;
pub mod config;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod runtime;
pub mod session;
pub mod wire;

use std::sync::Arc;

use stockmeta_contracts::metadata::{extract, MetadataRecord};
use stockmeta_contracts::settings::SettingsStore;
use stockmeta_contracts::target::AssetReference;

pub use bridge::{BridgeError, PageBridge, PollPolicy};
pub use config::EngineConfig;
pub use error::AutomationError;
pub use generation::{GeminiClient, Generator};
pub use orchestrator::{Effect, Event, Orchestrator, Response};
pub use runtime::{Runtime, StatusSink};
pub use session::{Phase, Session, StopReason};

/// Result of a page-less generation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub record: MetadataRecord,
    pub model: String,
    pub credential_index: i64,
}

/// One rotate, generate and extract pass for a single image, without a page.
///
/// The cursor is stored before the credential is used, the same as in a
/// page-driven cycle.
pub fn describe_asset(
    settings: &Arc<dyn SettingsStore>,
    generator: &dyn Generator,
    asset: &AssetReference,
) -> Result<Description, AutomationError> {
    let ready = settings
        .load()
        .map_err(|err| AutomationError::Settings(format!("{err:#}")))?
        .require()?;
    let rotation = ready.pool.next(ready.last_used_index)?;
    settings
        .record_cursor(rotation.index)
        .map_err(|err| AutomationError::Settings(format!("{err:#}")))?;
    let raw = generator.generate(asset, &rotation.credential, &ready.model)?;
    let record = extract(&raw)?;
    Ok(Description {
        record,
        model: ready.model,
        credential_index: rotation.index,
    })
}
