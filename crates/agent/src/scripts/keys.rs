use common::{AttributeMap, OsFamily, ScriptEvent};

use crate::error::{AgentError, Result};

const WINDOWS_SUFFIXES: [&str; 4] = ["bat", "cmd", "ps1", "url"];

/// Ordered metadata keys that may hold a script for `event` on `os`.
///
/// The order is the format preference used when running a collection.
pub fn wanted_keys(event: ScriptEvent, os: OsFamily) -> Result<Vec<String>> {
    match (os, event) {
        (OsFamily::Windows, _) => {
            let prefix = match event {
                ScriptEvent::Specialize => "sysprep-specialize",
                ScriptEvent::Startup => "windows-startup",
                ScriptEvent::Shutdown => "windows-shutdown",
            };
            Ok(WINDOWS_SUFFIXES
                .iter()
                .map(|suffix| format!("{prefix}-script-{suffix}"))
                .collect())
        }
        (OsFamily::Linux, ScriptEvent::Startup | ScriptEvent::Shutdown) => {
            let prefix = event.as_str();
            Ok(vec![
                format!("{prefix}-script-url"),
                format!("{prefix}-script"),
            ])
        }
        (OsFamily::Linux, ScriptEvent::Specialize) => Err(AgentError::UnsupportedEvent {
            event: event.to_string(),
            os: os.to_string(),
        }),
    }
}

/// The subset of `attributes` whose keys are wanted. Values are copied verbatim.
pub fn select_attributes(attributes: &AttributeMap, wanted: &[String]) -> AttributeMap {
    wanted
        .iter()
        .filter_map(|key| attributes.get(key).map(|v| (key.clone(), v.clone())))
        .collect()
}
