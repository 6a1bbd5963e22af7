use std::{fs, path::PathBuf};

use anyhow::Error;
use schemars::schema_for;

use gateway_client::message::InboundEvent;

use crate::flow::definition::FlowDefinition;

/// Writes the JSON-Schema contracts shared with the flow editor UI: the flow
/// definition it saves and the webhook event the gateway forwards.
pub fn write_schema(out_dir: PathBuf) -> Result<(), Error> {
    fs::create_dir_all(&out_dir)?;

    let flow_schema = schema_for!(FlowDefinition);
    fs::write(
        out_dir.join("flow.schema.json"),
        serde_json::to_string_pretty(&flow_schema)?,
    )?;

    let event_schema = schema_for!(InboundEvent);
    fs::write(
        out_dir.join("inbound.schema.json"),
        serde_json::to_string_pretty(&event_schema)?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_both_contracts() {
        let dir = tempdir().unwrap();
        write_schema(dir.path().to_path_buf()).unwrap();

        let flow = fs::read_to_string(dir.path().join("flow.schema.json")).unwrap();
        assert!(flow.contains("FlowDefinition"));
        assert!(flow.contains("nodes"));

        let event = fs::read_to_string(dir.path().join("inbound.schema.json")).unwrap();
        assert!(event.contains("remote_jid"));
    }
}
