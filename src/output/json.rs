//! JSON output formatting

use serde_json::{json, Value};

use crate::output::formatter::Report;

pub fn format_json(report: &Report) -> String {
    let data: Value = match report {
        Report::Listing {
            containers,
            sessions,
        } => json!({ "containers": containers, "sessions": sessions }),
        Report::Session(detail) => serde_json::to_value(detail).unwrap_or(json!(null)),
        Report::Snapshots {
            container,
            snapshots,
        } => json!({ "container": container, "snapshots": snapshots }),
        Report::AllSnapshots(all) => {
            let items: Vec<Value> = all
                .iter()
                .map(|(container, snapshots)| {
                    json!({ "container": container, "snapshots": snapshots })
                })
                .collect();
            json!({ "containers": items })
        }
        Report::Snapshot {
            container,
            snapshot,
        } => json!({ "container": container, "snapshot": snapshot }),
        Report::Clean(report) => serde_json::to_value(report).unwrap_or(json!(null)),
        Report::Images(report) => serde_json::to_value(report).unwrap_or(json!(null)),
        Report::Message { message } => json!({ "message": message }),
    };

    serde_json::to_string_pretty(&data).unwrap_or_else(|_| "{}".to_string())
}
