//! Human-readable output formatting

use bytesize::ByteSize;
use chrono::{DateTime, Local, Utc};

use crate::images::ImageReport;
use crate::output::formatter::{CleanReport, Report, SessionDetail};
use crate::runtime::SnapshotInfo;

fn timestamp(t: Option<&DateTime<Utc>>) -> String {
    t.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn snapshot_table(snapshots: &[SnapshotInfo]) -> String {
    if snapshots.is_empty() {
        return "  (no snapshots)\n".to_string();
    }
    let mut output = format!(
        "  {:<28} {:<20} {:<8}\n",
        "NAME", "CREATED", "STATEFUL"
    );
    for snap in snapshots {
        output.push_str(&format!(
            "  {:<28} {:<20} {:<8}\n",
            truncate(&snap.name, 28),
            timestamp(Some(&snap.created_at)),
            if snap.stateful { "yes" } else { "no" }
        ));
    }
    output
}

fn session_detail(detail: &SessionDetail) -> String {
    let mut output = format!(
        "Session {}\n{}\n\
         Path:       {}\n\
         Size:       {} ({} files)\n",
        detail.id,
        "-".repeat(detail.id.len() + 8),
        detail.path.display(),
        ByteSize(detail.size_bytes),
        detail.file_count
    );
    match &detail.metadata {
        Some(meta) => {
            output.push_str(&format!("Saved:      {}\n", timestamp(Some(&meta.saved_at))));
            if let Some(ws) = &meta.workspace {
                output.push_str(&format!("Workspace:  {}\n", ws.display()));
            }
            if let Some(container) = &meta.container_name {
                output.push_str(&format!("Container:  {}\n", container));
            }
            if let Some(image) = &meta.image {
                output.push_str(&format!("Image:      {}\n", image));
            }
            output.push_str(&format!(
                "Persistent: {}\n",
                if meta.persistent { "yes" } else { "no" }
            ));
        }
        None => output.push_str("(no metadata recorded)\n"),
    }
    output
}

fn clean_summary(report: &CleanReport) -> String {
    let mut output = String::new();
    if !report.stopped_containers.is_empty() {
        output.push_str(&format!(
            "Stopped containers ({}):\n",
            report.stopped_containers.len()
        ));
        for name in &report.stopped_containers {
            output.push_str(&format!("  - {}\n", name));
        }
    }
    if !report.sessions.is_empty() {
        output.push_str(&format!("Saved sessions ({}):\n", report.sessions.len()));
        for id in &report.sessions {
            output.push_str(&format!("  - {}\n", id));
        }
    }
    if let Some(orphans) = &report.orphans {
        if !orphans.veths.is_empty() {
            output.push_str(&format!("Orphaned veth interfaces ({}):\n", orphans.veths.len()));
            for veth in &orphans.veths {
                output.push_str(&format!("  - {}\n", veth));
            }
        }
        if !orphans.firewall_rules.is_empty() {
            output.push_str(&format!(
                "Orphaned firewall rules ({}):\n",
                orphans.firewall_rules.len()
            ));
            for rule in &orphans.firewall_rules {
                output.push_str(&format!("  - {}\n", rule));
            }
        }
    }
    if let Some(err) = &report.orphan_error {
        output.push_str(&format!("Warning: orphan detection failed: {}\n", err));
    }

    if report.cancelled {
        output.push_str("Cancelled.");
    } else if report.dry_run {
        output.push_str("[Dry run] No changes made.");
    } else if report.cleaned > 0 {
        output.push_str(&format!("Cleaned {} item(s).", report.cleaned));
    } else {
        output.push_str("Nothing to clean.");
    }
    output
}

fn image_summary(report: &ImageReport) -> String {
    let mut output = String::from("Berth Images\n------------\n");
    for image in &report.managed {
        if image.present {
            output.push_str(&format!("  [x] {}\n      {}\n", image.alias, image.description));
        } else {
            output.push_str(&format!(
                "  [ ] {} (missing)\n      {}\n",
                image.alias, image.description
            ));
            if let Some(hint) = &image.hint {
                output.push_str(&format!("      To add it, {}\n", hint));
            }
        }
    }

    match &report.local {
        Some(local) => {
            output.push_str("\nLocal Images\n------------\n");
            if local.is_empty() {
                output.push_str("  (none)\n");
            } else {
                output.push_str(&format!(
                    "  {:<30} {:<14} {:>10}  {}\n",
                    "ALIAS", "FINGERPRINT", "SIZE", "UPLOADED"
                ));
                for image in local {
                    let alias = if image.aliases.is_empty() {
                        "-".to_string()
                    } else {
                        image.aliases.join(",")
                    };
                    output.push_str(&format!(
                        "  {:<30} {:<14} {:>10}  {}\n",
                        truncate(&alias, 30),
                        truncate(&image.fingerprint, 12),
                        ByteSize(image.size_bytes).to_string(),
                        timestamp(image.uploaded_at.as_ref())
                    ));
                }
            }
        }
        None => output.push_str("\nTip: use --all to see every local image\n"),
    }

    output.push_str(
        "\nRemote images work too, e.g. berth shell --image images:ubuntu/24.04",
    );
    output
}

pub fn format_human(report: &Report) -> String {
    match report {
        Report::Listing {
            containers,
            sessions,
        } => {
            let mut output = String::from("Containers\n----------\n");
            if containers.is_empty() {
                output.push_str("  (none)\n");
            } else {
                output.push_str(&format!(
                    "{:<24} {:<10} {:<16} {:<20}\n",
                    "NAME", "STATUS", "IPV4", "CREATED"
                ));
                output.push_str(&"-".repeat(72));
                output.push('\n');
                for c in containers {
                    let ip = c
                        .ipv4
                        .first()
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    output.push_str(&format!(
                        "{:<24} {:<10} {:<16} {:<20}\n",
                        truncate(&c.name, 24),
                        c.status,
                        ip,
                        timestamp(c.created_at.as_ref())
                    ));
                }
            }
            if let Some(sessions) = sessions {
                output.push_str("\nSaved Sessions\n--------------\n");
                if sessions.is_empty() {
                    output.push_str("  (none)\n");
                }
                for s in sessions {
                    output.push_str(&format!(
                        "{:<36}  {:<20} {:>10}  {}\n",
                        s.id,
                        timestamp(s.saved_at.as_ref()),
                        ByteSize(s.size_bytes).to_string(),
                        s.workspace
                            .as_ref()
                            .map(|w| w.display().to_string())
                            .unwrap_or_else(|| "-".to_string())
                    ));
                }
            }
            output
        }
        Report::Session(detail) => session_detail(detail),
        Report::Snapshots {
            container,
            snapshots,
        } => format!("Snapshots for {}\n{}", container, snapshot_table(snapshots)),
        Report::AllSnapshots(all) => {
            if all.is_empty() {
                return "No berth containers found".to_string();
            }
            let mut output = String::new();
            for (container, snapshots) in all {
                output.push_str(&format!("{}\n{}\n", container, snapshot_table(snapshots)));
            }
            output
        }
        Report::Snapshot {
            container,
            snapshot,
        } => {
            let mut output = format!(
                "Snapshot {}\n\
                 Container: {}\n\
                 Created:   {}\n\
                 Stateful:  {}\n",
                snapshot.name,
                container,
                timestamp(Some(&snapshot.created_at)),
                if snapshot.stateful { "yes" } else { "no" }
            );
            if let Some(expires) = &snapshot.expires_at {
                output.push_str(&format!("Expires:   {}\n", timestamp(Some(expires))));
            }
            if !snapshot.description.is_empty() {
                output.push_str(&format!("Description: {}\n", snapshot.description));
            }
            output
        }
        Report::Clean(report) => clean_summary(report),
        Report::Images(report) => image_summary(report),
        Report::Message { message } => message.clone(),
    }
}
