//! Table rendering for `tvm list` and `tvm sources`.

use comfy_table::presets::NOTHING;
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement, Table};

use tvm_schema::{DownloadSource, MirrorProbeResult, VersionRecord};

use super::theme::format_size;

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|h| Cell::new(h).fg(Color::DarkGrey)));
    table
}

/// Installed versions, newest last, the active one marked.
pub fn versions(records: &[VersionRecord]) -> Table {
    let mut table = table(&["", "version", "size", "source", "installed", "path"]);
    for record in records {
        let marker = if record.active {
            Cell::new("●").fg(Color::Green)
        } else {
            Cell::new("")
        };
        table.add_row(vec![
            marker,
            Cell::new(record.version.as_str()).fg(Color::Cyan),
            Cell::new(format_size(record.size_bytes)).set_alignment(CellAlignment::Right),
            Cell::new(&record.source),
            Cell::new(record.installed_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(record.path.display()).fg(Color::DarkGrey),
        ]);
    }
    table
}

/// Sources in priority order, flagging custom ones.
pub fn sources(sources: &[DownloadSource], is_builtin: impl Fn(&str) -> bool) -> Table {
    let mut table = table(&["name", "priority", "url", "region", "kind"]);
    for source in sources {
        let kind = if is_builtin(&source.name) { "built-in" } else { "custom" };
        table.add_row(vec![
            Cell::new(&source.name).fg(Color::Cyan),
            Cell::new(source.priority).set_alignment(CellAlignment::Right),
            Cell::new(&source.base_url),
            Cell::new(&source.region),
            Cell::new(kind).fg(Color::DarkGrey),
        ]);
    }
    table
}

/// Probe outcomes, fastest available first, unavailable last.
pub fn probes(results: &[MirrorProbeResult]) -> Table {
    let mut sorted: Vec<&MirrorProbeResult> = results.iter().collect();
    sorted.sort_by_key(|r| (!r.available, r.response_time));

    let mut table = table(&["name", "latency", "status"]);
    for result in sorted {
        let (status, color) = if result.available {
            ("ok".to_string(), Color::Green)
        } else {
            (result.error.clone().unwrap_or_else(|| "unavailable".into()), Color::Red)
        };
        table.add_row(vec![
            Cell::new(&result.source_name).fg(Color::Cyan),
            Cell::new(format!("{} ms", result.response_time.as_millis())).set_alignment(CellAlignment::Right),
            Cell::new(status).fg(color),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_probe_rows_sorted() {
        let results = vec![
            MirrorProbeResult::unavailable("down", Duration::from_millis(1), "HTTP 503"),
            MirrorProbeResult::available("slow", Duration::from_millis(90)),
            MirrorProbeResult::available("fast", Duration::from_millis(10)),
        ];
        let rendered = probes(&results).to_string();
        let fast = rendered.find("fast").unwrap();
        let slow = rendered.find("slow").unwrap();
        let down = rendered.find("down").unwrap();
        assert!(fast < slow && slow < down);
        assert!(rendered.contains("HTTP 503"));
    }
}
