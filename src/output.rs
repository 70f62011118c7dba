//! Table rendering for `status` and `config`.

use comfy_table::{
    Cell, CellAlignment, ContentArrangement, Table,
    presets::{ASCII_FULL, UTF8_FULL},
};

use crate::config::PoolConfig;
use crate::pool::protocol::StatusReport;
use crate::theme::{Semantic, ThemedCell, colors_enabled};

fn base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(if colors_enabled() { UTF8_FULL } else { ASCII_FULL })
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Summary and per-slot counters of a status reply.
pub fn status_table(report: &StatusReport, master_pid: Option<u32>) -> Table {
    let mut table = base_table();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec![
        Cell::new("status"),
        Cell::new(report.status).themed(report.status.into()),
    ]);
    table.add_row(vec![
        Cell::new("master pid"),
        match master_pid {
            Some(pid) => Cell::new(pid),
            None => Cell::new("-").themed(Semantic::Muted),
        },
    ]);
    table.add_row(vec![Cell::new("workers"), Cell::new(report.workers)]);
    table.add_row(vec![
        Cell::new("handled requests"),
        Cell::new(report.handled_requests).themed(Semantic::Count),
    ]);
    table
}

/// One row per slot with the requests its current worker has handled.
pub fn workers_table(report: &StatusReport) -> Table {
    let mut table = base_table();
    table.set_header(vec!["Slot", "Handled requests"]);
    for (slot, handled) in &report.handled_requests_per_worker {
        table.add_row(vec![
            Cell::new(format!("#{}", slot)).themed(Semantic::Slot),
            Cell::new(handled).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

/// The resolved configuration, one setting per row.
pub fn config_table(config: &PoolConfig) -> Table {
    let mut table = base_table();
    table.set_header(vec!["Setting", "Value"]);
    for (name, value) in config.entries() {
        let muted = value == "-" || value == "disabled";
        let cell = Cell::new(value);
        table.add_row(vec![
            Cell::new(name),
            if muted { cell.themed(Semantic::Muted) } else { cell },
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::protocol::PoolHealth;
    use std::collections::BTreeMap;

    fn report() -> StatusReport {
        StatusReport {
            status: PoolHealth::Healthy,
            workers: 2,
            handled_requests: 12,
            handled_requests_per_worker: BTreeMap::from([(1, 7), (2, 5)]),
        }
    }

    #[test]
    fn test_status_table() {
        let rendered = status_table(&report(), Some(4242)).to_string();
        assert!(rendered.contains("healthy"));
        assert!(rendered.contains("4242"));
        assert!(rendered.contains("12"));
    }

    #[test]
    fn test_status_table_without_pidfile() {
        let rendered = status_table(&report(), None).to_string();
        assert!(rendered.contains("master pid"));
        assert!(rendered.contains('-'));
    }

    #[test]
    fn test_workers_table_rows() {
        let table = workers_table(&report());
        assert_eq!(table.row_iter().count(), 2);
        let rendered = table.to_string();
        assert!(rendered.contains("#1"));
        assert!(rendered.contains("#2"));
    }

    #[test]
    fn test_config_table_lists_every_setting() {
        let config = PoolConfig::default();
        let table = config_table(&config);
        assert_eq!(table.row_iter().count(), config.entries().len());
        assert!(table.to_string().contains("reload-timeout"));
    }
}
