use tabled::builder::Builder;
use tabled::settings::{Padding, Style};

use crate::model::ProcessSummary;
use crate::ui::widgets::TableSpec;

pub fn render_table(spec: &TableSpec) -> String {
    let mut builder = Builder::default();
    if !spec.headers.is_empty() {
        builder.push_record(spec.headers.iter().map(String::as_str));
    }
    for row in &spec.rows {
        builder.push_record(row.iter().map(String::as_str));
    }
    let mut table = builder.build();
    table.with(Style::blank());
    table.with(Padding::new(0, 2, 0, 0));
    table.to_string()
}

pub fn process_table(processes: &[ProcessSummary]) -> TableSpec {
    let headers = ["name", "status", "exit", "pid", "lines", "port"]
        .into_iter()
        .map(str::to_owned)
        .collect();
    let rows = processes
        .iter()
        .map(|process| {
            vec![
                process.name().to_owned(),
                process.status.label().to_owned(),
                optional(process.exit_code),
                optional(process.pid),
                process.total_line_count.to_string(),
                optional(process.port),
            ]
        })
        .collect();
    TableSpec::new(headers, rows)
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|value| value.to_string()).unwrap_or_else(|| "-".to_owned())
}
