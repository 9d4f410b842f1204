//! 端末向けの表示（table / process tree / status 一覧）

use std::io::{self, Write};

use volscope_core::domain::{
    BatchProgress, ResultSchema, ResultSet, Timeline, flatten_process_tree, render_cell,
};

/// Axis width of `--timeline`.
pub const TIMELINE_WIDTH: usize = 60;

/// Print rows as an aligned text table on stdout.
pub fn print_table(results: &ResultSet, schema: &ResultSchema) -> io::Result<()> {
    let cells = results.to_table(schema);
    write_table(&mut io::stdout().lock(), schema.columns(), &cells)
}

/// Print rows arranged by `PID` / `PPID`, indenting the first column by depth.
pub fn print_tree(results: &ResultSet, schema: &ResultSchema) -> io::Result<()> {
    let entries = flatten_process_tree(results);
    let cells: Vec<Vec<String>> = entries
        .iter()
        .map(|entry| {
            schema
                .columns()
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let cell = entry.row.get(column).map(render_cell).unwrap_or_default();
                    if i == 0 {
                        format!("{}{cell}", "  ".repeat(entry.depth))
                    } else {
                        cell
                    }
                })
                .collect()
        })
        .collect();
    write_table(&mut io::stdout().lock(), schema.columns(), &cells)
}

/// Print one line per timed row: time, axis marker, then the other columns.
pub fn print_timeline(timeline: &Timeline, schema: &ResultSchema) -> io::Result<()> {
    write_timeline(&mut io::stdout().lock(), timeline, schema)
}

fn write_timeline<W: Write>(
    out: &mut W,
    timeline: &Timeline,
    schema: &ResultSchema,
) -> io::Result<()> {
    let (Some(start), Some(end)) = (timeline.start(), timeline.end()) else {
        return writeln!(out, "(no rows with a parseable {})", timeline.column);
    };
    writeln!(
        out,
        "{}: {} .. {}",
        timeline.column,
        start.format("%Y-%m-%d %H:%M:%S"),
        end.format("%Y-%m-%d %H:%M:%S")
    )?;
    if timeline.skipped > 0 {
        writeln!(out, "({} rows without a usable {})", timeline.skipped, timeline.column)?;
    }

    let labels: Vec<&String> = schema
        .columns()
        .iter()
        .filter(|c| **c != timeline.column)
        .collect();
    for entry in &timeline.entries {
        let bar: String = (0..timeline.width)
            .map(|i| if i == entry.offset { '*' } else { '.' })
            .collect();
        let label: Vec<String> = labels
            .iter()
            .map(|c| entry.row.get(c.as_str()).map(render_cell).unwrap_or_default())
            .collect();
        let line = format!(
            "{}  |{bar}|  {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            label.join("  ")
        );
        writeln!(out, "{}", line.trim_end())?;
    }
    Ok(())
}

fn write_table<W: Write>(out: &mut W, columns: &[String], rows: &[Vec<String>]) -> io::Result<()> {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    write_line(out, columns.iter().map(String::as_str), &widths)?;
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    write_line(out, rule.iter().map(String::as_str), &widths)?;
    for row in rows {
        write_line(out, row.iter().map(String::as_str), &widths)?;
    }
    Ok(())
}

fn write_line<'a, W: Write>(
    out: &mut W,
    cells: impl Iterator<Item = &'a str>,
    widths: &[usize],
) -> io::Result<()> {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{cell:<width$}"))
        .collect();
    writeln!(out, "{}", line.join("  ").trim_end())
}

/// One line per batch member, in the order they were requested.
pub fn print_members(progress: &BatchProgress) {
    for member in progress.members() {
        match &member.error {
            Some(err) => println!("{:<40} {} ({err})", member.plugin, member.status),
            None => println!("{:<40} {}", member.plugin, member.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_columns_to_widest_cell() {
        let columns = vec!["PID".to_string(), "ImageFileName".to_string()];
        let rows = vec![
            vec!["4".to_string(), "System".to_string()],
            vec!["1337".to_string(), "evil.exe".to_string()],
        ];
        let mut out = Vec::new();
        write_table(&mut out, &columns, &rows).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "PID   ImageFileName");
        assert_eq!(lines[1], "----  -------------");
        assert_eq!(lines[2], "4     System");
        assert_eq!(lines[3], "1337  evil.exe");
    }

    #[test]
    fn timeline_marks_each_row_on_the_axis() {
        use volscope_core::domain::build_timeline;

        let results: ResultSet = serde_json::from_value(serde_json::json!([
            { "PID": 88, "ImageFileName": "smss.exe", "CreateTime": "2024-01-01 00:00:04" },
            { "PID": 4, "ImageFileName": "System", "CreateTime": "2024-01-01 00:00:00" },
            { "PID": 9, "ImageFileName": "odd.exe", "CreateTime": "-" }
        ]))
        .unwrap();
        let schema = ResultSchema::declared(["PID", "ImageFileName", "CreateTime"]);
        let timeline = build_timeline(&results, "CreateTime", 5);

        let mut out = Vec::new();
        write_timeline(&mut out, &timeline, &schema).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "CreateTime: 2024-01-01 00:00:00 .. 2024-01-01 00:00:04");
        assert_eq!(lines[1], "(1 rows without a usable CreateTime)");
        assert_eq!(lines[2], "2024-01-01 00:00:00  |*....|  4  System");
        assert_eq!(lines[3], "2024-01-01 00:00:04  |....*|  88  smss.exe");
    }

    #[test]
    fn empty_result_prints_header_only() {
        let columns = vec!["Offset".to_string()];
        let mut out = Vec::new();
        write_table(&mut out, &columns, &[]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Offset\n------\n");
    }
}
