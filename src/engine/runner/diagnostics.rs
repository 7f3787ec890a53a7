use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use crate::core::TaskId;
use crate::graph::FrozenGraph;
use crate::outcome::TaskOutcome;

/// When and for how long a task's actions ran.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Build diagnostics and performance metrics.
///
/// Part of every [`BuildOutcome`](crate::BuildOutcome). Only tasks whose
/// actions actually ran have an entry; up-to-date, cached and skipped tasks
/// cost no execution time.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    /// Renders the task graph as a Mermaid diagram.
    ///
    /// * Executed tasks go from **green** (fast) over **yellow** to **red**
    ///   (slow).
    /// * **Blue**: up to date.
    /// * **Purple**: restored from the cache.
    /// * **Dark red**: failed.
    /// * **Grey**: skipped.
    pub fn render_mermaid(&self, graph: &FrozenGraph, outcomes: &BTreeMap<TaskId, TaskOutcome>) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min_time, max_time) = self.time_range();

        for index in graph.node_indices() {
            let id = &graph.task(index).id;
            let name = id.as_str().replace('"', "\\\"");

            let (label, color) = match (outcomes.get(id), self.execution_times.get(id)) {
                (Some(TaskOutcome::Failed { .. }), _) => ("Failed".to_string(), "#B22222".to_string()),
                (_, Some(exec)) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                (Some(TaskOutcome::UpToDate), _) => ("Up-to-date".to_string(), "#ADD8E6".to_string()),
                (Some(TaskOutcome::FromCache), _) => ("From cache".to_string(), "#C3B1E1".to_string()),
                (Some(TaskOutcome::Skipped { .. }), _) => ("Skipped".to_string(), "#D3D3D3".to_string()),
                _ => ("Not run".to_string(), "#FFFFFF".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for index in graph.node_indices() {
            for kind in [
                crate::graph::EdgeKind::DependsOn,
                crate::graph::EdgeKind::MustRunAfter,
                crate::graph::EdgeKind::FinalizedBy,
            ] {
                let arrow = match kind {
                    crate::graph::EdgeKind::DependsOn => "-->",
                    _ => "-.->",
                };
                for successor in graph.successors(index, kind) {
                    let _ = writeln!(f, "    {} {} {}", index.index(), arrow, successor.index());
                }
            }
        }

        f
    }

    fn time_range(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in self.execution_times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }
}

/// Green (0.0) to yellow (0.5) to red (1.0).
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{:02X}{:02X}{:02X}", r, g, b)
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 30,
            label_width: 300,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, rows: usize) -> u32 {
        self.header_height + (rows as u32 * self.row_height) + self.padding
    }
}

struct Timeline {
    start: Instant,
    total_micros: f64,
}

impl Timeline {
    fn from_rows(rows: &[(&TaskId, &TaskExecution)]) -> Option<Self> {
        let start = rows.iter().map(|(_, t)| t.start).min()?;
        let end = rows.iter().map(|(_, t)| t.start + t.duration).max()?;

        Some(Self {
            start,
            total_micros: end.duration_since(start).as_micros().max(1) as f64,
        })
    }

    fn format_duration(micros: f64) -> String {
        if micros < 1000.0 {
            format!("{:.0}µs", micros)
        } else {
            format!("{:.2}ms", micros / 1000.0)
        }
    }
}

impl Diagnostics {
    /// Renders a waterfall chart of task execution as an SVG file.
    pub fn render_waterfall_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders a waterfall chart of task execution as an SVG string.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<(&TaskId, &TaskExecution)> = self.execution_times.iter().collect();
        rows.sort_by_key(|(id, t)| (t.start, *id));

        let Some(timeline) = Timeline::from_rows(&rows) else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">
            <text x="10" y="30" font-family="sans-serif">No tasks ran</text>
        </svg>"#
                .to_string();
        };

        let layout = WaterfallLayout::default();
        let mut svg = String::with_capacity(rows.len() * 500);

        write_header(&mut svg, &layout, rows.len());
        write_grid(&mut svg, &layout, &timeline);
        let _ = write_rows(&mut svg, &layout, &timeline, &rows);

        svg.push_str("</svg>");
        svg
    }
}

fn write_header(buf: &mut String, layout: &WaterfallLayout, rows: usize) {
    let css = r#"
        .task-row:nth-child(even) { fill: #f9f9f9; }
        .task-row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .bar { fill: #3b82f6; rx: 4; }
        .bar:hover { fill: #2563eb; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;

    let _ = write!(
        buf,
        r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>{}</style><rect width="100%" height="100%" fill="white" />"#,
        layout.total_width(),
        layout.total_height(rows),
        css
    );
}

fn write_grid(buf: &mut String, layout: &WaterfallLayout, timeline: &Timeline) {
    let steps = 5;
    for i in 0..=steps {
        let pct = i as f64 / steps as f64;
        let x = layout.label_width as f64 + layout.padding as f64 + (layout.chart_width as f64 * pct);

        let _ = write!(
            buf,
            r#"<line x1="{x:.1}" y1="{y1}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{y_text}" text-anchor="middle" class="axis-label">{label}</text>"#,
            x = x,
            y1 = layout.header_height,
            y_text = layout.header_height - 5,
            label = Timeline::format_duration(timeline.total_micros * pct)
        );
    }
}

fn write_rows(
    buf: &mut String,
    layout: &WaterfallLayout,
    timeline: &Timeline,
    rows: &[(&TaskId, &TaskExecution)],
) -> std::fmt::Result {
    for (i, (id, exec)) in rows.iter().enumerate() {
        let name = XmlSafe(id.as_str());

        let y_pos = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y_pos + (layout.row_height / 2);

        write!(
            buf,
            r#"<rect x="0" y="{}" width="100%" height="{}" class="task-row" />"#,
            y_pos, layout.row_height
        )?;

        write!(
            buf,
            r#"<text x="{}" y="{}" class="label" dominant-baseline="middle">{}</text>"#,
            layout.padding, y_center, name
        )?;

        let offset_micros = exec.start.duration_since(timeline.start).as_micros() as f64;
        let duration_micros = exec.duration.as_micros() as f64;

        let bar_x = layout.label_width as f64
            + layout.padding as f64
            + (offset_micros / timeline.total_micros * layout.chart_width as f64);
        let bar_w = (duration_micros / timeline.total_micros * layout.chart_width as f64).max(1.0);

        write!(
            buf,
            r#"<rect x="{x:.1}" y="{y}" width="{w:.1}" height="{h}" class="bar"><title>{name}: {dur:.2?}</title></rect>"#,
            x = bar_x,
            y = y_pos + 5,
            w = bar_w,
            h = layout.row_height - 10,
            name = name,
            dur = exec.duration
        )?;

        write!(
            buf,
            r#"<text x="{x:.1}" y="{y}" class="time" dominant-baseline="middle">{text}</text>"#,
            x = bar_x + bar_w + 5.0,
            y = y_center,
            text = Timeline::format_duration(duration_micros)
        )?;
    }

    Ok(())
}
