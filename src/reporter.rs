use crate::analysis::rebuild::RebuildPlan;
use crate::analysis::units::pretty_size;
use crate::models::{ObjectKind, ReportRow};
use clap::ValueEnum;
use snafu::{ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
pub enum ReporterError {
    #[snafu(display("Failed to write output: {}", source))]
    OutputError { source: std::io::Error },

    #[snafu(display("Failed to serialize report: {}", source))]
    Serialize { source: serde_json::Error },
}

type Result<T, E = ReporterError> = std::result::Result<T, E>;

const NO_BLOAT: &str = "No bloat found for given parameters";
const NO_INDEXES: &str = "Bloat statistics table contains no indexes for conditions given.";

/// Width the dotted leader pads simple lines to.
const SIMPLE_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Numbered, dot-justified lines
    Simple,
    /// JSON array on one line
    Json,
    /// Indented JSON array
    Jsonpretty,
    /// Markdown table
    Markdown,
}

pub struct Reporter {
    format: ReportFormat,
    quiet: u8,
}

impl Reporter {
    /// `quiet` of 1 hides the empty-result message, 2 hides all report output.
    pub fn new(format: ReportFormat, quiet: u8) -> Self {
        Self { format, quiet }
    }

    pub fn report(&self, rows: &[ReportRow]) -> Result<()> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.write(&mut handle, rows)
    }

    pub fn report_rebuild(&self, plans: &[RebuildPlan]) -> Result<()> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.write_rebuild(&mut handle, plans)
    }

    pub fn write<W: Write>(&self, out: &mut W, rows: &[ReportRow]) -> Result<()> {
        if self.quiet >= 2 {
            return Ok(());
        }

        match self.format {
            ReportFormat::Json => {
                let json = serde_json::to_string(rows).context(SerializeSnafu)?;
                writeln!(out, "{}", json).context(OutputSnafu)?;
            }
            ReportFormat::Jsonpretty => {
                let json = serde_json::to_string_pretty(rows).context(SerializeSnafu)?;
                writeln!(out, "{}", json).context(OutputSnafu)?;
            }
            _ if rows.is_empty() => {
                if self.quiet == 0 {
                    writeln!(out, "{}", NO_BLOAT).context(OutputSnafu)?;
                }
            }
            ReportFormat::Simple => self.write_simple(out, rows)?,
            ReportFormat::Markdown => self.write_markdown(out, rows)?,
        }
        Ok(())
    }

    fn write_simple<W: Write>(&self, out: &mut W, rows: &[ReportRow]) -> Result<()> {
        for (i, row) in rows.iter().enumerate() {
            writeln!(out, "{}", simple_line(i + 1, row)).context(OutputSnafu)?;
            if row.kind == ObjectKind::ToastTable {
                writeln!(out, "      Real table: {}", row.owning_table).context(OutputSnafu)?;
            }
        }
        Ok(())
    }

    fn write_markdown<W: Write>(&self, out: &mut W, rows: &[ReportRow]) -> Result<()> {
        writeln!(out, "# PostgreSQL Bloat Report\n").context(OutputSnafu)?;

        let total: i64 = rows.iter().map(|r| r.wasted_bytes).sum();
        writeln!(
            out,
            "Found **{}** bloated objects wasting **{}** in total.\n",
            rows.len(),
            pretty_size(total)
        )
        .context(OutputSnafu)?;

        writeln!(out, "| # | Object | Type | Size | Wasted | Wasted % | Table |")
            .context(OutputSnafu)?;
        writeln!(out, "|---|--------|------|------|--------|----------|-------|")
            .context(OutputSnafu)?;

        for (i, row) in rows.iter().enumerate() {
            writeln!(
                out,
                "| {} | `{}.{}` | {} | {} | {} | {:.2}% | {} |",
                i + 1,
                row.schema,
                row.name,
                row.label.as_str(),
                pretty_size(row.size_bytes),
                pretty_size(row.wasted_bytes),
                row.wasted_percent,
                row.owning_table
            )
            .context(OutputSnafu)?;
        }
        writeln!(out).context(OutputSnafu)?;

        Ok(())
    }

    pub fn write_rebuild<W: Write>(&self, out: &mut W, plans: &[RebuildPlan]) -> Result<()> {
        if self.quiet >= 2 {
            return Ok(());
        }
        if plans.is_empty() {
            writeln!(out, "{}", NO_INDEXES).context(OutputSnafu)?;
            return Ok(());
        }

        for plan in plans {
            writeln!(out).context(OutputSnafu)?;
            writeln!(out, "{}", plan.render()).context(OutputSnafu)?;
        }
        writeln!(out).context(OutputSnafu)?;
        Ok(())
    }
}

fn simple_line(counter: usize, row: &ReportRow) -> String {
    let object = format!(
        "{}. {}.{} ({}) ",
        counter,
        row.schema,
        row.name,
        row.label.as_str()
    );
    let waste = format!("({:.2}%)", row.wasted_percent);
    let size = format!("{} wasted", pretty_size(row.wasted_bytes));

    let used = object.chars().count() + waste.chars().count() + size.chars().count();
    let dots = ".".repeat(SIMPLE_WIDTH.saturating_sub(used));

    format!("{object}{dots}{waste} {size}")
}
