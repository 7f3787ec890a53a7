use std::fmt::Display;
use std::time::Duration;

use console::Style;
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

const ANSI_BLUE: Style = Style::new().blue();

/// Style of the root span tracking the whole build.
pub(crate) fn get_style_build() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Style of the spinner shown for each running task.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")
}

/// Renders a duration the way build summaries show it, e.g. `(+1250ms)`.
pub(crate) fn as_overhead(elapsed: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", elapsed.as_millis()))
}
