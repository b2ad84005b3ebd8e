use std::io::{IsTerminal, Write};

use anstream::{AutoStream, ColorChoice};
use anstyle::Style;

use crate::model::{OutputStream, ProcessStatus};
use crate::ui::table::render_table;
use crate::ui::theme::{resolve_color_enabled, OutputMode, Theme};
use crate::ui::widgets::{MessageBlock, NoticeLevel, StatusTally, TableSpec};
use crate::ui::UiResult;

pub struct PlainRenderer<W: Write> {
    writer: W,
    color_enabled: bool,
    theme: Theme,
}

impl<W: Write> PlainRenderer<W> {
    pub fn new(writer: W, color_enabled: bool) -> Self {
        Self {
            writer,
            color_enabled,
            theme: Theme::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn style_text(&self, style: Style, text: &str) -> String {
        if !self.color_enabled {
            return text.to_owned();
        }
        format!("{}{}{}", style.render(), text, style.render_reset())
    }

    fn write_block(&mut self, label: &str, style: Style, block: &MessageBlock) -> UiResult<()> {
        let marker = self.style_text(style, label);
        writeln!(self.writer, "{marker} {}", block.title)?;
        writeln!(self.writer, "  {}", block.body)?;
        if let Some(hint) = &block.hint {
            let hint_label = self.style_text(self.theme.muted, "hint");
            writeln!(self.writer, "  {hint_label}: {hint}")?;
        }
        Ok(())
    }

    pub fn error_block(&mut self, block: &MessageBlock) -> UiResult<()> {
        self.write_block("[error]", self.theme.error, block)
    }

    pub fn notice(&mut self, level: NoticeLevel, body: &str) -> UiResult<()> {
        let (label, style) = match level {
            NoticeLevel::Info => ("info", self.theme.accent),
            NoticeLevel::Success => ("ok", self.theme.success),
            NoticeLevel::Warning => ("warn", self.theme.warning),
            NoticeLevel::Error => ("error", self.theme.error),
        };
        let marker = self.style_text(style, "•");
        let label = self.style_text(self.theme.muted, label);
        writeln!(self.writer, "{marker} {label}: {body}")?;
        Ok(())
    }

    /// One captured line, prefixed with the process name.
    pub fn output_line(&mut self, name: &str, stream: OutputStream, content: &str) -> UiResult<()> {
        let prefix = self.style_text(self.theme.label, &format!("[{name}]"));
        let body = self.style_text(self.theme.for_stream(stream), content);
        writeln!(self.writer, "{prefix} {body}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn status_line(
        &mut self,
        name: &str,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> UiResult<()> {
        let prefix = self.style_text(self.theme.label, &format!("[{name}]"));
        let label = self.style_text(self.theme.for_status(status), status.label());
        match exit_code {
            Some(code) => writeln!(self.writer, "{prefix} {label} (exit {code})")?,
            None => writeln!(self.writer, "{prefix} {label}")?,
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn summary(&mut self, tally: StatusTally) -> UiResult<()> {
        let completed = self.style_text(self.theme.success, &tally.completed.to_string());
        let stopped = self.style_text(self.theme.warning, &tally.stopped.to_string());
        let failed = self.style_text(self.theme.error, &tally.failed.to_string());
        writeln!(
            self.writer,
            "summary  completed:{completed}  stopped:{stopped}  failed:{failed}"
        )?;
        Ok(())
    }

    pub fn table(&mut self, spec: &TableSpec) -> UiResult<()> {
        let rendered = render_table(spec);
        writeln!(self.writer, "{rendered}")?;
        Ok(())
    }
}

impl PlainRenderer<AutoStream<std::io::Stdout>> {
    pub fn stdout(mode: OutputMode) -> Self {
        let stream = AutoStream::new(std::io::stdout(), color_choice(mode));
        let color_enabled = resolve_color_enabled(mode, std::io::stdout().is_terminal());
        Self::new(stream, color_enabled)
    }
}

impl PlainRenderer<AutoStream<std::io::Stderr>> {
    pub fn stderr(mode: OutputMode) -> Self {
        let stream = AutoStream::new(std::io::stderr(), color_choice(mode));
        let color_enabled = resolve_color_enabled(mode, std::io::stderr().is_terminal());
        Self::new(stream, color_enabled)
    }
}

fn color_choice(mode: OutputMode) -> ColorChoice {
    match mode {
        OutputMode::Auto => ColorChoice::Auto,
        OutputMode::Always => ColorChoice::AlwaysAnsi,
        OutputMode::Never => ColorChoice::Never,
    }
}
