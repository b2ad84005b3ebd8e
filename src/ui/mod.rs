pub mod plain_renderer;
pub mod table;
pub mod theme;
pub mod widgets;

use thiserror::Error;

pub use plain_renderer::PlainRenderer;
pub use theme::OutputMode;
pub use widgets::{MessageBlock, NoticeLevel, StatusTally, TableSpec};

pub type UiResult<T> = Result<T, UiError>;

#[derive(Debug, Error)]
pub enum UiError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
