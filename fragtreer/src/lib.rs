mod args;
mod driver;

pub use args::*;
pub use driver::{FragTreer, FragTreerError, TreeReport, CONFIG_FILE_NAME, ENV_PREFIX};
