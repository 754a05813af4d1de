pub mod color;
pub mod logging;
pub mod paths;

pub use color::parse_color;
pub use logging::FileLogger;
pub use paths::{
    config_dir, config_search_path, data_dir, kmsprobe_config_dir, kmsprobe_data_dir,
    kmsprobe_log_dir, SYSTEM_CONFIG,
};
