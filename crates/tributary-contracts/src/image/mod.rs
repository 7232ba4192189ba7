pub mod dimensions;
pub mod settings;

pub use dimensions::{calculate_dimensions, total_megapixels};
pub use settings::{parse_settings_stepwise, AspectRatio, PromptSettings};
