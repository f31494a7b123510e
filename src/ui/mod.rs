pub mod icons;
pub mod render;

pub use render::{render_event, render_status};
