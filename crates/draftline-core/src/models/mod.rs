pub mod draft;
pub mod render_task;

pub use draft::*;
pub use render_task::*;
