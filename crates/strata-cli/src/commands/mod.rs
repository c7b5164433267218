pub mod common;
pub mod render;
pub mod run;
pub mod validate;

pub use render::RenderCommand;
pub use run::RunCommand;
pub use validate::ValidateCommand;
