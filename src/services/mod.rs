pub mod archive;
pub mod pagination;
pub mod pipeline;
pub mod renderer;
pub mod transform_backend;
