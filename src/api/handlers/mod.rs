pub mod form;
pub mod index;
pub mod prepare;
pub mod render;
pub mod run;
