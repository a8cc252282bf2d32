pub mod document;
pub mod package;
pub mod text;
pub mod tree;
pub mod xml;
