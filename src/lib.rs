pub mod config;
pub mod docx;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod record;
pub mod template;

#[cfg(test)]
mod testutil;
