pub mod catalog;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod worker;
