//! Utilities module - text processing shared by the stores and the CLI

pub mod text_utils;

pub use text_utils::TextUtils;
