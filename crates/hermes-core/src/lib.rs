//! Hermes Core - capture model and traffic logic.
//!
//! This crate holds everything that does not touch a socket:
//! - Captured entries and the shared entry builder
//! - Content decoding (gzip, deflate, brotli)
//! - Rule matching and rule file normalization
//! - Failure classification for upstream errors
//! - The bounded entry history
//! - HAR 1.2 import and export

pub mod decoder;
pub mod entry;
pub mod error;
pub mod failure;
pub mod har;
pub mod headers;
pub mod history;
pub mod rule_engine;
pub mod rule_file;
pub mod target;

pub use decoder::{body_to_text, decode_body, is_text, ContentEncoding};
pub use entry::{new_entry_id, EntryBuilder, ProxyEntry, CLOSED_BY_RULE};
pub use error::{CoreError, Result};
pub use failure::ExchangeFailure;
pub use har::{from_har_json, read_har, to_har, write_har, Har, HarImport};
pub use headers::{
    apply_header_overrides, build_replay_headers, get_header, sanitize_headers, HeaderMap,
    HeaderPair,
};
pub use history::{EntryStore, HISTORY_LIMIT};
pub use rule_engine::{first_match, Rule, RuleAction, RuleEngine, RuleMatch, RuleRequestInfo};
pub use rule_file::{
    load_rules, normalize_rule_values, normalize_rules, parse_rules, save_rules, RawRule,
};
pub use target::{Scheme, TargetUrl};

/// First port tried when binding the proxy listener.
pub const PROXY_PORT_START: u16 = 8000;

/// File name of the rules document inside the data directory.
pub const RULES_FILENAME: &str = "rules.json";
