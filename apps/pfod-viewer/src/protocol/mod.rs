//! Wire-level helpers for the pfod command grammar.
//!
//! Requests are short brace-delimited strings (`{.}`, `{name}`,
//! `{version:name}`, touch-zone commands). Responses arrive as JSON carrying
//! either a `cmd` token array or a `pfodDrawing` field; `response` classifies
//! them without interpreting drawing items.

pub mod command;
pub mod response;

pub use command::{drawing_request, TouchCommand, TouchFilter, MAIN_MENU_COMMAND};
pub use response::{DiagnosticView, MenuResponse, ParsedResponse, RawResponse, ResponseShape};
