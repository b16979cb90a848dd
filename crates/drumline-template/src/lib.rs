//! `drumline-template` — SQL-safe parameter substitution.
//!
//! Query templates carry `{{name}}` placeholders. The [`Materializer`]
//! replaces each placeholder with a properly escaped SQL literal: strings are
//! quoted with embedded quotes doubled, lists render as a parenthesized
//! literal list or, past a size threshold, as a `VALUES` construction to stay
//! under backend query-length limits. Raw text is never spliced in.
//!
//! Placeholders follow an explicit token grammar — a scan pass over the
//! template, not regex matching on SQL shapes.

pub mod error;
pub mod materialize;

pub use error::{Result, TemplateError};
pub use materialize::{resolve_params, Materializer, ParameterSpec};
