//! The library code for the `pagemill` site builder. A build mirrors an input
//! directory into an output directory: files with the template extension are
//! rendered as pages, everything else is copied byte for byte.
//!
//! The moving parts, from the bottom up:
//!
//! 1. [`template::TemplateSet`] composes the configured template files and
//!    directories into one set of named fragments. Every page is rendered
//!    against its own copy of the set, so a page may override any fragment
//!    (typically a `{{block}}` of the base layout) without affecting others.
//! 2. [`nav::NavigationContext`] backs the `url` and `active` template
//!    functions ([`funcs`]) for the page being rendered.
//! 3. [`build::Builder`] clears the output directory, walks the input tree and
//!    renders or copies every file concurrently. The number of files open at
//!    once is bounded by a [`limiter::ConcurrencyLimiter`].
//! 4. [`watch::Watcher`] polls the sources and rebuilds when something
//!    changes, while [`serve`] serves the output directory.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

pub mod build;
pub mod config;
pub mod funcs;
pub mod lexer;
pub mod limiter;
pub mod nav;
pub mod serve;
pub mod template;
pub mod util;
pub mod watch;
