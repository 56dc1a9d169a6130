//! Defines [`TemplateSet`], the composed collection of named template
//! fragments every page is rendered against.
//!
//! A set is composed once per build from an ordered list of sources. The first
//! source is the base template: its top-level body is what gets executed for
//! every page. Later sources (files, or directories walked recursively) add or
//! replace named fragments. Like Go's `ParseFiles`, the top-level body of each
//! file is itself a fragment named after the file's basename, and
//! `{{define "name"}}` / `{{block "name" .}}` bodies are fragments named
//! `name`. A later definition replaces an earlier one unless its body is only
//! whitespace.
//!
//! Rendering a page clones the set, merges the page's own fragments into the
//! clone (so `{{define "content"}}` in a page overrides the layout's
//! `{{block "content" .}}`), and executes the base fragment. The canonical set
//! is never mutated after composition.

use crate::funcs::{self, Scope};
use crate::lexer::{self, Token};
use gtmpl::{Context, Template};
use gtmpl_value::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// The field of the page data (`.`) holding the page's relative path.
pub const PATH_FIELD: &str = "Path";

/// An ordered collection of named template fragments with one designated base.
/// Cloning is cheap: fragment names and bodies are reference counted.
#[derive(Clone, Debug)]
pub struct TemplateSet {
    base: Arc<str>,
    fragments: Vec<(Arc<str>, Arc<str>)>,
}

impl TemplateSet {
    /// Composes a set from `sources`. The first source must be a file and
    /// becomes the base template; the remaining sources may be files or
    /// directories.
    pub fn compose<P: AsRef<Path>>(sources: &[P]) -> Result<TemplateSet> {
        let (base, rest) = match sources.split_first() {
            Some(split) => split,
            None => return Err(Error::NoSources),
        };

        let base = base.as_ref();
        let mut set = TemplateSet {
            base: Arc::from(basename(base).as_str()),
            fragments: Vec::new(),
        };
        set.add_file(base)?;
        tracing::debug!("Parsed base template: {}", base.display());

        for source in rest {
            let source = source.as_ref();
            let metadata = std::fs::metadata(source).map_err(|err| Error::Stat {
                path: source.to_owned(),
                err,
            })?;
            if metadata.is_dir() {
                for entry in WalkDir::new(source) {
                    let entry = entry.map_err(|err| Error::Walk {
                        path: source.to_owned(),
                        err,
                    })?;
                    if !entry.file_type().is_dir() {
                        set.add_file(entry.path())?;
                    }
                }
            } else {
                set.add_file(source)?;
            }
            tracing::debug!("Parsed templates: {}", source.display());
        }

        Ok(set)
    }

    /// The name of the base fragment (the basename of the first source).
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Looks up the body of the fragment called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fragments
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, body)| &**body)
    }

    /// The fragment names in the order they were first defined.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|(name, _)| &**name)
    }

    /// Returns a copy of the set with the page at `path` (whose contents are
    /// `text`) parsed into it.
    pub fn with_page(&self, path: &Path, text: &str) -> Result<TemplateSet> {
        let mut set = self.clone();
        set.add_text(path, text)?;
        Ok(set)
    }

    /// Renders the page at `path` into `out`: clones the set, adds the page,
    /// and executes the base template. `scope` is visible to the template
    /// functions for the duration of the render.
    pub fn render_page<W: Write>(
        &self,
        path: &Path,
        text: &str,
        scope: Scope,
        out: &mut W,
    ) -> Result<()> {
        let set = self.with_page(path, text)?;
        let template = set.parse().map_err(|msg| Error::Parse {
            path: path.to_owned(),
            msg,
        })?;

        let mut data = HashMap::new();
        data.insert(
            PATH_FIELD.to_owned(),
            Value::String(scope.nav.relative_path().to_owned()),
        );
        let context = Context::from(Value::Object(data)).map_err(|msg| Error::Execute {
            path: path.to_owned(),
            msg: msg.to_string(),
        })?;

        scope
            .bind(|| template.execute(out, &context))
            .map_err(|msg| Error::Execute {
                path: path.to_owned(),
                msg: msg.to_string(),
            })
    }

    /// Assembles the set into a single template source whose root executes
    /// the base fragment.
    pub fn source(&self) -> String {
        let mut source = format!("{{{{template {} .}}}}", quote(&self.base));
        for (name, body) in &self.fragments {
            source.push_str(&format!("{{{{define {}}}}}{}{{{{end}}}}", quote(name), body));
        }
        source
    }

    fn parse(&self) -> std::result::Result<Template, String> {
        let mut template = funcs::engine();
        template
            .parse(self.source())
            .map_err(|msg| strip_location(&msg).to_owned())?;
        Ok(template)
    }

    fn add_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::Read {
            path: path.to_owned(),
            err,
        })?;
        self.add_text(path, &text)
    }

    // Splits `text` into fragments, checks that they parse on their own, then
    // merges them into the set.
    fn add_text(&mut self, path: &Path, text: &str) -> Result<()> {
        let fragments = split(text).map_err(|msg| Error::Syntax {
            path: path.to_owned(),
            msg,
        })?;

        let name = basename(path);
        let mut own = TemplateSet {
            base: Arc::from(name.as_str()),
            fragments: Vec::new(),
        };
        own.insert(&name, &fragments.body);
        for (fragment, body) in &fragments.defined {
            own.insert(fragment, body);
        }
        own.parse().map_err(|msg| Error::Parse {
            path: path.to_owned(),
            msg,
        })?;

        for (fragment, body) in own.fragments {
            self.insert(&fragment, &body);
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, body: &str) {
        match self.fragments.iter_mut().find(|(n, _)| &**n == name) {
            Some((_, existing)) => {
                if !body.trim().is_empty() {
                    *existing = Arc::from(body);
                }
            }
            None => self.fragments.push((Arc::from(name), Arc::from(body))),
        }
    }
}

fn basename(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => path.display().to_string(),
    }
}

// Drops the `template: <name>:<line>:` prefix from engine errors. The line
// refers to the assembled source, not to the file the error came from.
fn strip_location(msg: &str) -> &str {
    let rest = match msg.strip_prefix("template: ") {
        Some(rest) => rest,
        None => return msg,
    };
    let mut parts = rest.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(line), Some(detail))
            if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) =>
        {
            detail
        }
        _ => msg,
    }
}

fn quote(name: &str) -> String {
    format!("{:?}", name)
}

/// The fragments found in a single source.
#[derive(Debug, Default, PartialEq, Eq)]
struct Fragments {
    /// Everything outside of `define` actions, with `block` actions replaced
    /// by `template` calls.
    body: String,

    /// `define` and `block` bodies, in source order.
    defined: Vec<(String, String)>,
}

enum Frame {
    Fragment { name: String, body: String },
    Control,
}

// The buffer currently being written to: the innermost open fragment, or the
// top-level body.
fn output<'a>(body: &'a mut String, frames: &'a mut [Frame]) -> &'a mut String {
    let innermost = frames.iter_mut().rev().find_map(|frame| match frame {
        Frame::Fragment { body, .. } => Some(body),
        Frame::Control => None,
    });
    match innermost {
        Some(fragment) => fragment,
        None => body,
    }
}

fn push_action(buffer: &mut String, action: &str) {
    buffer.push_str("{{");
    buffer.push_str(action);
    buffer.push_str("}}");
}

fn split(src: &str) -> std::result::Result<Fragments, String> {
    let mut fragments = Fragments::default();
    let mut frames: Vec<Frame> = Vec::new();

    for token in lexer::tokenize(src).map_err(|e| e.to_string())? {
        let action = match token {
            Token::Text(text) => {
                output(&mut fragments.body, &mut frames).push_str(text);
                continue;
            }
            Token::Action(action) => action,
        };

        match token.keyword().unwrap_or_default() {
            keyword @ "define" => {
                if !frames.is_empty() {
                    return Err(format!("unexpected {{{{{}}}}} inside another action", action));
                }
                let (name, rest) = named(keyword, action)?;
                if !rest.trim().is_empty() {
                    return Err(format!("unexpected '{}' in {{{{{}}}}}", rest.trim(), action));
                }
                frames.push(Frame::Fragment {
                    name,
                    body: String::new(),
                });
            }
            keyword @ "block" => {
                let (name, pipeline) = named(keyword, action)?;
                let call = format!("template {} {}", quote(&name), pipeline.trim());
                push_action(output(&mut fragments.body, &mut frames), call.trim_end());
                frames.push(Frame::Fragment {
                    name,
                    body: String::new(),
                });
            }
            "if" | "range" | "with" => {
                push_action(output(&mut fragments.body, &mut frames), action);
                frames.push(Frame::Control);
            }
            "end" => match frames.pop() {
                None => return Err(String::from("unexpected {{end}}")),
                Some(Frame::Control) => {
                    push_action(output(&mut fragments.body, &mut frames), action)
                }
                Some(Frame::Fragment { name, body }) => fragments.defined.push((name, body)),
            },
            _ => push_action(output(&mut fragments.body, &mut frames), action),
        }
    }

    match frames.last() {
        None => Ok(fragments),
        Some(Frame::Fragment { name, .. }) => Err(format!("unclosed definition of '{}'", name)),
        Some(Frame::Control) => Err(String::from("unclosed action; missing {{end}}")),
    }
}

// Reads the quoted template name following `keyword`.
fn named<'a>(keyword: &str, action: &'a str) -> std::result::Result<(String, &'a str), String> {
    lexer::string_literal(&action[keyword.len()..])
        .ok_or_else(|| format!("{{{{{}}}}} requires a quoted template name", action))
}

type Result<T> = std::result::Result<T, Error>;

/// Errors composing a [`TemplateSet`] or rendering a page with it. Any of
/// these during composition is fatal to the build; during a page render they
/// only fail that page.
#[derive(Debug)]
pub enum Error {
    /// No template sources were configured.
    NoSources,

    /// A template source couldn't be stat'd.
    Stat { path: PathBuf, err: std::io::Error },

    /// A template directory couldn't be walked.
    Walk { path: PathBuf, err: walkdir::Error },

    /// A template file couldn't be read.
    Read { path: PathBuf, err: std::io::Error },

    /// The `define`/`block`/`end` structure of a file is malformed.
    Syntax { path: PathBuf, msg: String },

    /// The template engine rejected a file.
    Parse { path: PathBuf, msg: String },

    /// Executing the base template for a page failed.
    Execute { path: PathBuf, msg: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoSources => write!(f, "At least the base template is required"),
            Error::Stat { path, err } => {
                write!(f, "Reading template source '{}': {}", path.display(), err)
            }
            Error::Walk { path, err } => {
                write!(f, "Walking template directory '{}': {}", path.display(), err)
            }
            Error::Read { path, err } => {
                write!(f, "Reading template file '{}': {}", path.display(), err)
            }
            Error::Syntax { path, msg } | Error::Parse { path, msg } => {
                write!(f, "Parsing template '{}': {}", path.display(), msg)
            }
            Error::Execute { path, msg } => {
                write!(f, "Executing template for '{}': {}", path.display(), msg)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stat { err, .. } | Error::Read { err, .. } => Some(err),
            Error::Walk { err, .. } => Some(err),
            _ => None,
        }
    }
}
