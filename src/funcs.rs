//! The functions available to templates:
//!
//! * `url "/path"` resolves a link from the current page
//!   ([`NavigationContext::resolve_url`]).
//! * `active "/path"` reports whether a link points at the current page or
//!   one of its ancestors ([`NavigationContext::is_active`]).
//! * `json "file.json"` loads and parses a JSON file from the data directory.
//! * `read "file"` loads a file from the data directory as a string.
//! * `sprintf` formats like the built-in `printf`.
//! * `uniq` returns a fresh random identifier (32 hex digits).
//! * `html` passes its argument through untouched; output is never escaped.
//!
//! [`gtmpl`] functions are plain function pointers, so the page-specific state
//! they need is bound to the executing thread for the duration of a single
//! render (see [`Scope::bind`]).

use crate::nav::NavigationContext;
use gtmpl::Template;
use gtmpl_value::{Func, Value};
use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

thread_local! {
    static CURRENT: RefCell<Option<Scope>> = RefCell::new(None);
}

/// Returns an empty template with all of the page functions registered.
/// Templates must be parsed with these functions present, otherwise calls to
/// them are rejected as undefined.
pub fn engine() -> Template {
    let mut template = Template::default();
    template.add_func("url", url as Func);
    template.add_func("active", active as Func);
    template.add_func("json", json as Func);
    template.add_func("read", read as Func);
    template.add_func("sprintf", gtmpl::funcs::printf as Func);
    template.add_func("uniq", uniq as Func);
    template.add_func("html", html as Func);
    template
}

/// Everything the template functions know about the page being rendered.
#[derive(Clone, Debug)]
pub struct Scope {
    pub nav: NavigationContext,

    /// The directory `json` and `read` load files from.
    pub data_dir: PathBuf,
}

impl Scope {
    /// Runs `f` with this scope visible to the template functions called on
    /// the current thread. The previous scope (if any) is restored afterwards,
    /// even if `f` panics.
    pub fn bind<T>(self, f: impl FnOnce() -> T) -> T {
        struct Restore(Option<Scope>);

        impl Drop for Restore {
            fn drop(&mut self) {
                let previous = self.0.take();
                CURRENT.with(|current| *current.borrow_mut() = previous);
            }
        }

        let _restore = Restore(CURRENT.with(|current| current.replace(Some(self))));
        f()
    }
}

fn with_scope<T>(
    name: &str,
    f: impl FnOnce(&Scope) -> Result<T, String>,
) -> Result<T, String> {
    CURRENT.with(|current| match &*current.borrow() {
        Some(scope) => f(scope),
        None => Err(format!("{} called outside of a page render", name)),
    })
}

fn string_arg(name: &str, args: &[Value]) -> Result<String, String> {
    match args {
        [Value::String(s)] => Ok(s.clone()),
        _ => Err(format!("{} expects a single string argument", name)),
    }
}

fn url(args: &[Value]) -> Result<Value, String> {
    let target = string_arg("url", args)?;
    with_scope("url", |scope| match scope.nav.resolve_url(&target) {
        Ok(url) => Ok(Value::String(url)),
        Err(e) => Err(e.to_string()),
    })
}

fn active(args: &[Value]) -> Result<Value, String> {
    let target = string_arg("active", args)?;
    with_scope("active", |scope| match scope.nav.is_active(&target) {
        Ok(active) => Ok(Value::Bool(active)),
        Err(e) => Err(e.to_string()),
    })
}

fn read(args: &[Value]) -> Result<Value, String> {
    let file = string_arg("read", args)?;
    with_scope("read", |scope| {
        let path = scope.data_dir.join(&file);
        std::fs::read_to_string(&path)
            .map(Value::String)
            .map_err(|e| format!("Reading data file '{}': {}", path.display(), e))
    })
}

fn json(args: &[Value]) -> Result<Value, String> {
    let file = string_arg("json", args)?;
    with_scope("json", |scope| {
        let path = scope.data_dir.join(&file);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| format!("Reading data file '{}': {}", path.display(), e))?;
        let parsed: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| format!("Parsing JSON file '{}': {}", path.display(), e))?;
        Ok(to_value(parsed))
    })
}

fn uniq(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(String::from("uniq takes no arguments"));
    }
    let bytes: [u8; 16] = rand::rng().random();
    Ok(Value::String(
        bytes.iter().map(|b| format!("{:02x}", b)).collect(),
    ))
}

fn html(args: &[Value]) -> Result<Value, String> {
    match args {
        [value] => Ok(value.clone()),
        _ => Err(String::from("html expects a single argument")),
    }
}

/// Converts a parsed JSON document into a template [`Value`].
fn to_value(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Value::from(i),
            (None, Some(u)) => Value::from(u),
            (None, None) => Value::from(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array(items.into_iter().map(to_value).collect()),
        Json::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, to_value(v)))
                .collect::<HashMap<String, Value>>(),
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;

    fn scope(data_dir: &Path) -> Scope {
        Scope {
            nav: NavigationContext::new(data_dir, Path::new("blog/post.html"), "html"),
            data_dir: data_dir.to_owned(),
        }
    }

    #[test]
    fn test_functions_fail_outside_a_render() {
        let args = [Value::String(String::from("/"))];
        assert_eq!(
            Err(String::from("active called outside of a page render")),
            active(&args).map(|_| ())
        );
    }

    #[test]
    fn test_bind_restores_previous_scope() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let args = [Value::String(String::from("/blog"))];
        scope(dir.path()).bind(|| {
            assert!(matches!(active(&args), Ok(Value::Bool(true))));
        });
        assert!(active(&args).is_err());
        Ok(())
    }

    #[test]
    fn test_read_and_json() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("motd.txt"), "hello")?;
        std::fs::write(
            dir.path().join("site.json"),
            r#"{"title": "Site", "tags": ["a", "b"], "draft": false}"#,
        )?;

        scope(dir.path()).bind(|| {
            match read(&[Value::String(String::from("motd.txt"))]) {
                Ok(Value::String(s)) => assert_eq!("hello", s),
                other => panic!("wanted a string; found {:?}", other),
            }
            match json(&[Value::String(String::from("site.json"))]) {
                Ok(Value::Object(fields)) => {
                    assert!(matches!(fields.get("title"), Some(Value::String(s)) if s == "Site"));
                    assert!(matches!(fields.get("tags"), Some(Value::Array(a)) if a.len() == 2));
                    assert!(matches!(fields.get("draft"), Some(Value::Bool(false))));
                }
                other => panic!("wanted an object; found {:?}", other),
            }
            assert!(json(&[Value::String(String::from("missing.json"))]).is_err());
        });
        Ok(())
    }

    #[test]
    fn test_sprintf() {
        let args = [
            Value::String(String::from("%d-%s")),
            Value::from(7i64),
            Value::String(String::from("seven")),
        ];
        assert!(matches!(gtmpl::funcs::printf(&args), Ok(Value::String(s)) if s == "7-seven"));
    }

    #[test]
    fn test_uniq_is_random_hex() {
        let first = match uniq(&[]) {
            Ok(Value::String(s)) => s,
            other => panic!("wanted a string; found {:?}", other),
        };
        assert_eq!(32, first.len());
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!matches!(uniq(&[]), Ok(Value::String(s)) if s == first));
        assert!(uniq(&[Value::Nil]).is_err());
    }

    #[test]
    fn test_html_passes_through() {
        let markup = Value::String(String::from("<b>x</b>"));
        assert!(matches!(html(&[markup]), Ok(Value::String(s)) if s == "<b>x</b>"));
        assert!(html(&[]).is_err());
    }

    #[test]
    fn test_engine_registers_all_functions() {
        let mut template = engine();
        let source = String::from(
            "{{sprintf \"%d\" 1}}{{uniq}}{{html \"<b>x</b>\"}}{{json \"a\"}}{{read \"b\"}}{{url \"/\"}}{{active \"/\"}}",
        );
        assert_eq!(Ok(()), template.parse(&source).map_err(|e| e.to_string()));
    }

    #[test]
    fn test_string_arg_rejects_other_arity() {
        assert!(string_arg("url", &[]).is_err());
        assert!(string_arg("url", &[Value::Bool(true)]).is_err());
    }
}
