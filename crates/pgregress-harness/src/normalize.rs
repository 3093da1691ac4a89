//! Statement normalization.
//!
//! Raw fixture statements are written for `psql`: they may open with backslash
//! meta-commands, reference `:variables`, carry inline `COPY ... FROM stdin` data,
//! end in `\gset`, and keep the `-- comments` of the source script. Normalization
//! turns one raw statement into the meta-commands the harness applies itself and at
//! most one self-contained SQL unit for the engine.

use std::collections::BTreeMap;

use pgregress_fixture_exec::EngineStatement;
use thiserror::Error;

use crate::error::FixtureError;

/// A psql backslash command, never sent to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaCommand {
    /// Command name without the backslash (`getenv`, `set`, `d+`, ...).
    pub name: String,
    /// Arguments after quoting and interpolation.
    pub args: Vec<String>,
}

impl MetaCommand {
    /// Commands the harness applies to the session's variables.
    #[must_use]
    pub fn binds_variables(&self) -> bool {
        matches!(self.name.as_str(), "set" | "unset" | "getenv")
    }
}

/// SQL ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStatement {
    /// Comments stripped, variables interpolated.
    pub sql: String,
    /// Raw text as written in the fixture, comments included.
    pub display: String,
    pub copy_payload: Option<String>,
    /// Set when the statement ended in `\gset`; holds the (possibly empty) prefix.
    pub gset_prefix: Option<String>,
}

impl NormalizedStatement {
    #[must_use]
    pub fn to_engine(&self) -> EngineStatement {
        let statement = EngineStatement::new(self.sql.clone());
        match &self.copy_payload {
            Some(payload) => statement.with_copy_payload(payload.clone()),
            None => statement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Sql(NormalizedStatement),
    Meta(MetaCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unresolved variable `:{0}`")]
    UnresolvedVariable(String),
    #[error("unexpected text after COPY data terminator")]
    TrailingCopyData,
}

impl NormalizeError {
    /// Attach the statement position.
    #[must_use]
    pub fn at(self, file: &str, index: usize) -> FixtureError {
        match self {
            Self::UnresolvedVariable(name) => FixtureError::UnresolvedVariable {
                file: file.to_string(),
                index,
                name,
            },
            Self::TrailingCopyData => FixtureError::TrailingCopyData {
                file: file.to_string(),
                index,
            },
        }
    }
}

/// psql variables visible to a file run, plus the environment `\getenv` reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    inherit_process_env: bool,
    lenient: bool,
}

impl Variables {
    #[must_use]
    pub fn new(
        values: BTreeMap<String, String>,
        env: BTreeMap<String, String>,
        inherit_process_env: bool,
    ) -> Self {
        Self {
            values,
            env,
            inherit_process_env,
            lenient: false,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) {
        self.values.remove(name);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Environment lookup for `\getenv`: configured map first, then the process.
    #[must_use]
    pub fn getenv(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned().or_else(|| {
            self.inherit_process_env
                .then(|| std::env::var(key).ok())
                .flatten()
        })
    }

    /// In lenient mode unbound references are left as written instead of failing.
    /// Used by the preflight pass once a `\gset` makes later bindings unknowable.
    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
    }

    #[must_use]
    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    fn resolve(&self, name: &str) -> Result<Option<&str>, NormalizeError> {
        match self.get(name) {
            Some(value) => Ok(Some(value)),
            None if self.lenient => Ok(None),
            None => Err(NormalizeError::UnresolvedVariable(name.to_string())),
        }
    }

    fn apply(&mut self, meta: &MetaCommand) {
        match (meta.name.as_str(), meta.args.as_slice()) {
            ("set", [name, values @ ..]) => self.set(name.clone(), values.concat()),
            ("unset", [name, ..]) => self.unset(name),
            ("getenv", [name, key, ..]) => {
                if let Some(value) = self.getenv(key) {
                    self.set(name.clone(), value);
                }
            }
            _ => {}
        }
    }
}

/// Normalize one raw statement, applying variable-binding meta-commands to `vars`
/// as they are encountered.
pub fn normalize(raw: &str, vars: &mut Variables) -> Result<Vec<Normalized>, NormalizeError> {
    let mut out = Vec::new();
    let mut lines = raw.lines().peekable();
    while let Some(line) = lines.peek() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            lines.next();
            continue;
        }
        let Some(command) = trimmed.strip_prefix('\\') else {
            break;
        };
        let meta = parse_meta(command, vars)?;
        vars.apply(&meta);
        out.push(Normalized::Meta(meta));
        lines.next();
    }

    let body = lines.collect::<Vec<_>>().join("\n");
    if body.trim().is_empty() {
        return Ok(out);
    }
    if let Some(statement) = sql_unit(&body, vars)? {
        out.push(Normalized::Sql(statement));
    }
    Ok(out)
}

fn sql_unit(body: &str, vars: &Variables) -> Result<Option<NormalizedStatement>, NormalizeError> {
    let chars: Vec<char> = body.chars().collect();
    if let Some(semi) = statement_end(&chars) {
        let command: String = chars[..=semi].iter().collect();
        let sql = strip_and_interpolate(&command, vars)?;
        if is_copy_from_stdin(&sql) {
            let rest: String = chars[semi + 1..].iter().collect();
            let (tail, data) = rest.split_once('\n').unwrap_or((rest.as_str(), ""));
            return Ok(Some(NormalizedStatement {
                sql: sql.trim().to_string(),
                display: format!("{command}{tail}").trim().to_string(),
                copy_payload: Some(copy_payload(data)?),
                gset_prefix: None,
            }));
        }
    }

    let mut sql = strip_and_interpolate(body, vars)?;
    let gset_prefix = take_gset(&mut sql);
    let sql = sql.trim().to_string();
    if sql.is_empty() {
        return Ok(None);
    }
    Ok(Some(NormalizedStatement {
        sql,
        display: body.trim().to_string(),
        copy_payload: None,
        gset_prefix,
    }))
}

fn is_copy_from_stdin(sql: &str) -> bool {
    let collapsed = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    collapsed.starts_with("copy ") && collapsed.contains(" from stdin")
}

fn copy_payload(data: &str) -> Result<String, NormalizeError> {
    let mut payload = String::new();
    let mut lines = data.lines();
    let mut terminated = false;
    for line in lines.by_ref() {
        if line.trim_end() == "\\." {
            terminated = true;
            break;
        }
        payload.push_str(line);
        payload.push('\n');
    }
    if !terminated {
        // Trailing blank lines are fixture formatting, not data.
        while payload.ends_with("\n\n") {
            payload.pop();
        }
        if payload.trim().is_empty() {
            payload.clear();
        }
    } else if lines.any(|line| !line.trim().is_empty()) {
        return Err(NormalizeError::TrailingCopyData);
    }
    Ok(payload)
}

/// Remove a trailing `\gset [prefix]` that sits outside quotes and return the prefix.
fn take_gset(sql: &mut String) -> Option<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut found = None;
    let mut i = 0;
    while i < chars.len() {
        if let Some((_, end)) = opaque_span(&chars, i) {
            i = end;
            continue;
        }
        if chars[i] == '\\' && chars[i + 1..].starts_with(&['g', 's', 'e', 't']) {
            found = Some(i);
        }
        i += 1;
    }
    let pos = found?;
    let after: String = chars[pos + "\\gset".len()..].iter().collect();
    if !after.is_empty() && !after.starts_with(char::is_whitespace) {
        return None;
    }
    let prefix = after.trim();
    if prefix.contains(char::is_whitespace) {
        return None;
    }
    let prefix = prefix.to_string();
    let head: String = chars[..pos].iter().collect();
    *sql = head.trim_end().to_string();
    Some(prefix)
}

fn is_var_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opaque {
    Quoted,
    BlockComment,
    LineComment,
}

/// Region starting at `i` that interpolation must not touch, with its end.
fn opaque_span(chars: &[char], i: usize) -> Option<(Opaque, usize)> {
    let prev_is_word = i > 0 && is_var_char(chars[i - 1]);
    match (chars[i], chars.get(i + 1).copied()) {
        ('\'', _) => {
            let escaped = i > 0
                && matches!(chars[i - 1], 'e' | 'E')
                && (i < 2 || !is_var_char(chars[i - 2]));
            Some((Opaque::Quoted, scan_quoted(chars, i, '\'', escaped)))
        }
        ('"', _) => Some((Opaque::Quoted, scan_quoted(chars, i, '"', false))),
        ('$', _) if !prev_is_word => {
            dollar_tag(chars, i).map(|len| (Opaque::Quoted, scan_dollar(chars, i, len)))
        }
        ('/', Some('*')) => Some((Opaque::BlockComment, scan_block_comment(chars, i))),
        ('-', Some('-')) => {
            let end = chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |p| i + p);
            Some((Opaque::LineComment, end))
        }
        _ => None,
    }
}

fn scan_quoted(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if backslash_escapes && c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Length of a `$tag$` opener at `i`, both dollars included.
fn dollar_tag(chars: &[char], i: usize) -> Option<usize> {
    let mut j = i + 1;
    match chars.get(j) {
        Some('$') => return Some(2),
        Some(&c) if is_var_start(c) => {}
        _ => return None,
    }
    while j < chars.len() && is_var_char(chars[j]) {
        j += 1;
    }
    (chars.get(j) == Some(&'$')).then_some(j - i + 1)
}

fn scan_dollar(chars: &[char], start: usize, tag_len: usize) -> usize {
    let tag = &chars[start..start + tag_len];
    let body = start + tag_len;
    chars[body..]
        .windows(tag_len)
        .position(|window| window == tag)
        .map_or(chars.len(), |p| body + p + tag_len)
}

fn scan_block_comment(chars: &[char], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// Index of the first `;` outside quotes and comments.
fn statement_end(chars: &[char]) -> Option<usize> {
    let mut i = 0;
    while i < chars.len() {
        if let Some((_, end)) = opaque_span(chars, i) {
            i = end;
            continue;
        }
        if chars[i] == ';' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn quote_literal(value: &str) -> String {
    let body = value.replace('\'', "''");
    if body.contains('\\') {
        format!("E'{}'", body.replace('\\', "\\\\"))
    } else {
        format!("'{body}'")
    }
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Expand the variable reference at `chars[i] == ':'`, returning the text and the
/// index after the reference. `None` when `i` does not start a resolvable reference.
/// Only the quoted forms `:'name'` and `:"name"` are required to resolve.
fn interpolate(
    chars: &[char],
    i: usize,
    vars: &Variables,
) -> Result<Option<(String, usize)>, NormalizeError> {
    match chars.get(i + 1).copied() {
        Some(quote @ ('\'' | '"')) => {
            let start = i + 2;
            let mut j = start;
            while j < chars.len() && is_var_char(chars[j]) {
                j += 1;
            }
            if j == start || chars.get(j) != Some(&quote) {
                return Ok(None);
            }
            let name: String = chars[start..j].iter().collect();
            let Some(value) = vars.resolve(&name)? else {
                return Ok(None);
            };
            let text = if quote == '\'' {
                quote_literal(value)
            } else {
                quote_ident(value)
            };
            Ok(Some((text, j + 1)))
        }
        Some(c) if is_var_start(c) => {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && is_var_char(chars[j]) {
                j += 1;
            }
            let name: String = chars[start..j].iter().collect();
            // psql leaves an unbound bare reference as written (`[1:NULL]` slices).
            Ok(vars.get(&name).map(|value| (value.to_string(), j)))
        }
        _ => Ok(None),
    }
}

/// Strip `--` comments and interpolate variables outside quoted regions.
fn strip_and_interpolate(sql: &str, vars: &Variables) -> Result<String, NormalizeError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        if let Some((kind, end)) = opaque_span(&chars, i) {
            if kind == Opaque::LineComment {
                let keep = out.trim_end_matches([' ', '\t']).len();
                out.truncate(keep);
            } else {
                out.extend(&chars[i..end]);
            }
            i = end;
            continue;
        }
        match (chars[i], chars.get(i + 1).copied()) {
            (':', Some(':')) => {
                out.push_str("::");
                i += 2;
            }
            (':', _) => match interpolate(&chars, i, vars)? {
                Some((text, end)) => {
                    out.push_str(&text);
                    i = end;
                }
                None => {
                    out.push(':');
                    i += 1;
                }
            },
            (c, _) => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn parse_meta(command: &str, vars: &Variables) -> Result<MetaCommand, NormalizeError> {
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .unwrap_or((command, ""));
    let args = if matches!(name, "set" | "unset" | "getenv") {
        meta_args(rest, vars)?
    } else {
        let mut lenient = vars.clone();
        lenient.set_lenient(true);
        meta_args(rest, &lenient)?
    };
    Ok(MetaCommand {
        name: name.to_string(),
        args,
    })
}

/// Split meta-command arguments the way psql does: whitespace separated, single
/// quotes unescaped, double quotes kept, variables interpolated.
fn meta_args(text: &str, vars: &Variables) -> Result<Vec<String>, NormalizeError> {
    let chars: Vec<char> = text.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let mut token = String::new();
        while i < chars.len() && !chars[i].is_whitespace() {
            match chars[i] {
                '\'' => {
                    i += 1;
                    while i < chars.len() {
                        match (chars[i], chars.get(i + 1).copied()) {
                            ('\'', Some('\'')) => {
                                token.push('\'');
                                i += 2;
                            }
                            ('\'', _) => {
                                i += 1;
                                break;
                            }
                            ('\\', Some(escaped)) => {
                                token.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    'r' => '\r',
                                    other => other,
                                });
                                i += 2;
                            }
                            (c, _) => {
                                token.push(c);
                                i += 1;
                            }
                        }
                    }
                }
                '"' => {
                    let end = scan_quoted(&chars, i, '"', false);
                    token.extend(&chars[i..end]);
                    i = end;
                }
                ':' => match interpolate(&chars, i, vars)? {
                    Some((text, end)) => {
                        token.push_str(&text);
                        i = end;
                    }
                    None => {
                        token.push(':');
                        i += 1;
                    }
                },
                c => {
                    token.push(c);
                    i += 1;
                }
            }
        }
        args.push(token);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        Variables::new(BTreeMap::new(), BTreeMap::new(), false)
    }

    fn only_sql(items: Vec<Normalized>) -> NormalizedStatement {
        match items.as_slice() {
            [Normalized::Sql(stmt)] => stmt.clone(),
            other => panic!("expected one SQL unit, got {other:?}"),
        }
    }

    #[test]
    fn trailing_comment_is_stripped_but_displayed() {
        let mut v = vars();
        let stmt = only_sql(
            normalize(
                "INSERT INTO basictest values ('88', 'haha', 'short', '123.1212');    -- Truncate numeric",
                &mut v,
            )
            .unwrap(),
        );
        assert_eq!(
            stmt.sql,
            "INSERT INTO basictest values ('88', 'haha', 'short', '123.1212');"
        );
        assert!(stmt.display.ends_with("-- Truncate numeric"));
    }

    #[test]
    fn comment_markers_inside_literals_survive() {
        let mut v = vars();
        let stmt = only_sql(normalize("select '--not a comment', $$ -- body $$;", &mut v).unwrap());
        assert_eq!(stmt.sql, "select '--not a comment', $$ -- body $$;");
    }

    #[test]
    fn leading_meta_commands_bind_variables_in_order() {
        let mut env = BTreeMap::new();
        env.insert("PG_LIBDIR".to_string(), "/usr/lib/postgresql".to_string());
        let mut v = Variables::new(
            BTreeMap::from([("dlsuffix".to_string(), ".so".to_string())]),
            env,
            false,
        );
        let items = normalize(
            "\\getenv libdir PG_LIBDIR\n\\set regresslib :libdir '/regress' :dlsuffix\nLOAD :'regresslib';",
            &mut v,
        )
        .unwrap();
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], Normalized::Meta(m) if m.name == "getenv"));
        assert_eq!(v.get("regresslib"), Some("/usr/lib/postgresql/regress.so"));
        match &items[2] {
            Normalized::Sql(stmt) => {
                assert_eq!(stmt.sql, "LOAD '/usr/lib/postgresql/regress.so';");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unset_environment_leaves_variable_unbound() {
        let mut v = vars();
        let items = normalize("\\getenv libdir PG_NOT_SET_ANYWHERE", &mut v).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(v.get("libdir"), None);
    }

    #[test]
    fn casts_and_quoted_regions_are_not_interpolated() {
        let mut v = vars();
        v.set("tbl", "basictest");
        let stmt = only_sql(
            normalize(
                "select ':tbl', \":tbl\", x::text, '{\"a\":1}'::jsonb from :tbl /* :tbl */;",
                &mut v,
            )
            .unwrap(),
        );
        assert_eq!(
            stmt.sql,
            "select ':tbl', \":tbl\", x::text, '{\"a\":1}'::jsonb from basictest /* :tbl */;"
        );
    }

    #[test]
    fn quoted_variable_forms() {
        let mut v = vars();
        v.set("name", "it's");
        let stmt = only_sql(normalize("select :'name', :\"name\";", &mut v).unwrap());
        assert_eq!(stmt.sql, "select 'it''s', \"it's\";");
    }

    #[test]
    fn unresolved_quoted_variable_is_an_error() {
        let mut v = vars();
        assert_eq!(
            normalize("LOAD :'missing';", &mut v),
            Err(NormalizeError::UnresolvedVariable("missing".into()))
        );
        assert_eq!(
            normalize("select * from :\"missing\";", &mut v),
            Err(NormalizeError::UnresolvedVariable("missing".into()))
        );
        v.set_lenient(true);
        let stmt = only_sql(normalize("LOAD :'missing';", &mut v).unwrap());
        assert_eq!(stmt.sql, "LOAD :'missing';");
    }

    #[test]
    fn unbound_bare_reference_is_left_as_written() {
        let mut v = vars();
        let stmt = only_sql(normalize("select :missing;", &mut v).unwrap());
        assert_eq!(stmt.sql, "select :missing;");

        let slice = "SELECT ('{{{1},{2},{3}},{{4},{5},{6}}}'::int[])[1][1:NULL][1];";
        let stmt = only_sql(normalize(slice, &mut v).unwrap());
        assert_eq!(stmt.sql, slice);

        v.set("NULL", "2");
        let stmt = only_sql(normalize("select (array[1,2,3])[1:NULL];", &mut v).unwrap());
        assert_eq!(stmt.sql, "select (array[1,2,3])[1:2];");
    }

    #[test]
    fn copy_payload_is_attached() {
        let mut v = vars();
        let stmt = only_sql(
            normalize(
                "COPY domcontest FROM stdin; -- fail\n1\t2\n3\t4\n\\.\n",
                &mut v,
            )
            .unwrap(),
        );
        assert_eq!(stmt.sql, "COPY domcontest FROM stdin;");
        assert_eq!(stmt.copy_payload.as_deref(), Some("1\t2\n3\t4\n"));
        assert_eq!(stmt.display, "COPY domcontest FROM stdin; -- fail");
        assert_eq!(
            stmt.to_engine().copy_payload.as_deref(),
            Some("1\t2\n3\t4\n")
        );
    }

    #[test]
    fn copy_without_terminator_takes_rest_of_text() {
        let mut v = vars();
        let stmt = only_sql(normalize("copy t from stdin;\na\nb", &mut v).unwrap());
        assert_eq!(stmt.copy_payload.as_deref(), Some("a\nb\n"));
    }

    #[test]
    fn text_after_copy_terminator_is_rejected() {
        let mut v = vars();
        assert_eq!(
            normalize("copy t from stdin;\na\n\\.\nselect 1;", &mut v),
            Err(NormalizeError::TrailingCopyData)
        );
    }

    #[test]
    fn trailing_gset_is_recorded() {
        let mut v = vars();
        let stmt = only_sql(normalize("select 1 as one, 2 as two \\gset pre_", &mut v).unwrap());
        assert_eq!(stmt.sql, "select 1 as one, 2 as two");
        assert_eq!(stmt.gset_prefix.as_deref(), Some("pre_"));

        let bare = only_sql(normalize("select current_user as me\n\\gset", &mut v).unwrap());
        assert_eq!(bare.gset_prefix.as_deref(), Some(""));

        let quoted = only_sql(normalize("select 'see \\gset docs' as hint", &mut v).unwrap());
        assert_eq!(quoted.sql, "select 'see \\gset docs' as hint");
        assert_eq!(quoted.gset_prefix, None);

        let literal_last = only_sql(normalize("select E'\\gset'", &mut v).unwrap());
        assert_eq!(literal_last.gset_prefix, None);
    }

    #[test]
    fn comment_only_statement_has_no_sql() {
        let mut v = vars();
        assert!(normalize("-- nothing to see", &mut v).unwrap().is_empty());
    }

    #[test]
    fn unknown_meta_commands_keep_arguments() {
        let mut v = vars();
        let items = normalize("\\d+ basictest", &mut v).unwrap();
        assert_eq!(
            items,
            vec![Normalized::Meta(MetaCommand {
                name: "d+".into(),
                args: vec!["basictest".into()],
            })]
        );
    }

    #[test]
    fn unset_removes_binding() {
        let mut v = vars();
        normalize("\\set x 'a b'\n\\unset y", &mut v).unwrap();
        assert_eq!(v.get("x"), Some("a b"));
        normalize("\\unset x", &mut v).unwrap();
        assert_eq!(v.get("x"), None);
    }
}
